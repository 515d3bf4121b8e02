use indexserver_protocol::RepoId;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const SHARD_EXTENSION: &str = "shard";
pub const TEMP_SUFFIX: &str = ".tmp";
pub const MERGE_LOCK_FILE_NAME: &str = "merge.lock";
pub const WRITER_LOCK_FILE_NAME: &str = "writer.lock";

const COMPOUND_PREFIX: &str = "compound-";
const SIMPLE_PREFIX: &str = "repo-";

/// Parsed form of a shard file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardName {
    Simple { repo_id: RepoId, generation: u64 },
    Compound { generation: u64 },
}

impl ShardName {
    pub fn generation(self) -> u64 {
        match self {
            Self::Simple { generation, .. } | Self::Compound { generation } => generation,
        }
    }
}

pub fn simple_shard_name(repo_id: RepoId, generation: u64) -> String {
    format!("{SIMPLE_PREFIX}{repo_id}.g{generation}.{SHARD_EXTENSION}")
}

/// Names a compound shard after its members so the same bin always maps to
/// the same file name.
pub fn compound_shard_name(repo_ids: &[RepoId], generation: u64) -> String {
    let mut ids = repo_ids.to_vec();
    ids.sort_unstable();
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.to_le_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{COMPOUND_PREFIX}{hex}.g{generation}.{SHARD_EXTENSION}")
}

pub fn parse_shard_name(file_name: &str) -> Option<ShardName> {
    let stem = file_name.strip_suffix(&format!(".{SHARD_EXTENSION}"))?;
    let (head, generation) = stem.rsplit_once(".g")?;
    let generation = generation.parse::<u64>().ok()?;
    if let Some(id) = head.strip_prefix(SIMPLE_PREFIX) {
        let repo_id = id.parse::<RepoId>().ok()?;
        return Some(ShardName::Simple {
            repo_id,
            generation,
        });
    }
    head.strip_prefix(COMPOUND_PREFIX)
        .map(|_| ShardName::Compound { generation })
}

pub fn is_shard_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SHARD_EXTENSION)
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(&format!(".{SHARD_EXTENSION}{TEMP_SUFFIX}")))
}

pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Inverse of [`temp_path_for`].
pub fn final_path_for(temp: &Path) -> Option<PathBuf> {
    let name = temp.file_name()?.to_str()?;
    let final_name = name.strip_suffix(TEMP_SUFFIX)?;
    Some(temp.with_file_name(final_name))
}
