use crate::format::{RepoSection, ShardFile};
use indexserver_protocol::RepoId;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;

/// What planning needs to know about a shard file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardMeta {
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Repositories whose newest data lives in this shard, ascending.
    pub repository_ids: Vec<RepoId>,
    pub generation: u64,
}

impl ShardMeta {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A shard found in the store, tagged by how many repositories it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shard {
    Simple { meta: ShardMeta, repo: RepoSection },
    Compound { meta: ShardMeta, repos: Vec<RepoSection> },
}

impl Shard {
    /// Builds the variant from a parsed file, keeping only `live` ids in the
    /// meta's membership.
    pub(crate) fn from_file(file: ShardFile, live: &HashSet<RepoId>) -> Self {
        let mut repository_ids: Vec<RepoId> = file
            .header
            .repos
            .iter()
            .map(|s| s.id)
            .filter(|id| live.contains(id))
            .collect();
        repository_ids.sort_unstable();
        repository_ids.dedup();
        let meta = ShardMeta {
            path: file.path,
            size: file.len,
            repository_ids,
            generation: file.header.generation,
        };
        let mut repos = file.header.repos;
        if repos.len() == 1 {
            let repo = repos.remove(0);
            Shard::Simple { meta, repo }
        } else {
            Shard::Compound { meta, repos }
        }
    }

    pub fn meta(&self) -> &ShardMeta {
        match self {
            Shard::Simple { meta, .. } | Shard::Compound { meta, .. } => meta,
        }
    }

    pub fn into_meta(self) -> ShardMeta {
        match self {
            Shard::Simple { meta, .. } | Shard::Compound { meta, .. } => meta,
        }
    }

    pub fn sections(&self) -> &[RepoSection] {
        match self {
            Shard::Simple { repo, .. } => std::slice::from_ref(repo),
            Shard::Compound { repos, .. } => repos,
        }
    }

    /// Every repository id with a section in the file, live or stale.
    pub fn member_ids(&self) -> Vec<RepoId> {
        self.sections().iter().map(|s| s.id).collect()
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, Shard::Compound { .. })
    }

    /// True when every section has been superseded by a newer shard.
    pub fn is_dead(&self) -> bool {
        self.meta().repository_ids.is_empty()
    }
}
