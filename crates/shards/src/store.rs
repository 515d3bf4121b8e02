use crate::format::{read_header, write_shard, RepoSection, SectionSource, ShardFile, ShardHeader};
use crate::fsutil::{commit_file, remove_if_exists, stage_file};
use crate::lease::{try_acquire_writer_lock, RepoLease, WriterLock};
use crate::naming::{
    final_path_for, is_shard_file, is_temp_file, parse_shard_name, simple_shard_name,
    temp_path_for, ShardName,
};
use crate::report::RecoveryReport;
use crate::shard::{Shard, ShardMeta};
use crate::{Result, ShardError};
use indexserver_protocol::{Branch, RepoId};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use walkdir::WalkDir;

/// The newest on-disk copy of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedRepo {
    pub name: String,
    pub branches: Vec<Branch>,
    pub shard: PathBuf,
    pub generation: u64,
}

/// The directory as a pending recovery would leave it: completed temp files
/// appear under their final names and finished replacements disappear.
#[derive(Debug, Default)]
pub(crate) struct RecoveryView {
    completed: BTreeMap<PathBuf, PathBuf>,
    removed: HashSet<PathBuf>,
}

impl RecoveryView {
    pub(crate) fn preview(report: &RecoveryReport) -> Self {
        Self {
            completed: report
                .completed
                .iter()
                .map(|target| (target.clone(), temp_path_for(target)))
                .collect(),
            removed: report.finished_replacements.iter().cloned().collect(),
        }
    }

    /// The file that holds the bytes of `path`.
    pub(crate) fn source<'a>(&'a self, path: &'a Path) -> &'a Path {
        self.completed.get(path).map_or(path, PathBuf::as_path)
    }
}

/// A directory of shard files. The directory is the only durable state:
/// membership, sizes and generations are all recovered by scanning it.
///
/// A writable store holds `writer.lock` until dropped; read-only stores can
/// scan but never write.
pub struct ShardStore {
    dir: PathBuf,
    generation: AtomicU64,
    writer: Option<WriterLock>,
}

impl ShardStore {
    /// Opens `dir` for writing. Fails with [`ShardError::DirectoryBusy`] while
    /// another writable store is open on it, in this process or another.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::check_dir(dir)?;
        let writer = try_acquire_writer_lock(dir)?;
        Self::load(dir, Some(writer))
    }

    pub fn open_read_only(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Self::check_dir(dir)?;
        Self::load(dir, None)
    }

    fn check_dir(dir: &Path) -> Result<()> {
        let meta = std::fs::metadata(dir).map_err(|err| {
            ShardError::InvalidPath(format!("{}: {err}", dir.display()))
        })?;
        if !meta.is_dir() {
            return Err(ShardError::InvalidPath(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        Ok(())
    }

    fn load(dir: &Path, writer: Option<WriterLock>) -> Result<Self> {
        let store = Self {
            dir: dir.to_path_buf(),
            generation: AtomicU64::new(0),
            writer,
        };
        let highest = store
            .read_files()?
            .iter()
            .map(|f| f.header.generation)
            .max()
            .unwrap_or(0);
        store.observe_generation(highest);
        debug!(
            "opened shard store {} at generation {highest}",
            store.dir.display()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_writable(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(ShardError::ReadOnly(self.dir.display().to_string()))
        }
    }

    /// Reserves a generation strictly greater than any seen so far.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn observe_generation(&self, generation: u64) {
        self.generation.fetch_max(generation, Ordering::SeqCst);
    }

    fn entries(&self, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|err| ShardError::Other(format!("scan shards: {err}")))?;
            if entry.file_type().is_file() && keep(entry.path()) {
                out.push(entry.into_path());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Leftover `*.shard.tmp` files from interrupted writes.
    pub fn temp_files(&self) -> Result<Vec<PathBuf>> {
        self.entries(is_temp_file)
    }

    pub fn shard_paths(&self) -> Result<Vec<PathBuf>> {
        self.entries(is_shard_file)
    }

    fn read_files(&self) -> Result<Vec<ShardFile>> {
        self.read_files_in(&RecoveryView::default())
    }

    fn read_files_in(&self, view: &RecoveryView) -> Result<Vec<ShardFile>> {
        let mut paths: Vec<PathBuf> = self
            .shard_paths()?
            .into_iter()
            .filter(|p| !view.removed.contains(p))
            .collect();
        paths.extend(view.completed.keys().cloned());
        paths.sort();
        paths.dedup();

        let mut files = Vec::new();
        for path in paths {
            match read_header(view.source(&path)) {
                Ok(mut file) => {
                    file.path = path;
                    files.push(file);
                }
                Err(ShardError::IoError(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!("shard {} vanished during scan", path.display());
                }
                Err(err) => warn!("skipping unreadable shard {}: {err}", path.display()),
            }
        }
        Ok(files)
    }

    /// All readable shards, ordered by path, with staleness resolved: a
    /// repository is live only in the shard holding its highest generation.
    pub fn scan(&self) -> Result<Vec<Shard>> {
        self.scan_in(&RecoveryView::default())
    }

    pub(crate) fn scan_in(&self, view: &RecoveryView) -> Result<Vec<Shard>> {
        let files = self.read_files_in(view)?;

        let mut newest: HashMap<RepoId, (u64, &Path)> = HashMap::new();
        for file in &files {
            for section in &file.header.repos {
                let candidate = (file.header.generation, file.path.as_path());
                newest
                    .entry(section.id)
                    .and_modify(|current| {
                        if candidate > *current {
                            *current = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }
        let live_by_path: HashMap<PathBuf, HashSet<RepoId>> =
            newest.iter().fold(HashMap::new(), |mut acc, (id, (_, path))| {
                acc.entry(path.to_path_buf()).or_default().insert(*id);
                acc
            });

        let empty = HashSet::new();
        Ok(files
            .into_iter()
            .map(|file| {
                let live = live_by_path.get(&file.path).unwrap_or(&empty);
                Shard::from_file(file, live)
            })
            .collect())
    }

    /// Live repositories and where their newest data sits.
    pub fn indexed(&self) -> Result<BTreeMap<RepoId, IndexedRepo>> {
        self.indexed_in(&RecoveryView::default())
    }

    pub(crate) fn indexed_in(&self, view: &RecoveryView) -> Result<BTreeMap<RepoId, IndexedRepo>> {
        let mut out = BTreeMap::new();
        for shard in self.scan_in(view)? {
            let meta = shard.meta();
            for section in shard.sections() {
                if meta.repository_ids.binary_search(&section.id).is_ok() {
                    out.insert(
                        section.id,
                        IndexedRepo {
                            name: section.name.clone(),
                            branches: section.branches.clone(),
                            shard: meta.path.clone(),
                            generation: meta.generation,
                        },
                    );
                }
            }
        }
        Ok(out)
    }

    /// Highest generation named by any shard or temp file in the directory.
    fn highest_named_generation(&self, shards: &[PathBuf]) -> Result<u64> {
        let staged: Vec<PathBuf> = self
            .temp_files()?
            .iter()
            .filter_map(|t| final_path_for(t))
            .collect();
        Ok(shards
            .iter()
            .chain(&staged)
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter_map(parse_shard_name)
            .map(|name| name.generation())
            .max()
            .unwrap_or(0))
    }

    /// Writes a fresh simple shard for the leased repository and retires the
    /// older simple shards of that repository. Copies inside compound shards
    /// become stale and are dropped by later merges.
    pub fn commit_simple(
        &self,
        lease: &RepoLease,
        name: &str,
        branches: &[Branch],
        content: &[u8],
    ) -> Result<ShardMeta> {
        self.ensure_writable()?;
        let repo_id = lease.repo_id();
        let existing = self.shard_paths()?;
        self.observe_generation(self.highest_named_generation(&existing)?);
        let generation = self.next_generation();
        let path = self.dir.join(simple_shard_name(repo_id, generation));
        let header = ShardHeader::new(
            generation,
            vec![RepoSection {
                id: repo_id,
                name: name.to_string(),
                branches: branches.to_vec(),
                offset: 0,
                len: content.len() as u64,
            }],
            Vec::new(),
        );

        let tmp = temp_path_for(&path);
        let sources = [SectionSource::Bytes(content)];
        let size = stage_file(&tmp, |out| write_shard(out, &header, &sources))?;
        commit_file(&tmp, &path)?;
        info!(
            "wrote shard {} for repository {repo_id} ({size} bytes)",
            path.display()
        );

        for old in existing {
            let Some(ShardName::Simple {
                repo_id: old_id,
                generation: old_generation,
            }) = old
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_shard_name)
            else {
                continue;
            };
            if old_id == repo_id && old_generation < generation && remove_if_exists(&old)? {
                debug!("retired {}", old.display());
            }
        }

        Ok(ShardMeta {
            path,
            size,
            repository_ids: vec![repo_id],
            generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LeaseTable;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn open_rejects_missing_directory() {
        let temp = TempDir::new().expect("tempdir");
        let missing = temp.path().join("nope");
        assert!(matches!(
            ShardStore::open(&missing),
            Err(ShardError::InvalidPath(_))
        ));
    }

    #[test]
    fn commit_simple_replaces_previous_simple_shard() {
        let temp = TempDir::new().expect("tempdir");
        let store = ShardStore::open(temp.path()).expect("store");
        let leases = LeaseTable::new();
        let lease = leases.try_lease_repo(7).expect("lease");

        let first = store
            .commit_simple(&lease, "acme/web", &[Branch::new("main", "a")], b"one")
            .expect("first");
        let second = store
            .commit_simple(&lease, "acme/web", &[Branch::new("main", "b")], b"two")
            .expect("second");

        assert!(!first.path.exists());
        assert!(second.path.exists());
        assert!(second.generation > first.generation);
        assert_eq!(store.temp_files().expect("temps"), Vec::<PathBuf>::new());

        let indexed = store.indexed().expect("indexed");
        assert_eq!(indexed[&7].branches, vec![Branch::new("main", "b")]);
        assert_eq!(indexed[&7].name, "acme/web");
    }

    #[test]
    fn reopening_resumes_generation_counter() {
        let temp = TempDir::new().expect("tempdir");
        let leases = LeaseTable::new();
        let generation = {
            let store = ShardStore::open(temp.path()).expect("store");
            let lease = leases.try_lease_repo(1).expect("lease");
            store.commit_simple(&lease, "r", &[], b"x").expect("commit").generation
        };
        let store = ShardStore::open(temp.path()).expect("reopen");
        assert_eq!(store.current_generation(), generation);
        assert!(store.next_generation() > generation);
    }

    #[test]
    fn second_writable_store_is_refused() {
        let temp = TempDir::new().expect("tempdir");
        let first = ShardStore::open(temp.path()).expect("store");
        assert!(matches!(
            ShardStore::open(temp.path()),
            Err(ShardError::DirectoryBusy(_))
        ));

        let reader = ShardStore::open_read_only(temp.path()).expect("read-only");
        assert!(!reader.is_writable());
        let leases = LeaseTable::new();
        let lease = leases.try_lease_repo(1).expect("lease");
        assert!(matches!(
            reader.commit_simple(&lease, "r", &[], b"x"),
            Err(ShardError::ReadOnly(_))
        ));

        drop(first);
        assert!(ShardStore::open(temp.path()).is_ok());
    }

    #[test]
    fn commit_simple_outranks_shards_that_appeared_after_open() {
        let temp = TempDir::new().expect("tempdir");
        let store = ShardStore::open(temp.path()).expect("store");
        let leases = LeaseTable::new();
        let one = leases.try_lease_repo(1).expect("lease");
        let first = store.commit_simple(&one, "r1", &[], b"old").expect("commit");
        drop(one);

        let foreign = temp.path().join("compound-0123456789abcdef.g40.shard");
        std::fs::copy(&first.path, &foreign).expect("copy");

        let again = leases.try_lease_repo(1).expect("lease");
        let fresh = store.commit_simple(&again, "r1", &[], b"new").expect("commit");
        assert_eq!(fresh.generation, 41);
        assert_eq!(store.indexed().expect("indexed")[&1].shard, fresh.path);
    }

    #[test]
    fn corrupt_files_are_skipped_by_scan() {
        let temp = TempDir::new().expect("tempdir");
        std::fs::write(temp.path().join("repo-1.g1.shard"), b"not a shard").expect("write");
        std::fs::write(temp.path().join("notes.txt"), b"ignored").expect("write");
        let store = ShardStore::open(temp.path()).expect("store");
        assert!(store.scan().expect("scan").is_empty());
    }
}
