use crate::naming::{MERGE_LOCK_FILE_NAME, WRITER_LOCK_FILE_NAME};
use crate::{Result, ShardError};
use fs2::FileExt;
use indexserver_protocol::RepoId;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Default)]
struct LeaseState {
    indexing: HashSet<RepoId>,
    merging: HashMap<PathBuf, Vec<RepoId>>,
}

impl LeaseState {
    fn repo_in_merge(&self, repo_id: RepoId) -> bool {
        self.merging.values().any(|ids| ids.contains(&repo_id))
    }
}

/// Exclusion between indexing workers and the merge engine.
///
/// A worker leases the repository it is about to rewrite; a merge leases the
/// shard paths it consumes, together with every repository stored in them.
/// Either side is refused while the other holds an overlapping lease.
#[derive(Default)]
pub struct LeaseTable {
    state: Mutex<LeaseState>,
    released: Notify,
}

impl LeaseTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_lease_repo(self: &Arc<Self>, repo_id: RepoId) -> Option<RepoLease> {
        let mut state = self.lock();
        if state.indexing.contains(&repo_id) || state.repo_in_merge(repo_id) {
            return None;
        }
        state.indexing.insert(repo_id);
        Some(RepoLease {
            table: Arc::clone(self),
            repo_id,
        })
    }

    /// Waits until the repository can be leased.
    pub async fn lease_repo(self: &Arc<Self>, repo_id: RepoId) -> RepoLease {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if let Some(lease) = self.try_lease_repo(repo_id) {
                return lease;
            }
            released.await;
        }
    }

    /// Leases `path` for a merge. `members` must list every repository with a
    /// section in the file, stale ones included.
    pub fn try_lease_shard(self: &Arc<Self>, path: &Path, members: &[RepoId]) -> Option<ShardLease> {
        let mut state = self.lock();
        if state.merging.contains_key(path) || members.iter().any(|id| state.indexing.contains(id))
        {
            return None;
        }
        state.merging.insert(path.to_path_buf(), members.to_vec());
        Some(ShardLease {
            table: Arc::clone(self),
            path: path.to_path_buf(),
        })
    }

    /// Whether a merge lease on `path` would currently be refused.
    pub fn shard_conflicts(&self, path: &Path, members: &[RepoId]) -> bool {
        let state = self.lock();
        state.merging.contains_key(path) || members.iter().any(|id| state.indexing.contains(id))
    }

    pub fn is_repo_leased(&self, repo_id: RepoId) -> bool {
        let state = self.lock();
        state.indexing.contains(&repo_id) || state.repo_in_merge(repo_id)
    }

    fn release_repo(&self, repo_id: RepoId) {
        self.lock().indexing.remove(&repo_id);
        self.released.notify_waiters();
    }

    fn release_shard(&self, path: &Path) {
        self.lock().merging.remove(path);
        self.released.notify_waiters();
    }
}

/// Held by an indexing worker while it rewrites one repository's shard.
pub struct RepoLease {
    table: Arc<LeaseTable>,
    repo_id: RepoId,
}

impl RepoLease {
    pub fn repo_id(&self) -> RepoId {
        self.repo_id
    }
}

impl Drop for RepoLease {
    fn drop(&mut self) {
        self.table.release_repo(self.repo_id);
    }
}

/// Held by the merge engine while a shard is an input of a running merge.
pub struct ShardLease {
    table: Arc<LeaseTable>,
    path: PathBuf,
}

impl ShardLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ShardLease {
    fn drop(&mut self) {
        self.table.release_shard(&self.path);
    }
}

/// Opens `path` and takes an exclusive fs2 lock on it without blocking.
/// `Ok(None)` means another handle holds the lock.
fn try_lock_file(path: &Path) -> Result<Option<File>> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|err| ShardError::Other(format!("open lock {}: {err}", path.display())))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(err) => Err(ShardError::Other(format!(
            "acquire lock {}: {err}",
            path.display()
        ))),
    }
}

/// Exclusive lock on `<dir>/merge.lock`; at most one merge runs per shard
/// directory.
pub struct MergeLock {
    file: File,
}

impl Drop for MergeLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub fn merge_lock_path(dir: &Path) -> PathBuf {
    dir.join(MERGE_LOCK_FILE_NAME)
}

pub fn try_acquire_merge_lock(dir: &Path) -> Result<MergeLock> {
    match try_lock_file(&merge_lock_path(dir))? {
        Some(file) => Ok(MergeLock { file }),
        None => Err(ShardError::MergeInProgress(dir.display().to_string())),
    }
}

/// Exclusive lock on `<dir>/writer.lock`, held for as long as a process may
/// write shards. Leases and the generation counter live in memory, so a
/// second writing process is refused outright.
pub struct WriterLock {
    file: File,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub fn writer_lock_path(dir: &Path) -> PathBuf {
    dir.join(WRITER_LOCK_FILE_NAME)
}

pub fn try_acquire_writer_lock(dir: &Path) -> Result<WriterLock> {
    match try_lock_file(&writer_lock_path(dir))? {
        Some(file) => Ok(WriterLock { file }),
        None => Err(ShardError::DirectoryBusy(dir.display().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn repo_lease_is_exclusive_until_dropped() {
        let table = LeaseTable::new();
        let lease = table.try_lease_repo(1).expect("first lease");
        assert!(table.try_lease_repo(1).is_none());
        assert!(table.try_lease_repo(2).is_some());
        drop(lease);
        assert!(table.try_lease_repo(1).is_some());
    }

    #[test]
    fn shard_lease_blocks_member_repositories() {
        let table = LeaseTable::new();
        let path = Path::new("/idx/compound-a.g3.shard");
        let lease = table.try_lease_shard(path, &[1, 2]).expect("shard lease");
        assert!(table.try_lease_repo(2).is_none());
        assert!(table.is_repo_leased(1));
        assert!(table.try_lease_shard(path, &[9]).is_none());
        drop(lease);
        assert!(table.try_lease_repo(2).is_some());
    }

    #[test]
    fn indexing_lease_blocks_shard_lease() {
        let table = LeaseTable::new();
        let _worker = table.try_lease_repo(5).expect("repo lease");
        let path = Path::new("/idx/repo-5.g1.shard");
        assert!(table.shard_conflicts(path, &[5]));
        assert!(table.try_lease_shard(path, &[5]).is_none());
        assert!(!table.shard_conflicts(Path::new("/idx/repo-6.g1.shard"), &[6]));
    }

    #[tokio::test]
    async fn lease_repo_waits_for_release() {
        let table = LeaseTable::new();
        let shard = table
            .try_lease_shard(Path::new("/idx/s.shard"), &[3])
            .expect("shard lease");

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.lease_repo(3).await.repo_id() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(shard);
        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("lease granted")
            .expect("join");
        assert_eq!(got, 3);
    }

    #[test]
    fn merge_lock_is_exclusive() {
        let temp = TempDir::new().expect("tempdir");
        let first = try_acquire_merge_lock(temp.path()).expect("first lock");
        assert!(matches!(
            try_acquire_merge_lock(temp.path()),
            Err(ShardError::MergeInProgress(_))
        ));
        drop(first);
        assert!(try_acquire_merge_lock(temp.path()).is_ok());
    }

    #[test]
    fn writer_lock_refuses_second_holder() {
        let temp = TempDir::new().expect("tempdir");
        let first = try_acquire_writer_lock(temp.path()).expect("first lock");
        assert!(matches!(
            try_acquire_writer_lock(temp.path()),
            Err(ShardError::DirectoryBusy(_))
        ));
        assert!(try_acquire_merge_lock(temp.path()).is_ok());
        drop(first);
        assert!(try_acquire_writer_lock(temp.path()).is_ok());
    }
}
