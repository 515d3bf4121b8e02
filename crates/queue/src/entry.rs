use indexserver_protocol::{Branch, Priority, RepoId};
use serde::Serialize;
use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// A pending indexing job. At most one exists per repository.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub repo_id: RepoId,
    pub priority: Priority,
    /// Set on first insertion and never refreshed by later upserts.
    pub enqueued_at: Instant,
    pub desired_branches: Vec<Branch>,
    pub(crate) seq: u64,
}

impl QueueEntry {
    pub(crate) fn key(&self) -> QueueKey {
        QueueKey {
            priority: self.priority,
            seq: self.seq,
            id: self.repo_id,
        }
    }
}

/// Drain-order key: priority descending, then insertion order ascending.
///
/// `seq` is assigned together with `enqueued_at`, so ordering by it is the
/// oldest-first tie break even when two insertions share a clock reading.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueKey {
    pub(crate) priority: Priority,
    pub(crate) seq: u64,
    pub(crate) id: RepoId,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

/// One element of [`crate::IndexingQueue::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePosition {
    pub position: usize,
    pub entry: QueueEntry,
}

/// What the queue remembers about a repository independently of whether it
/// currently has a job outstanding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RepoRecord {
    pub(crate) name: Option<String>,
    pub(crate) indexed_branches: Vec<Branch>,
}

/// A row of the queue introspection table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueRow {
    pub position: usize,
    pub name: Option<String>,
    pub id: RepoId,
    pub is_on_queue: bool,
    /// `None` when the repository has no outstanding job.
    pub age: Option<Duration>,
    /// Desired branches when queued, last indexed branches otherwise.
    pub branches: Vec<Branch>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(priority: Priority, seq: u64, id: RepoId) -> QueueKey {
        QueueKey { priority, seq, id }
    }

    #[test]
    fn higher_priority_sorts_first() {
        assert!(key(9.0, 5, 1) < key(5.0, 0, 2));
    }

    #[test]
    fn equal_priority_sorts_by_insertion() {
        assert!(key(5.0, 0, 7) < key(5.0, 1, 3));
    }

    #[test]
    fn nan_priority_has_a_fixed_place() {
        let nan = key(f64::NAN, 0, 1);
        assert_eq!(nan.cmp(&nan), Ordering::Equal);
        assert_ne!(nan.cmp(&key(1.0, 1, 2)), Ordering::Equal);
    }
}
