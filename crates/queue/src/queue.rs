use crate::entry::{QueueEntry, QueueKey, QueuePosition, QueueRow, RepoRecord};
use indexserver_protocol::{Branch, Priority, RepoId};
use log::debug;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[derive(Default)]
struct QueueState {
    order: BTreeSet<QueueKey>,
    entries: HashMap<RepoId, QueueEntry>,
    repos: HashMap<RepoId, RepoRecord>,
    next_seq: u64,
}

/// Pending indexing jobs, deduplicated by repository and drained by
/// `(priority desc, enqueued_at asc)`.
///
/// The ordering set and the id index live behind one lock so an upsert can
/// never interleave with the removal of the same entry. Critical sections
/// are O(log n) and never touch I/O.
#[derive(Default)]
pub struct IndexingQueue {
    state: Mutex<QueueState>,
}

impl IndexingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every mutation below keeps `order` and `entries` consistent before
        // it can panic, so a poisoned state is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a job, or updates the priority and desired branches of the
    /// job already queued for `repo_id` without touching its age.
    pub fn enqueue(&self, repo_id: RepoId, priority: Priority, desired_branches: Vec<Branch>) {
        let inserted = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.entries.get_mut(&repo_id) {
                Some(entry) => {
                    if entry.priority.total_cmp(&priority).is_ne() {
                        state.order.remove(&entry.key());
                        entry.priority = priority;
                        state.order.insert(entry.key());
                    }
                    entry.desired_branches = desired_branches;
                    false
                }
                None => {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    let entry = QueueEntry {
                        repo_id,
                        priority,
                        enqueued_at: Instant::now(),
                        desired_branches,
                        seq,
                    };
                    state.order.insert(entry.key());
                    state.entries.insert(repo_id, entry);
                    true
                }
            }
        };
        if inserted {
            debug!("queued repository {repo_id} (priority {priority})");
        }
    }

    /// Removes and returns the most urgent job, oldest first among equals.
    pub fn dequeue(&self) -> Option<QueueEntry> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let key = state.order.pop_first()?;
        state.entries.remove(&key.id)
    }

    /// Snapshot of the queue in the exact order `dequeue` would drain it.
    pub fn list(&self) -> Vec<QueuePosition> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|key| state.entries.get(&key.id))
            .cloned()
            .enumerate()
            .map(|(position, entry)| QueuePosition { position, entry })
            .collect()
    }

    /// Drops the job for `repo_id`, if any.
    pub fn remove(&self, repo_id: RepoId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(entry) = state.entries.remove(&repo_id) {
            state.order.remove(&entry.key());
        }
    }

    pub fn contains(&self, repo_id: RepoId) -> bool {
        self.lock().entries.contains_key(&repo_id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_name(&self, repo_id: RepoId, name: impl Into<String>) {
        let name = name.into();
        let mut state = self.lock();
        state.repos.entry(repo_id).or_default().name = Some(name);
    }

    /// Records the branch set that is now on disk for `repo_id`.
    pub fn mark_indexed(&self, repo_id: RepoId, branches: Vec<Branch>) {
        let mut state = self.lock();
        state.repos.entry(repo_id).or_default().indexed_branches = branches;
    }

    pub fn indexed_branches(&self, repo_id: RepoId) -> Option<Vec<Branch>> {
        self.lock()
            .repos
            .get(&repo_id)
            .map(|record| record.indexed_branches.clone())
    }

    /// Forgets every repository not in `keep`, queued or not. Returns the
    /// removed ids in ascending order.
    pub fn remove_missing(&self, keep: &HashSet<RepoId>) -> Vec<RepoId> {
        let removed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut removed: Vec<RepoId> = state
                .entries
                .keys()
                .chain(state.repos.keys())
                .filter(|id| !keep.contains(id))
                .copied()
                .collect();
            removed.sort_unstable();
            removed.dedup();
            for id in &removed {
                if let Some(entry) = state.entries.remove(id) {
                    state.order.remove(&entry.key());
                }
                state.repos.remove(id);
            }
            removed
        };
        if !removed.is_empty() {
            debug!("dropped {} repositories no longer in the catalog", removed.len());
        }
        removed
    }

    /// Rows for the introspection table: queued repositories in drain order,
    /// then every other known repository by id.
    pub fn debug_rows(&self, now: Instant) -> Vec<QueueRow> {
        let state = self.lock();
        let mut rows = Vec::with_capacity(state.repos.len().max(state.entries.len()));

        for key in &state.order {
            let Some(entry) = state.entries.get(&key.id) else {
                continue;
            };
            rows.push(QueueRow {
                position: rows.len(),
                name: state.repos.get(&key.id).and_then(|r| r.name.clone()),
                id: key.id,
                is_on_queue: true,
                age: Some(now.saturating_duration_since(entry.enqueued_at)),
                branches: entry.desired_branches.clone(),
            });
        }

        let mut idle: Vec<(&RepoId, &RepoRecord)> = state
            .repos
            .iter()
            .filter(|(id, _)| !state.entries.contains_key(id))
            .collect();
        idle.sort_unstable_by_key(|(id, _)| **id);
        for (id, record) in idle {
            rows.push(QueueRow {
                position: rows.len(),
                name: record.name.clone(),
                id: *id,
                is_on_queue: false,
                age: None,
                branches: record.indexed_branches.clone(),
            });
        }

        rows
    }
}
