//! # Indexing queue
//!
//! Decides which repository the index server (re)indexes next.
//!
//! ```text
//! catalog reconciliation ──enqueue──┐
//!                                   ▼
//!                     ┌──────────────────────────┐
//!                     │ IndexingQueue            │
//!                     │  id ─► entry  (dedup)    │
//!                     │  (prio desc, age asc)    │
//!                     └──────────────────────────┘
//!                                   │
//!            workers ◄──dequeue─────┘      debug reader ◄── list / debug_rows
//! ```
//!
//! ## Example
//!
//! ```
//! use indexserver_protocol::Branch;
//! use indexserver_queue::IndexingQueue;
//!
//! let queue = IndexingQueue::new();
//! queue.enqueue(1, 5.0, vec![Branch::new("main", "a1")]);
//! queue.enqueue(2, 9.0, vec![Branch::new("main", "b2")]);
//!
//! assert_eq!(queue.dequeue().map(|e| e.repo_id), Some(2));
//! ```

mod entry;
mod queue;
mod render;

pub use entry::{QueueEntry, QueuePosition, QueueRow};
pub use queue::IndexingQueue;
pub use render::{format_age, render_queue_table};
