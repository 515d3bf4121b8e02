//! # Shard store and merge engine
//!
//! Every indexed repository starts out as a *simple* shard
//! (`repo-<id>.g<gen>.shard`). Over time the merge engine packs small
//! shards into *compound* shards no larger than a target size.
//!
//! ```text
//!   repo-1.g4.shard ─┐
//!   repo-7.g9.shard ─┼─ plan ─► bin ─► stage (.tmp, fsync) ─► rename ─► delete inputs
//!   repo-3.g2.shard ─┘                                          │
//!                                               recover() finishes or undoes
//! ```
//!
//! The directory is the only durable state. Membership, sizes and
//! generations are recovered from shard headers, and the `replaces` list of
//! a compound header lets [`MergeEngine::recover`] finish a merge that was
//! interrupted between rename and input deletion.
//!
//! Leases and the generation counter are in-memory, so only one process
//! writes a directory at a time: a writable [`ShardStore`] holds
//! `writer.lock` until dropped. Readers use [`ShardStore::open_read_only`].

mod error;
mod format;
mod fsutil;
mod lease;
mod merge;
mod naming;
mod plan;
mod report;
mod shard;
mod store;

pub use error::{Result, ShardError};
pub use format::{
    read_header, read_section, verify_shard, RepoSection, ShardFile, ShardHeader,
    SHARD_FORMAT_VERSION, SHARD_MAGIC,
};
pub use lease::{
    merge_lock_path, try_acquire_merge_lock, try_acquire_writer_lock, writer_lock_path, LeaseTable,
    MergeLock, RepoLease, ShardLease, WriterLock,
};
pub use merge::{MergeEngine, StagedBin};
pub use naming::{
    compound_shard_name, parse_shard_name, simple_shard_name, temp_path_for, ShardName,
    MERGE_LOCK_FILE_NAME, WRITER_LOCK_FILE_NAME,
};
pub use plan::{plan, Bin, MergePlan};
pub use report::{
    format_bytes, render_merge_run, BinOutcome, BinReport, MergeReport, MergeRun, RecoveryReport,
};
pub use shard::{Shard, ShardMeta};
pub use store::{IndexedRepo, ShardStore};
