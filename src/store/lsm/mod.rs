//! LSM-Tree storage engine implementation.
//!
//! Writes land in an in-memory sorted buffer, are flushed to immutable
//! sorted runs on disk, and the runs (together with the buffered writes) are
//! periodically compacted into one.
//!
//! ```text
//! ┌─────────────────┐   seal    ┌──────────────────┐
//! │ Active Memtable │──────────►│ Flushing Memtable│
//! │   (SkipList)    │           │   (frozen, ≤ 1)  │
//! └─────────────────┘           └──────────────────┘
//!                                        │ flush (worker)
//!                                        ▼
//!                               ┌──────────────────┐
//!                               │  Runs (*.sst)    │
//!                               │  one generation  │
//!                               └──────────────────┘
//!                                        │ compaction (worker)
//!                                        ▼
//!                               ┌──────────────────┐
//!                               │  Single run      │
//!                               └──────────────────┘
//! ```
//!
//! # State
//!
//! The store's view is one immutable [`LsmState`] snapshot `{active,
//! flushing, storage}` behind an atomic pointer. Readers load the pointer
//! and never lock. Every transition (seal, flush publish, compaction
//! publish) builds a new snapshot and swaps it in while holding the write
//! side of the upsert lock, so an upsert always lands either in the buffer
//! being sealed or in its replacement.
//!
//! # Write Path
//! 1. **Insert**: the entry goes into the active memtable under the read side
//!    of the upsert lock. Its size is added to the buffer's byte counter.
//! 2. **Seal**: crossing `flush_threshold_bytes` claims the single-flight
//!    flush flag and moves the active buffer to the flushing slot.
//! 3. **Flush**: the worker writes the sealed buffer, tombstones included,
//!    as the next run and publishes the new generation.
//! 4. **Backpressure**: a write that would cross the threshold while a sealed
//!    buffer is still waiting fails with [`Error::Overload`](crate::Error::Overload).
//!
//! # Read Path
//! Point lookups check the active memtable, then the flushing one, then the
//! runs. Scans merge every layer; each source carries a recency rank so the
//! newest version of a key wins no matter how the sources are listed.
//!
//! # Background Work
//! A single worker runs flushes and compactions one at a time in the order
//! they were queued, so they never touch the run files concurrently.

pub mod comparator;
pub mod compaction;
pub mod entry;
pub mod filter;
pub mod flush;
pub mod iterator;
pub mod memtable;
pub mod metrics;
pub mod recovery;
pub mod sstable;
pub mod state;
pub mod storage;
pub mod store;
pub mod tasks;

pub use comparator::{Bytewise, Comparator};
pub use compaction::CompactionSummary;
pub use entry::Entry;
pub use iterator::{MergeIterator, Source};
pub use memtable::Memtable;
pub use metrics::StoreMetrics;
pub use state::{CompactionGuard, LsmState, StoreCore};
pub use storage::Storage;
pub use store::{LsmStore, StoreIterator};
