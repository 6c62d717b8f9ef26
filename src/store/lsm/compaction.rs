//! Full compaction: every run, together with the buffered writes, is merged
//! into one run.
//!
//! The merge runs on the state current when the task executes, in three
//! steps that each leave the directory recoverable:
//!
//! 1. write the merged run as `{max_id}.compacting`, dropping tombstones,
//! 2. delete the superseded runs, retiring their generation,
//! 3. rename the merged run to `{max_id}.sst`.
//!
//! A crash between steps is finished or rolled back on the next open.
//!
//! The buffers stay in the published state. Their entries are now also on
//! disk, and they still outrank the merged run until they are flushed.

use super::state::StoreCore;
use super::storage::Storage;
use crate::error::Result;

/// Outcome of one compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSummary {
    pub runs_before: usize,
    pub runs_after: usize,
    pub merged_run: Option<u64>,
}

pub(crate) fn compact_runs(core: &StoreCore) -> Result<CompactionSummary> {
    let state = core.load();
    let storage = &state.storage;
    let runs_before = storage.run_count();

    let buffered = !state.active.is_empty()
        || state.flushing.as_ref().is_some_and(|flushing| !flushing.is_empty());
    if runs_before == 0 && !buffered {
        tracing::debug!("Nothing to compact");
        return Ok(CompactionSummary {
            runs_before,
            runs_after: 0,
            merged_run: None,
        });
    }

    tracing::info!(runs = runs_before, buffered, "Starting compaction");

    let merged_run = storage.write_merged_run(&state.active, state.flushing.as_ref())?;
    storage.delete_superseded_runs()?;
    if let Some(id) = merged_run {
        storage.publish_merged_run(id)?;
    }

    let next = Storage::load(&core.config)?;
    let runs_after = next.run_count();
    core.publish_compaction(next)?;

    tracing::info!(
        runs_before = runs_before,
        runs_after = runs_after,
        merged_run = ?merged_run,
        "Compaction completed"
    );

    Ok(CompactionSummary {
        runs_before,
        runs_after,
        merged_run,
    })
}
