use std::sync::Arc;

use super::filter::key_range;
use super::memtable::Memtable;
use super::state::StoreCore;
use super::storage::Storage;
use crate::error::Result;

/// Writes a sealed buffer as a new run of the current generation, then
/// publishes the generation that contains it. Returns the new run id.
///
/// On failure nothing is published: the buffer stays in the flushing slot
/// and the flush flag stays set.
pub(crate) fn flush_memtable(core: &StoreCore, memtable: &Arc<Memtable>) -> Result<u64> {
    let state = core.load();
    let run_id = state.storage.persist(memtable.scan(key_range(..)))?;

    let storage = Storage::load(&core.config)?;
    let run_count = storage.run_count();
    core.publish_flush(storage)?;

    tracing::info!(
        run_id = run_id,
        entries = memtable.len(),
        bytes = memtable.size(),
        runs = run_count,
        "Flushed write buffer to run"
    );
    Ok(run_id)
}
