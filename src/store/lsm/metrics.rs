use super::state::StoreCore;

/// Point-in-time view of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetrics {
    pub active_bytes: usize,
    pub active_entries: usize,
    pub flushing_bytes: Option<usize>,
    pub run_ids: Vec<u64>,
    pub run_entries: u64,
    pub flush_in_flight: bool,
    pub compaction_pending: bool,
}

impl StoreMetrics {
    pub fn run_count(&self) -> usize {
        self.run_ids.len()
    }
}

/// Collect metrics from the current state and log them
pub fn collect_metrics(core: &StoreCore) -> StoreMetrics {
    let state = core.load();
    let metrics = StoreMetrics {
        active_bytes: state.active.size(),
        active_entries: state.active.len(),
        flushing_bytes: state.flushing.as_ref().map(|m| m.size()),
        run_ids: state.storage.runs().iter().map(|run| run.id).collect(),
        run_entries: state
            .storage
            .runs()
            .iter()
            .map(|run| run.table.entry_count())
            .sum(),
        flush_in_flight: core.flush_in_flight(),
        compaction_pending: core.compaction_pending(),
    };

    tracing::info!(
        active_bytes = metrics.active_bytes,
        active_entries = metrics.active_entries,
        flushing_bytes = ?metrics.flushing_bytes,
        runs = metrics.run_count(),
        run_entries = metrics.run_entries,
        flush_in_flight = metrics.flush_in_flight,
        compaction_pending = metrics.compaction_pending,
        "LSM metrics"
    );

    metrics
}
