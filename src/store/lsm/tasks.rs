use std::sync::Arc;

use super::{
    compaction,
    flush,
    memtable::Memtable,
    state::StoreCore,
    storage::Storage,
};
use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context},
    Error,
};

/// Persists one sealed buffer.
pub struct FlushTask {
    core: Arc<StoreCore>,
    memtable: Arc<Memtable>,
}

impl FlushTask {
    pub fn new(core: Arc<StoreCore>, memtable: Arc<Memtable>) -> Self {
        Self { core, memtable }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "flush"
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        flush::flush_memtable(&self.core, &self.memtable)
            .map(|_| ())
            .map_err(|e| Error::Persistence(Box::new(e)))
    }
}

/// Merges all runs into one. Planned against a generation; if that
/// generation has been retired by the time the task runs, it does nothing.
pub struct CompactionTask {
    core: Arc<StoreCore>,
    planned: Arc<Storage>,
}

impl CompactionTask {
    pub fn new(core: Arc<StoreCore>, planned: Arc<Storage>) -> Self {
        Self { core, planned }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let _pending = self.core.compaction_guard();
        let _lock = self.core.lock_compaction()?;

        if !self.planned.is_live() {
            tracing::debug!(run_id = ctx.run_id, "Compaction target was retired, skipping");
            return Ok(());
        }

        compaction::compact_runs(&self.core)
            .map(|_| ())
            .map_err(|e| Error::Compaction(Box::new(e)))
    }
}

/// Completes once everything queued before it has run.
pub struct BarrierTask;

#[async_trait::async_trait]
impl BackgroundTask for BarrierTask {
    fn name(&self) -> &'static str {
        "barrier"
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        Ok(())
    }
}
