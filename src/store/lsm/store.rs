use super::{
    super::Store,
    comparator::{Bytewise, Comparator},
    entry::Entry,
    filter::{half_open, key_range, KeyRange, TombstoneFilter},
    iterator::{MergeIterator, Source, ACTIVE_RANK, FLUSHING_RANK},
    metrics::{self, StoreMetrics},
    state::StoreCore,
    storage::Storage,
    tasks::{BarrierTask, CompactionTask, FlushTask},
};

use crate::{
    config::LsmConfig,
    error::Result,
    flock::FileLock,
    scheduler::{Scheduler, TaskHandle},
    Error,
};

use std::{
    fs,
    ops::{Bound, RangeBounds},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

const LOCK_FILE: &str = "strata.lock";

/// Iterator over live entries, in key order.
pub type StoreIterator = TombstoneFilter<MergeIterator<'static, Bytewise>>;

/// LSM store: write buffers in memory, sorted runs on disk, and one
/// background worker that flushes and compacts.
pub struct LsmStore {
    core: Arc<StoreCore>,
    scheduler: Scheduler,
    lock: Mutex<Option<FileLock>>,
    // Held shared for a whole upsert, including the flush it may trigger,
    // and exclusively by `close` while it flips `closed`.
    writers: RwLock<()>,
    closed: AtomicBool,
}

impl LsmStore {
    /// Open store with default configuration
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(LsmConfig::new(dir))
    }

    /// Open store with custom configuration
    pub fn open_with_config(config: LsmConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        // Acquire file lock
        let lock = FileLock::lock(config.dir.join(LOCK_FILE)).map_err(Error::LockError)?;

        let storage = Storage::open(&config)?;
        let scheduler = Scheduler::start(&config.worker_name)?;

        tracing::info!(
            dir = %config.dir.display(),
            runs = storage.run_count(),
            flush_threshold_bytes = config.flush_threshold_bytes,
            "Opened store"
        );

        Ok(Self {
            core: Arc::new(StoreCore::new(config, storage)),
            scheduler,
            lock: Mutex::new(Some(lock)),
            writers: RwLock::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LsmConfig {
        &self.core.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Live entries in `[from, to)`; `None` leaves that side unbounded.
    pub fn get_range(&self, from: Option<&[u8]>, to: Option<&[u8]>) -> StoreIterator {
        self.scan_range(half_open(from, to))
    }

    fn scan_range(&self, range: KeyRange) -> StoreIterator {
        let state = self.core.load();
        let comparator = self.core.comparator;

        let merged = if state.storage.run_count() == 0 {
            let mut sources = Vec::with_capacity(2);
            if let Some(flushing) = &state.flushing {
                sources.push(Source::new(FLUSHING_RANK, flushing.scan(range.clone())));
            }
            sources.push(Source::new(ACTIVE_RANK, state.active.scan(range)));
            MergeIterator::new(comparator, sources)
        } else {
            state
                .storage
                .range(&state.active, state.flushing.as_ref(), range, comparator)
        };

        TombstoneFilter::new(merged)
    }

    /// Seals the active buffer and queues its flush. The caller must hold
    /// the flush flag; it is released again if nothing gets queued.
    fn trigger_flush(&self) -> Result<Option<TaskHandle>> {
        let sealed = match self.core.seal() {
            Ok(Some(sealed)) => sealed,
            Ok(None) => {
                self.core.clear_flush_flag();
                tracing::debug!("Active buffer is empty, nothing to flush");
                return Ok(None);
            }
            Err(e) => {
                self.core.clear_flush_flag();
                return Err(e);
            }
        };

        tracing::debug!(
            entries = sealed.len(),
            bytes = sealed.size(),
            "Sealed write buffer"
        );
        let task = FlushTask::new(Arc::clone(&self.core), sealed);
        let handle = self.scheduler.submit(Arc::new(task))?;
        tracing::debug!(task = handle.task(), run_id = handle.run_id(), "Queued flush");
        Ok(Some(handle))
    }

    fn schedule_flush_inner(&self) -> Result<Option<TaskHandle>> {
        let state = self.core.load();
        if state.active.is_empty() || state.flushing.is_some() {
            tracing::debug!(
                flushing = state.flushing.is_some(),
                "Skipping flush request"
            );
            return Ok(None);
        }
        if !self.core.try_mark_flush() {
            tracing::debug!("Flush already in flight");
            return Ok(None);
        }
        self.trigger_flush()
    }

    /// Seals the active buffer and queues its flush. `None` when there was
    /// nothing to flush or a flush is already in progress.
    pub fn schedule_flush(&self) -> Result<Option<TaskHandle>> {
        self.ensure_open()?;
        self.schedule_flush_inner()
    }

    /// Queues a full compaction. `None` when it would not change anything
    /// or one is already queued.
    pub fn schedule_compaction(&self) -> Result<Option<TaskHandle>> {
        self.ensure_open()?;
        let _lock = self.core.lock_compaction()?;

        let state = self.core.load();
        if state.storage.run_count() <= 1 && state.active.is_empty() {
            tracing::debug!(runs = state.storage.run_count(), "Nothing to compact");
            return Ok(None);
        }
        if !self.core.try_mark_compaction_pending() {
            tracing::debug!("Compaction already queued");
            return Ok(None);
        }

        let task = CompactionTask::new(Arc::clone(&self.core), Arc::clone(&state.storage));
        match self.scheduler.submit(Arc::new(task)) {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                self.core.clear_compaction_pending();
                Err(e)
            }
        }
    }

    /// Blocks until every task queued so far has run. Must not be called
    /// from async code.
    pub fn wait_for_background(&self) -> Result<()> {
        self.scheduler.submit(Arc::new(BarrierTask))?.wait()
    }

    /// Reports the first background failure not yet seen by the caller.
    pub fn status(&self) -> Result<()> {
        match self.scheduler.take_failure()? {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }

    pub fn metrics(&self) -> StoreMetrics {
        metrics::collect_metrics(&self.core)
    }

    pub fn run_count(&self) -> usize {
        self.core.load().storage.run_count()
    }
}

fn live(entry: Entry) -> Option<Entry> {
    (!entry.is_tombstone()).then_some(entry)
}

impl Store for LsmStore {
    type ScanIterator<'a> = StoreIterator;

    fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        let state = self.core.load();

        let buffered = state
            .active
            .get(key)
            .or_else(|| state.flushing.as_ref().and_then(|flushing| flushing.get(key)));
        if let Some(entry) = buffered {
            return Ok(live(entry));
        }

        if state.storage.run_count() == 0 {
            return Ok(None);
        }

        // The run scan yields the nearest key at or after `key`
        let comparator = self.core.comparator;
        let mut runs = state
            .storage
            .scan_runs((Bound::Included(key.to_vec()), Bound::Unbounded), comparator);
        match runs.next() {
            Some(Ok(entry)) if comparator.equal(entry.key(), key) => Ok(live(entry)),
            Some(Ok(_)) | None => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }

    fn scan<'a>(
        &'a self,
        range: impl RangeBounds<Vec<u8>> + Clone + Send + Sync + 'a,
    ) -> Self::ScanIterator<'a> {
        self.scan_range(key_range(range))
    }

    fn upsert(&self, entry: Entry) -> Result<()> {
        let _writer = self.writers.read()?;
        self.ensure_open()?;
        if self.core.upsert(entry)? {
            self.trigger_flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.schedule_flush().map(drop)
    }

    fn compact(&self) -> Result<()> {
        self.schedule_compaction().map(drop)
    }

    fn close(&self) -> Result<()> {
        // Writers already past their check finish first, so the final
        // flush below sees every accepted write
        {
            let _writers = self.writers.write()?;
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }

        // Let an in-flight flush publish so the final one is not skipped
        let drained = self.wait_for_background();
        let flushed = self.schedule_flush_inner();
        let stopped = self.scheduler.shutdown();
        let failure = self.scheduler.take_failure();
        let unlocked = match self.lock.lock()?.take() {
            Some(lock) => lock.unlock().map_err(Error::LockError),
            None => Ok(()),
        };

        tracing::info!(dir = %self.core.config.dir.display(), "Closed store");

        drained?;
        flushed?;
        stopped?;
        if let Some(failure) = failure? {
            return Err(failure.into());
        }
        unlocked
    }
}

impl Drop for LsmStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "Failed to close store cleanly");
        }
    }
}
