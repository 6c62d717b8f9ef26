use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, RwLock,
};

use arc_swap::ArcSwap;

use super::comparator::Bytewise;
use super::entry::Entry;
use super::memtable::Memtable;
use super::sstable::block::check_entry;
use super::storage::Storage;
use crate::{config::LsmConfig, error::Result, Error};

/// One immutable view of the store: the buffer taking writes, the buffer
/// being flushed (if any) and the run generation on disk.
///
/// A published state is never modified; every transition builds a new one
/// and swaps it in whole.
#[derive(Debug)]
pub struct LsmState {
    pub active: Arc<Memtable>,
    pub flushing: Option<Arc<Memtable>>,
    pub storage: Arc<Storage>,
}

impl LsmState {
    pub fn new(storage: Storage) -> Self {
        Self {
            active: Arc::new(Memtable::new()),
            flushing: None,
            storage: Arc::new(storage),
        }
    }

    /// Bytes accounted against the flush threshold. The counter lives in
    /// the active buffer and starts over with every new buffer.
    pub fn memory_usage(&self) -> usize {
        self.active.size()
    }
}

/// Shared core of the store, also owned by the background tasks.
///
/// Two independent locks coordinate it. `upsert_lock` is taken shared by
/// writers inserting into the active buffer and exclusively by the seal and
/// publish transitions while they swap the state. `compaction_lock`
/// serializes compaction scheduling and execution and is unrelated to the
/// first one.
pub struct StoreCore {
    pub(crate) config: LsmConfig,
    pub(crate) comparator: Bytewise,
    state: ArcSwap<LsmState>,
    upsert_lock: RwLock<()>,
    compaction_lock: Mutex<()>,
    flush_in_flight: AtomicBool,
    compaction_pending: AtomicBool,
}

impl StoreCore {
    pub fn new(config: LsmConfig, storage: Storage) -> Self {
        Self {
            config,
            comparator: Bytewise,
            state: ArcSwap::from_pointee(LsmState::new(storage)),
            upsert_lock: RwLock::new(()),
            compaction_lock: Mutex::new(()),
            flush_in_flight: AtomicBool::new(false),
            compaction_pending: AtomicBool::new(false),
        }
    }

    /// The current state.
    pub fn load(&self) -> Arc<LsmState> {
        self.state.load_full()
    }

    /// Inserts into the active buffer. Returns true when the caller crossed
    /// the flush threshold and now owns the flush flag.
    ///
    /// Entries the run format cannot hold are refused here, before the
    /// buffer sees them; a flush never fails on one.
    pub fn upsert(&self, entry: Entry) -> Result<bool> {
        check_entry(entry.key(), entry.value())?;
        let threshold = self.config.flush_threshold_bytes;
        let size = entry.approximate_size();

        let usage = {
            let _guard = self.upsert_lock.read()?;
            let state = self.state.load();
            if state.memory_usage() + size > threshold
                && self.flush_in_flight.load(Ordering::SeqCst)
                && state.flushing.is_some()
            {
                return Err(Error::Overload);
            }
            state.active.put(entry)?
        };

        Ok(usage > threshold && self.try_mark_flush())
    }

    /// Claims the single-flight flush flag.
    pub fn try_mark_flush(&self) -> bool {
        !self.flush_in_flight.swap(true, Ordering::SeqCst)
    }

    pub fn clear_flush_flag(&self) {
        self.flush_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn flush_in_flight(&self) -> bool {
        self.flush_in_flight.load(Ordering::SeqCst)
    }

    /// Moves the active buffer to the flushing slot behind a fresh one.
    /// Returns the sealed buffer, or `None` when there was nothing to seal.
    pub fn seal(&self) -> Result<Option<Arc<Memtable>>> {
        let _guard = self.upsert_lock.write()?;
        let state = self.state.load_full();

        if state.active.is_empty() {
            return Ok(None);
        }
        if state.flushing.is_some() {
            return Err(Error::InvalidState(
                "Cannot seal while another buffer is being flushed".to_string(),
            ));
        }

        state.active.freeze()?;
        self.state.store(Arc::new(LsmState {
            active: Arc::new(Memtable::new()),
            flushing: Some(Arc::clone(&state.active)),
            storage: Arc::clone(&state.storage),
        }));
        Ok(Some(Arc::clone(&state.active)))
    }

    /// Drops the flushed buffer and installs the generation holding its run.
    pub fn publish_flush(&self, storage: Storage) -> Result<()> {
        {
            let _guard = self.upsert_lock.write()?;
            let state = self.state.load();
            self.state.store(Arc::new(LsmState {
                active: Arc::clone(&state.active),
                flushing: None,
                storage: Arc::new(storage),
            }));
        }
        self.clear_flush_flag();
        Ok(())
    }

    /// Replaces only the run generation; both buffers stay as they are.
    pub fn publish_compaction(&self, storage: Storage) -> Result<()> {
        let _guard = self.upsert_lock.write()?;
        let state = self.state.load();
        self.state.store(Arc::new(LsmState {
            active: Arc::clone(&state.active),
            flushing: state.flushing.clone(),
            storage: Arc::new(storage),
        }));
        Ok(())
    }

    pub fn lock_compaction(&self) -> Result<MutexGuard<'_, ()>> {
        Ok(self.compaction_lock.lock()?)
    }

    /// Marks a compaction as queued. False if one already is.
    pub fn try_mark_compaction_pending(&self) -> bool {
        !self.compaction_pending.swap(true, Ordering::SeqCst)
    }

    pub fn compaction_pending(&self) -> bool {
        self.compaction_pending.load(Ordering::SeqCst)
    }

    pub fn clear_compaction_pending(&self) {
        self.compaction_pending.store(false, Ordering::SeqCst);
    }

    /// Guard held by a running compaction task; clears the pending flag
    /// however the task ends.
    pub fn compaction_guard(&self) -> CompactionGuard<'_> {
        CompactionGuard { core: self }
    }
}

/// RAII guard for compaction tasks
pub struct CompactionGuard<'a> {
    core: &'a StoreCore,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.core.clear_compaction_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn core(dir: &TempDir, threshold: usize) -> StoreCore {
        let config = LsmConfig::new(dir.path())
            .flush_threshold_bytes(threshold)
            .sync_writes(false);
        let storage = Storage::open(&config).unwrap();
        StoreCore::new(config, storage)
    }

    #[test]
    fn test_upsert_claims_flush_once() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let core = core(&dir, 10);

        assert!(!core.upsert(Entry::put("a", "1"))?);
        assert_eq!(core.load().memory_usage(), 2);

        // Crosses the threshold, claims the flag
        assert!(core.upsert(Entry::put("key", "value-1"))?);
        assert!(core.flush_in_flight());
        // Over threshold again but the flag is taken
        assert!(!core.upsert(Entry::put("key", "value-2"))?);
        Ok(())
    }

    #[test]
    fn test_seal_and_publish() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let core = core(&dir, 1024);

        assert!(core.seal()?.is_none(), "empty buffer is not sealed");

        core.upsert(Entry::put("k", "v"))?;
        let before = core.load();
        let sealed = core.seal()?.expect("sealed buffer");

        let after = core.load();
        assert!(Arc::ptr_eq(&sealed, &before.active));
        assert!(Arc::ptr_eq(after.flushing.as_ref().unwrap(), &sealed));
        assert!(after.active.is_empty());
        assert!(sealed.is_frozen());
        assert_eq!(after.memory_usage(), 0);

        // Writes after sealing land in the new buffer
        core.upsert(Entry::put("k2", "v2"))?;
        assert!(matches!(core.seal(), Err(Error::InvalidState(_))));

        core.try_mark_flush();
        core.publish_flush(Storage::load(&core.config)?)?;
        let published = core.load();
        assert!(published.flushing.is_none());
        assert!(published.active.get(b"k2").is_some());
        assert!(!core.flush_in_flight());
        Ok(())
    }

    #[test]
    fn test_overload_needs_flag_and_flushing_buffer() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let core = core(&dir, 10);

        // Flag taken but nothing sealed yet: still accepted
        assert!(core.upsert(Entry::put("key1", "value-one"))?);
        assert!(!core.upsert(Entry::put("key2", "value-two"))?);

        core.seal()?;
        assert!(matches!(
            core.upsert(Entry::put("key3", "value-three")),
            Err(Error::Overload)
        ));
        // Small writes that stay under the threshold still go through
        assert!(!core.upsert(Entry::put("a", "b"))?);
        Ok(())
    }

    #[test]
    fn test_oversized_key_refused_before_buffer() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let core = core(&dir, 10);

        let key = vec![b'k'; u16::MAX as usize + 1];
        assert!(matches!(
            core.upsert(Entry::put(key, "v")),
            Err(Error::InvalidOperation(_))
        ));
        assert!(core.load().active.is_empty());
        assert_eq!(core.load().memory_usage(), 0);
        assert!(!core.flush_in_flight());

        // The longest key the run format holds is fine
        core.upsert(Entry::tombstone(vec![b'k'; u16::MAX as usize]))?;
        Ok(())
    }

    #[test]
    fn test_compaction_pending_flag() {
        let dir = TempDir::new().unwrap();
        let core = core(&dir, 1024);

        assert!(core.try_mark_compaction_pending());
        assert!(!core.try_mark_compaction_pending());
        assert!(core.compaction_pending());

        drop(core.compaction_guard());
        assert!(!core.compaction_pending());
        assert!(core.try_mark_compaction_pending());
    }
}
