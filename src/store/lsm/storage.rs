//! The run store: one immutable generation of on-disk runs.
//!
//! A [`Storage`] is opened over the storage directory and never changes
//! afterwards. Flushes and compactions write new files and then open a fresh
//! generation; an old generation keeps its file handles until the last
//! snapshot holding it is dropped.

use super::comparator::{Bytewise, Comparator};
use super::entry::Entry;
use super::filter::KeyRange;
use super::iterator::{MergeIterator, Source, ACTIVE_RANK, FLUSHING_RANK};
use super::memtable::Memtable;
use super::recovery;
use super::sstable::{write_table, Table};
use crate::{config::LsmConfig, error::Result, Error};

use std::{
    fs,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

const RUN_EXT: &str = ".sst";
const TMP_EXT: &str = ".sst.tmp";
const COMPACTING_EXT: &str = ".compacting";

/// Kinds of files the run store leaves in its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunFile {
    Run(u64),
    Temp(u64),
    Compacting(u64),
}

impl RunFile {
    pub(crate) fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        // .sst.tmp must be tried before .sst
        if let Some(id) = name.strip_suffix(TMP_EXT) {
            return id.parse().ok().map(RunFile::Temp);
        }
        if let Some(id) = name.strip_suffix(RUN_EXT) {
            return id.parse().ok().map(RunFile::Run);
        }
        if let Some(id) = name.strip_suffix(COMPACTING_EXT) {
            return id.parse().ok().map(RunFile::Compacting);
        }
        None
    }

    pub(crate) fn path(self, dir: &Path) -> PathBuf {
        match self {
            RunFile::Run(id) => dir.join(format!("{:08}{}", id, RUN_EXT)),
            RunFile::Temp(id) => dir.join(format!("{:08}{}", id, TMP_EXT)),
            RunFile::Compacting(id) => dir.join(format!("{:08}{}", id, COMPACTING_EXT)),
        }
    }
}

/// One run file and its id. Larger ids hold newer data.
#[derive(Debug)]
pub struct Run {
    pub id: u64,
    pub table: Table,
}

#[derive(Debug)]
pub struct Storage {
    dir: PathBuf,
    block_size: usize,
    sync_writes: bool,
    /// Sorted by ascending id.
    runs: Vec<Run>,
    live: AtomicBool,
}

impl Storage {
    /// Recovers the directory from any interrupted flush or compaction,
    /// then loads it.
    pub fn open(config: &LsmConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        recovery::recover_dir(&config.dir)?;
        Self::load(config)
    }

    /// Opens every run in the directory as a new generation.
    pub fn load(config: &LsmConfig) -> Result<Self> {
        let mut ids = Vec::new();
        for dir_entry in fs::read_dir(&config.dir)? {
            if let Some(RunFile::Run(id)) = RunFile::parse(&dir_entry?.path()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let runs = ids
            .into_iter()
            .map(|id| {
                let table = Table::open(RunFile::Run(id).path(&config.dir))?;
                Ok(Run { id, table })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dir: config.dir.clone(),
            block_size: config.block_size,
            sync_writes: config.sync_writes,
            runs,
            live: AtomicBool::new(true),
        })
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// False once a compaction has deleted this generation's files.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn max_run_id(&self) -> Option<u64> {
        self.runs.last().map(|run| run.id)
    }

    pub fn next_run_id(&self) -> u64 {
        self.max_run_id().map_or(1, |id| id + 1)
    }

    /// Merges the runs in `range` with the given buffer scans. Buffers
    /// always outrank runs, and the active buffer outranks the flushing one.
    pub fn range<C: Comparator>(
        &self,
        active: &Arc<Memtable>,
        flushing: Option<&Arc<Memtable>>,
        range: KeyRange,
        comparator: C,
    ) -> MergeIterator<'static, C> {
        let mut sources = Vec::with_capacity(self.runs.len() + 2);
        sources.push(Source::new(ACTIVE_RANK, active.scan(range.clone())));
        if let Some(flushing) = flushing {
            sources.push(Source::new(FLUSHING_RANK, flushing.scan(range.clone())));
        }
        sources.extend(self.run_sources(range));
        MergeIterator::new(comparator, sources)
    }

    /// Merges the runs alone, newest run winning.
    pub fn scan_runs<C: Comparator>(&self, range: KeyRange, comparator: C) -> MergeIterator<'static, C> {
        MergeIterator::new(comparator, self.run_sources(range))
    }

    fn run_sources(&self, range: KeyRange) -> Vec<Source<'static>> {
        self.runs
            .iter()
            .map(|run| match run.table.scan(range.clone()) {
                Ok(iter) => Source::new(run.id, iter),
                Err(e) => Source::new(run.id, std::iter::once(Err(e))),
            })
            .collect()
    }

    /// Writes a sorted batch as the next run. The file only gets its final
    /// name once it is complete.
    pub fn persist<I>(&self, entries: I) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Entry>>,
    {
        let id = self.next_run_id();
        let tmp_path = RunFile::Temp(id).path(&self.dir);
        let count = write_table(&tmp_path, entries, self.block_size, self.sync_writes)?;

        fs::rename(&tmp_path, RunFile::Run(id).path(&self.dir))
            .map_err(|e| Error::WriteError("run rename", e))?;
        self.sync_dir()?;

        tracing::debug!(run_id = id, entries = count, "Persisted run");
        Ok(id)
    }

    /// Merges every run and both buffers into `{id}.compacting`, dropping
    /// tombstones. The id is the largest run id, or the next one when there
    /// are no runs yet. Returns `None` when nothing survived the merge.
    pub fn write_merged_run(
        &self,
        active: &Arc<Memtable>,
        flushing: Option<&Arc<Memtable>>,
    ) -> Result<Option<u64>> {
        if !self.is_live() {
            return Err(Error::StaleHandle);
        }
        let id = self.max_run_id().unwrap_or_else(|| self.next_run_id());

        let path = RunFile::Compacting(id).path(&self.dir);
        // Nothing older than these runs exists, so tombstones shadow nothing
        let merged = self
            .range(active, flushing, (Bound::Unbounded, Bound::Unbounded), Bytewise)
            .filter(|entry| !matches!(entry, Ok(e) if e.is_tombstone()));

        let count = write_table(&path, merged, self.block_size, self.sync_writes)?;
        if count == 0 {
            fs::remove_file(&path)?;
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Retires this generation and removes its run files.
    pub fn delete_superseded_runs(&self) -> Result<()> {
        if self.live.swap(false, Ordering::SeqCst) {
            for run in &self.runs {
                match fs::remove_file(run.table.path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::WriteError("superseded run removal", e)),
                }
            }
            Ok(())
        } else {
            Err(Error::StaleHandle)
        }
    }

    /// Gives the merged run its final name, making it the only visible run.
    pub fn publish_merged_run(&self, id: u64) -> Result<()> {
        fs::rename(
            RunFile::Compacting(id).path(&self.dir),
            RunFile::Run(id).path(&self.dir),
        )
        .map_err(|e| Error::WriteError("merged run rename", e))?;
        self.sync_dir()
    }

    /// Makes renames durable. Directories cannot be opened for sync on
    /// every platform, so this is unix only.
    fn sync_dir(&self) -> Result<()> {
        if cfg!(unix) && self.sync_writes {
            fs::File::open(&self.dir)
                .and_then(|dir| dir.sync_all())
                .map_err(|e| Error::WriteError("directory sync", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lsm::filter::key_range;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> LsmConfig {
        LsmConfig::new(dir.path()).sync_writes(false).block_size(128)
    }

    fn entries(pairs: &[(&str, Option<&str>)]) -> Vec<Result<Entry>> {
        pairs
            .iter()
            .map(|(k, v)| Ok(Entry::new(k.as_bytes(), v.map(|v| v.as_bytes().to_vec()))))
            .collect()
    }

    fn collect(storage: &Storage, active: &Arc<Memtable>) -> Vec<Entry> {
        storage
            .range(active, None, key_range(..), Bytewise)
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_run_file_names() {
        let dir = Path::new("/data");
        for file in [RunFile::Run(7), RunFile::Temp(7), RunFile::Compacting(7)] {
            assert_eq!(RunFile::parse(&file.path(dir)), Some(file));
        }
        assert_eq!(RunFile::Run(7).path(dir), Path::new("/data/00000007.sst"));
        assert_eq!(RunFile::parse(Path::new("/data/LOCK")), None);
        assert_eq!(RunFile::parse(Path::new("/data/abc.sst")), None);
    }

    #[test]
    fn test_persist_and_reload() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let storage = Storage::open(&config)?;
        assert_eq!(storage.run_count(), 0);
        assert_eq!(storage.persist(entries(&[("a", Some("1")), ("b", None)]))?, 1);

        // A generation never changes; the new run shows up in the next one
        assert_eq!(storage.run_count(), 0);
        let storage = Storage::load(&config)?;
        assert_eq!(storage.run_count(), 1);
        assert_eq!(storage.next_run_id(), 2);
        assert!(!RunFile::Temp(1).path(dir.path()).exists());

        let active = Arc::new(Memtable::new());
        assert_eq!(
            collect(&storage, &active),
            vec![Entry::put("a", "1"), Entry::tombstone("b")]
        );
        Ok(())
    }

    #[test]
    fn test_range_ranks_newer_runs_and_buffers_higher() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        Storage::open(&config)?.persist(entries(&[("a", Some("old")), ("b", Some("old")), ("c", Some("old"))]))?;
        Storage::load(&config)?.persist(entries(&[("b", Some("new")), ("c", None)]))?;
        let storage = Storage::load(&config)?;

        let active = Arc::new(Memtable::new());
        active.put(Entry::put("c", "active"))?;
        let flushing = Arc::new(Memtable::new());
        flushing.put(Entry::put("a", "flushing"))?;
        flushing.put(Entry::put("c", "flushing"))?;

        let merged: Vec<Entry> = storage
            .range(&active, Some(&flushing), key_range(..), Bytewise)
            .collect::<Result<_>>()?;
        assert_eq!(
            merged,
            vec![
                Entry::put("a", "flushing"),
                Entry::put("b", "new"),
                Entry::put("c", "active"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_compaction_primitives() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        Storage::open(&config)?.persist(entries(&[("k1", Some("a")), ("k3", Some("x"))]))?;
        Storage::load(&config)?.persist(entries(&[("k1", Some("b")), ("k2", Some("c")), ("k3", None)]))?;
        let storage = Storage::load(&config)?;
        assert_eq!(storage.run_count(), 2);

        let id = storage
            .write_merged_run(&Arc::new(Memtable::new()), None)?
            .expect("merged output");
        assert_eq!(id, 2);
        assert!(RunFile::Compacting(2).path(dir.path()).exists());

        storage.delete_superseded_runs()?;
        assert!(!storage.is_live());
        assert!(!RunFile::Run(1).path(dir.path()).exists());
        assert!(matches!(
            storage.write_merged_run(&Arc::new(Memtable::new()), None),
            Err(Error::StaleHandle)
        ));

        storage.publish_merged_run(id)?;
        let compacted = Storage::load(&config)?;
        assert_eq!(compacted.run_count(), 1);
        assert_eq!(
            collect(&compacted, &Arc::new(Memtable::new())),
            vec![Entry::put("k1", "b"), Entry::put("k2", "c")]
        );
        Ok(())
    }

    #[test]
    fn test_merged_run_folds_in_buffers() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        Storage::open(&config)?.persist(entries(&[("a", Some("run")), ("b", Some("run"))]))?;
        let storage = Storage::load(&config)?;

        let active = Arc::new(Memtable::new());
        active.put(Entry::put("c", "active"))?;
        active.put(Entry::tombstone("b"))?;
        let flushing = Arc::new(Memtable::new());
        flushing.put(Entry::put("a", "flushing"))?;

        let id = storage
            .write_merged_run(&active, Some(&flushing))?
            .expect("merged output");
        assert_eq!(id, 1);
        storage.delete_superseded_runs()?;
        storage.publish_merged_run(id)?;

        let compacted = Storage::load(&config)?;
        let runs: Vec<Entry> = compacted
            .scan_runs(key_range(..), Bytewise)
            .collect::<Result<_>>()?;
        assert_eq!(runs, vec![Entry::put("a", "flushing"), Entry::put("c", "active")]);
        Ok(())
    }

    #[test]
    fn test_buffers_alone_merge_into_first_run() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let storage = Storage::open(&config)?;

        let active = Arc::new(Memtable::new());
        active.put(Entry::put("k", "v"))?;
        assert_eq!(storage.write_merged_run(&active, None)?, Some(1));
        assert!(RunFile::Compacting(1).path(dir.path()).exists());
        Ok(())
    }

    #[test]
    fn test_merge_of_only_tombstones_is_empty() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        Storage::open(&config)?.persist(entries(&[("k", None)]))?;
        let storage = Storage::load(&config)?;
        assert_eq!(storage.write_merged_run(&Arc::new(Memtable::new()), None)?, None);
        assert!(!RunFile::Compacting(1).path(dir.path()).exists());
        Ok(())
    }

    #[test]
    fn test_retired_generation_still_readable() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        Storage::open(&config)?.persist(entries(&[("k", Some("v"))]))?;
        let storage = Storage::load(&config)?;
        storage.delete_superseded_runs()?;

        // Open handles outlive the unlinked files
        if cfg!(unix) {
            assert_eq!(
                collect(&storage, &Arc::new(Memtable::new())),
                vec![Entry::put("k", "v")]
            );
        }
        assert!(matches!(storage.delete_superseded_runs(), Err(Error::StaleHandle)));
        Ok(())
    }
}
