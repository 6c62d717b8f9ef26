//! Cleanup of a storage directory left behind by an interrupted process.
//!
//! A flush that died leaves a `.sst.tmp` file, which is simply removed: its
//! buffer was never published, so nothing references it. A compaction that
//! died leaves a `.compacting` file. If that file is complete it already holds
//! the merge of every run up to its id, so the compaction is finished by
//! deleting those runs and renaming it. An incomplete one is discarded and
//! the original runs stay untouched.

use super::sstable::Table;
use super::storage::RunFile;
use crate::error::Result;

use std::{fs, path::Path};

pub(crate) fn recover_dir(dir: &Path) -> Result<()> {
    let mut runs = Vec::new();
    let mut temps = Vec::new();
    let mut compacting = Vec::new();

    for dir_entry in fs::read_dir(dir)? {
        match RunFile::parse(&dir_entry?.path()) {
            Some(RunFile::Run(id)) => runs.push(id),
            Some(RunFile::Temp(id)) => temps.push(id),
            Some(RunFile::Compacting(id)) => compacting.push(id),
            None => {}
        }
    }

    for id in temps {
        fs::remove_file(RunFile::Temp(id).path(dir))?;
        tracing::info!(run_id = id, "Removed unfinished run from interrupted flush");
    }

    compacting.sort_unstable();
    for id in compacting {
        let path = RunFile::Compacting(id).path(dir);
        // Only validate; the handle must be closed before the rename
        match Table::open(&path).map(drop) {
            Ok(()) => {
                for run_id in runs.iter().copied().filter(|run_id| *run_id <= id) {
                    let run_path = RunFile::Run(run_id).path(dir);
                    if run_path.exists() {
                        fs::remove_file(run_path)?;
                    }
                }
                runs.retain(|run_id| *run_id > id);
                fs::rename(&path, RunFile::Run(id).path(dir))?;
                runs.push(id);
                tracing::info!(run_id = id, "Completed interrupted compaction");
            }
            Err(e) => {
                fs::remove_file(&path)?;
                tracing::warn!(run_id = id, error = %e, "Discarded incomplete compaction output");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lsm::entry::Entry;
    use crate::store::lsm::sstable::write_table;
    use tempfile::TempDir;

    fn write_run(dir: &Path, file: RunFile, pairs: &[(&str, &str)]) {
        let entries = pairs.iter().map(|(k, v)| Ok(Entry::put(*k, *v)));
        write_table(&file.path(dir), entries, 4096, false).unwrap();
    }

    #[test]
    fn test_removes_temp_runs() -> Result<()> {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), RunFile::Run(1), &[("a", "1")]);
        fs::write(RunFile::Temp(2).path(dir.path()), b"partial")?;

        recover_dir(dir.path())?;
        assert!(RunFile::Run(1).path(dir.path()).exists());
        assert!(!RunFile::Temp(2).path(dir.path()).exists());
        Ok(())
    }

    #[test]
    fn test_completes_valid_compaction() -> Result<()> {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), RunFile::Run(1), &[("a", "1")]);
        write_run(dir.path(), RunFile::Run(2), &[("a", "2")]);
        write_run(dir.path(), RunFile::Compacting(2), &[("a", "2")]);

        recover_dir(dir.path())?;
        assert!(!RunFile::Run(1).path(dir.path()).exists());
        assert!(!RunFile::Compacting(2).path(dir.path()).exists());
        let table = Table::open(RunFile::Run(2).path(dir.path()))?;
        assert_eq!(table.entry_count(), 1);
        Ok(())
    }

    #[test]
    fn test_discards_incomplete_compaction() -> Result<()> {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), RunFile::Run(1), &[("a", "1")]);
        write_run(dir.path(), RunFile::Run(2), &[("b", "2")]);
        fs::write(RunFile::Compacting(2).path(dir.path()), b"torn write")?;

        recover_dir(dir.path())?;
        assert!(!RunFile::Compacting(2).path(dir.path()).exists());
        assert!(RunFile::Run(1).path(dir.path()).exists());
        assert!(RunFile::Run(2).path(dir.path()).exists());
        Ok(())
    }
}
