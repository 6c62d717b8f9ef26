//! Run files: building them from a sorted entry stream and reading them back.
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Footer (24 bytes) |  index_offset:u64 | entry_count:u64 | index_crc:u32 | magic:u32
//! +-------------------+
//! ```

use super::block::{read_exact_at, Builder, MultiBlockIterator};
use super::index::Index;
use crate::error::Result;
use crate::store::lsm::entry::Entry;
use crate::store::lsm::filter::{KeyRange, RangeFilter};
use crate::Error;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const FOOTER_SIZE: u64 = 24;
pub const MAGIC: u32 = 0x5354_5254;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Writes a run file block by block. Entries must be added in strictly
/// ascending key order.
pub struct TableBuilder {
    writer: BufWriter<File>,
    path: PathBuf,
    index: Index,
    block: Builder,
    first_key_in_block: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    offset: u64,
    block_size: usize,
    entry_count: u64,
}

impl TableBuilder {
    pub fn create(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| Error::WriteError("run file", e))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            index: Index::new(),
            block: Builder::new(),
            first_key_in_block: None,
            last_key: None,
            offset: 0,
            block_size: block_size.max(1),
            entry_count: 0,
        })
    }

    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if entry.key() <= last.as_slice() {
                return Err(Error::InvalidOperation(format!(
                    "keys out of order while writing {}",
                    self.path.display()
                )));
            }
        }

        self.block.add_entry(entry.key(), entry.value())?;
        if self.first_key_in_block.is_none() {
            self.first_key_in_block = Some(entry.key().to_vec());
        }
        self.last_key = Some(entry.key().to_vec());
        self.entry_count += 1;

        if self.block.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.block, Builder::new());
        let data = block.finish()?;
        let first_key = self.first_key_in_block.take().unwrap_or_default();

        self.writer
            .write_all(&data)
            .map_err(|e| Error::WriteError("data block", e))?;
        self.index.push(first_key, self.offset, data.len() as u64);
        self.offset += data.len() as u64;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Writes the index and footer. With `sync` the file is fsynced before
    /// returning. Returns the number of entries written.
    pub fn finish(mut self, sync: bool) -> Result<u64> {
        self.flush_block()?;

        let index_data = self.index.encode()?;
        let index_offset = self.offset;
        let mut footer = Vec::with_capacity(FOOTER_SIZE as usize);
        footer.write_u64::<BigEndian>(index_offset)?;
        footer.write_u64::<BigEndian>(self.entry_count)?;
        footer.write_u32::<BigEndian>(CRC32.checksum(&index_data))?;
        footer.write_u32::<BigEndian>(MAGIC)?;

        self.writer
            .write_all(&index_data)
            .and_then(|_| self.writer.write_all(&footer))
            .and_then(|_| self.writer.flush())
            .map_err(|e| Error::WriteError("index and footer", e))?;

        if sync {
            self.writer
                .get_ref()
                .sync_all()
                .map_err(|e| Error::WriteError("run file sync", e))?;
        }
        Ok(self.entry_count)
    }
}

/// Writes `entries` as a complete run at `path`. A partially written file is
/// removed before the error is returned.
pub fn write_table<I>(path: &Path, entries: I, block_size: usize, sync: bool) -> Result<u64>
where
    I: IntoIterator<Item = Result<Entry>>,
{
    let result = TableBuilder::create(path, block_size).and_then(|mut builder| {
        for entry in entries {
            builder.add(&entry?)?;
        }
        builder.finish(sync)
    });

    if result.is_err() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial run");
        }
    }
    result
}

/// An open, validated run file.
#[derive(Debug)]
pub struct Table {
    file: Arc<File>,
    path: PathBuf,
    index: Index,
    entry_count: u64,
}

impl Table {
    /// Opens a run and loads its index, validating magic and checksum.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::ReadError("run file", e))?;
        let file_size = file.metadata()?.len();

        if file_size < FOOTER_SIZE {
            return Err(Error::IndexCorruption(format!(
                "{} is too short to hold a footer",
                path.display()
            )));
        }

        let footer = read_exact_at(&file, file_size - FOOTER_SIZE, FOOTER_SIZE)
            .map_err(|e| Error::ReadError("footer", e))?;
        let index_offset = BigEndian::read_u64(&footer[0..8]);
        let entry_count = BigEndian::read_u64(&footer[8..16]);
        let index_crc = BigEndian::read_u32(&footer[16..20]);
        let magic = BigEndian::read_u32(&footer[20..24]);

        if magic != MAGIC {
            return Err(Error::IndexCorruption(format!(
                "{} has a bad magic number {:#010x}",
                path.display(),
                magic
            )));
        }
        if index_offset > file_size - FOOTER_SIZE {
            return Err(Error::IndexCorruption(format!(
                "{} index offset {} is past the end of the file",
                path.display(),
                index_offset
            )));
        }

        let index_data = read_exact_at(&file, index_offset, file_size - FOOTER_SIZE - index_offset)
            .map_err(|e| Error::ReadError("index block", e))?;
        if CRC32.checksum(&index_data) != index_crc {
            return Err(Error::ChecksumMismatch);
        }
        let index = Index::try_from(index_data.as_slice())?;

        Ok(Self {
            file: Arc::new(file),
            path,
            index,
            entry_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Iterates the entries in `range`, tombstones included.
    pub fn scan(&self, range: KeyRange) -> Result<ScanIterator> {
        let blocks = self.index.range(range.clone());
        let mut multi_block_iter = MultiBlockIterator::new(self.file.clone(), blocks);

        if let Bound::Included(start) | Bound::Excluded(start) = &range.0 {
            multi_block_iter.seek_first_block(start)?;
        }

        Ok(RangeFilter::new(multi_block_iter, range))
    }
}

pub type ScanIterator = RangeFilter<MultiBlockIterator>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lsm::filter::key_range;
    use tempfile::TempDir;

    fn sample_entries() -> Vec<Entry> {
        (0..500)
            .map(|i| {
                let key = format!("key_{:04}", i);
                if i % 7 == 0 {
                    Entry::tombstone(key)
                } else {
                    Entry::put(key, format!("value_{}", i))
                }
            })
            .collect()
    }

    fn write_sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("00000001.sst");
        let count = write_table(
            &path,
            sample_entries().into_iter().map(Ok),
            256,
            false,
        )
        .unwrap();
        assert_eq!(count, 500);
        path
    }

    #[test]
    fn test_write_and_scan_all() {
        let dir = TempDir::new().unwrap();
        let table = Table::open(write_sample(&dir)).unwrap();

        assert_eq!(table.entry_count(), 500);
        assert!(table.index.len() > 1, "sample should span several blocks");

        let scanned: Vec<Entry> = table.scan(key_range(..)).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(scanned, sample_entries());
        assert!(scanned[0].is_tombstone());
    }

    #[test]
    fn test_scan_bounds() {
        let dir = TempDir::new().unwrap();
        let table = Table::open(write_sample(&dir)).unwrap();

        let keys: Vec<Vec<u8>> = table
            .scan(key_range(b"key_0100".to_vec()..b"key_0105".to_vec()))
            .unwrap()
            .map(|e| e.unwrap().key().to_vec())
            .collect();
        let expected: Vec<Vec<u8>> = (100..105).map(|i| format!("key_{:04}", i).into_bytes()).collect();
        assert_eq!(keys, expected);

        // Excluded start between entries and past the end
        let mut iter = table
            .scan((Bound::Excluded(b"key_0250".to_vec()), Bound::Unbounded))
            .unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key(), b"key_0251");
        assert!(table.scan(key_range(b"zzz".to_vec()..)).unwrap().next().is_none());
    }

    #[test]
    fn test_empty_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.sst");
        assert_eq!(write_table(&path, std::iter::empty(), 4096, true).unwrap(), 0);

        let table = Table::open(&path).unwrap();
        assert_eq!(table.entry_count(), 0);
        assert!(table.scan(key_range(..)).unwrap().next().is_none());
    }

    #[test]
    fn test_rejects_unsorted_input() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.sst");
        let entries = vec![Ok(Entry::put("b", "1")), Ok(Entry::put("a", "2"))];

        assert!(matches!(
            write_table(&path, entries, 4096, false),
            Err(Error::InvalidOperation(_))
        ));
        assert!(!path.exists(), "partial run should be removed");
    }

    #[test]
    fn test_corrupted_footer_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(&dir);
        let mut data = fs::read(&path).unwrap();
        let len = data.len();

        // Flip a magic byte
        data[len - 1] ^= 0xff;
        fs::write(&path, &data).unwrap();
        assert!(matches!(Table::open(&path), Err(Error::IndexCorruption(_))));

        // Restore magic, corrupt the index instead
        data[len - 1] ^= 0xff;
        let index_offset = BigEndian::read_u64(&data[len - 24..len - 16]) as usize;
        data[index_offset] ^= 0xff;
        fs::write(&path, &data).unwrap();
        assert!(matches!(Table::open(&path), Err(Error::ChecksumMismatch)));

        // Truncated file
        fs::write(&path, &data[..10]).unwrap();
        assert!(Table::open(&path).is_err());
    }

    #[test]
    fn test_concurrent_scans() {
        let dir = TempDir::new().unwrap();
        let table = Arc::new(Table::open(write_sample(&dir)).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || table.scan(key_range(..)).unwrap().count())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 500);
        }
    }
}
