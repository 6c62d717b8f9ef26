pub mod lsm;

use crate::error::Result;
use crate::store::lsm::Entry;
use std::ops::RangeBounds;

pub trait Store: Send + Sync {
    /// The iterator returned by scan().
    type ScanIterator<'a>: ScanIterator + 'a
    where
        Self: Sized + 'a; // omit in trait objects, for dyn compatibility

    /// Retrieves the live entry for a key. Deleted keys are not found.
    fn get(&self, key: &[u8]) -> Result<Option<Entry>>;

    /// Iterates over an ordered range of live entries.
    fn scan<'a>(
        &'a self,
        range: impl RangeBounds<Vec<u8>> + Clone + Send + Sync + 'a,
    ) -> Self::ScanIterator<'a>
    where
        Self: Sized; // omit in trait objects, for dyn compatibility

    /// Iterates over all live entries whose key starts with the given prefix.
    fn scan_prefix<'a>(&'a self, prefix: &'a [u8]) -> Self::ScanIterator<'a>
    where
        Self: Sized, // omit in trait objects, for dyn compatibility
    {
        let start = std::ops::Bound::Included(prefix.to_vec());
        let end = match prefix.iter().rposition(|b| *b != 0xff) {
            Some(i) => std::ops::Bound::Excluded(
                prefix[..i]
                    .iter()
                    .chain(std::iter::once(&(prefix[i] + 1)))
                    .copied()
                    .collect::<Vec<u8>>(),
            ),
            None => std::ops::Bound::Unbounded,
        };
        self.scan((start, end))
    }

    /// Inserts or overwrites an entry; a tombstone deletes the key.
    fn upsert(&self, entry: Entry) -> Result<()>;

    /// Inserts or updates a key-value pair.
    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.upsert(Entry::put(key, value))
    }

    /// Deletes a key by writing a tombstone.
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.upsert(Entry::tombstone(key))
    }

    /// Schedules a flush of buffered writes. Data is not durable until it
    /// has been flushed.
    fn flush(&self) -> Result<()>;

    /// Schedules merging all runs into one.
    fn compact(&self) -> Result<()>;

    /// Flushes, waits for background work and releases the directory.
    fn close(&self) -> Result<()>;
}

pub trait ScanIterator: Iterator<Item = Result<Entry>> {}

impl<I> ScanIterator for I where I: Iterator<Item = Result<Entry>> {}
