//! Memtable implementation using a concurrent skip list.
//!
//! The memtable is the first level of the LSM tree: every upsert lands here
//! and stays until the buffer is sealed and flushed into a run.
//!
//! # Crossbeam SkipMap
//!
//! `crossbeam-skiplist::SkipMap` gives lock-free concurrent inserts and point
//! lookups plus ordered range iteration, which is everything the write path
//! and the merge path need. Keys sort by `Vec<u8>`'s `Ord`, the same order as
//! [`Bytewise`](crate::store::lsm::Bytewise) and the run files.
//!
//! # Lifecycle
//!
//! 1. **Active**: accepts writes and accounts their size
//! 2. **Frozen**: sealed for flushing; reads only, `put` fails with `Frozen`
//! 3. **Dropped**: once the flushed run is published no snapshot holds it

use crate::error::Result;
use crate::store::lsm::entry::Entry;
use crate::store::lsm::filter::KeyRange;
use crate::Error;
use crossbeam_skiplist::SkipMap;
use std::{
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

/// In-memory sorted table using a concurrent skip list.
///
/// A `None` value is a tombstone. The size counter is the running sum of the
/// approximate size of every accepted write, overwrites included.
#[derive(Debug, Default)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Option<Vec<u8>>>,
    size: AtomicUsize,
    frozen: AtomicBool,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites an entry and returns the size counter after the add.
    pub fn put(&self, entry: Entry) -> Result<usize> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        let entry_size = entry.approximate_size();
        let (key, value) = entry.into_parts();
        self.data.insert(key, value);
        Ok(self.size.fetch_add(entry_size, Ordering::SeqCst) + entry_size)
    }

    /// `Some` for a stored value or tombstone, `None` if the key was never written here.
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.data
            .get(key)
            .map(|e| Entry::new(e.key().clone(), e.value().clone()))
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Prevents further writes; freezing twice is an error.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Ordered iterator over `range` that keeps the memtable alive by itself.
    pub fn scan(self: &Arc<Self>, range: KeyRange) -> MemtableIterator {
        MemtableIterator::new(Arc::clone(self), range)
    }
}

/// Lazy iterator over a memtable range.
///
/// Each step re-seeks the skip list just past the last returned key, so the
/// iterator owns nothing but an `Arc` and sees writes that land ahead of it.
pub struct MemtableIterator {
    memtable: Arc<Memtable>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    exhausted: bool,
}

impl MemtableIterator {
    pub fn new(memtable: Arc<Memtable>, range: KeyRange) -> Self {
        let (lower, upper) = range;
        Self {
            memtable,
            lower,
            upper,
            exhausted: false,
        }
    }

    // Inverted or collapsed bounds never reach the skip list
    fn is_empty_range(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }
}

impl Iterator for MemtableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted || self.is_empty_range() {
            self.exhausted = true;
            return None;
        }

        let next = self
            .memtable
            .data
            .range((self.lower.clone(), self.upper.clone()))
            .next()
            .map(|e| Entry::new(e.key().clone(), e.value().clone()));

        match next {
            Some(entry) => {
                self.lower = Bound::Excluded(entry.key().to_vec());
                Some(Ok(entry))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}
