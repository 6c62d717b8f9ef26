//! Iterator filtering utilities for LSM tree components.
//!
//! Adapters over streams of `Result<Entry>` shared by the run files, the
//! merge iterator and the store's scan path.

use super::comparator::{Bytewise, Comparator};
use super::entry::Entry;
use crate::error::Result;
use std::cmp::Ordering;
use std::ops::{Bound, RangeBounds};

/// An owned key range. Every scan in the store is normalised to this shape.
pub type KeyRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

/// Normalises any `RangeBounds<Vec<u8>>` into a [`KeyRange`].
pub fn key_range(range: impl RangeBounds<Vec<u8>>) -> KeyRange {
    (range.start_bound().cloned(), range.end_bound().cloned())
}

/// The half-open range `[from, to)`; `None` leaves that side unbounded.
pub fn half_open(from: Option<&[u8]>, to: Option<&[u8]>) -> KeyRange {
    (
        from.map_or(Bound::Unbounded, |k| Bound::Included(k.to_vec())),
        to.map_or(Bound::Unbounded, |k| Bound::Excluded(k.to_vec())),
    )
}

/// A generic iterator adapter that filters entries by a key range.
///
/// The inner iterator must be sorted by the same comparator; the filter stops
/// at the first key past the end bound.
///
/// # Examples
///
/// ```ignore
/// let filtered = RangeFilter::new(run_iter, key_range(b"key_010".to_vec()..=b"key_020".to_vec()));
/// ```
pub struct RangeFilter<I, C = Bytewise>
where
    I: Iterator<Item = Result<Entry>>,
    C: Comparator,
{
    inner: I,
    range: KeyRange,
    comparator: C,
    done: bool,
}

impl<I> RangeFilter<I, Bytewise>
where
    I: Iterator<Item = Result<Entry>>,
{
    pub fn new(inner: I, range: KeyRange) -> Self {
        Self::with_comparator(inner, range, Bytewise)
    }
}

impl<I, C> RangeFilter<I, C>
where
    I: Iterator<Item = Result<Entry>>,
    C: Comparator,
{
    pub fn with_comparator(inner: I, range: KeyRange, comparator: C) -> Self {
        Self {
            inner,
            range,
            comparator,
            done: false,
        }
    }

    fn is_before_start(&self, key: &[u8]) -> bool {
        match &self.range.0 {
            Bound::Included(start) => self.comparator.compare(key, start) == Ordering::Less,
            Bound::Excluded(start) => self.comparator.compare(key, start) != Ordering::Greater,
            Bound::Unbounded => false,
        }
    }

    fn is_beyond_end(&self, key: &[u8]) -> bool {
        match &self.range.1 {
            Bound::Included(end) => self.comparator.compare(key, end) == Ordering::Greater,
            Bound::Excluded(end) => self.comparator.compare(key, end) != Ordering::Less,
            Bound::Unbounded => false,
        }
    }
}

impl<I, C> Iterator for RangeFilter<I, C>
where
    I: Iterator<Item = Result<Entry>>,
    C: Comparator,
{
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next()? {
                Ok(entry) => {
                    if self.is_beyond_end(entry.key()) {
                        self.done = true;
                        return None;
                    }
                    if !self.is_before_start(entry.key()) {
                        return Some(Ok(entry));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Drops tombstones from a merged stream; the last step of every scan.
pub struct TombstoneFilter<I> {
    inner: I,
}

impl<I> TombstoneFilter<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I> Iterator for TombstoneFilter<I>
where
    I: Iterator<Item = Result<Entry>>,
{
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(entry) if entry.is_tombstone() => continue,
                other => return Some(other),
            }
        }
    }
}
