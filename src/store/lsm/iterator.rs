//! K-way merge of sorted entry streams.
//!
//! Every source is tagged with a recency rank. When several sources hold the
//! same key, the entry from the highest rank wins and the others are skipped,
//! so the newest write shadows older ones no matter in which order the sources
//! were handed to [`MergeIterator::new`]. Tombstones are passed through;
//! callers that expose results drop them (see [`super::filter::TombstoneFilter`]).

use super::comparator::Comparator;
use super::entry::Entry;
use crate::error::{Error, Result};
use std::{
    cmp::Ordering,
    collections::{binary_heap::PeekMut, BinaryHeap, VecDeque},
};

/// Boxed stream of entries used as a merge source.
pub type KvIterator<'a> = Box<dyn Iterator<Item = Result<Entry>> + Send + 'a>;

/// Rank of the active write buffer, newer than anything else.
pub const ACTIVE_RANK: u64 = u64::MAX;
/// Rank of the buffer being flushed: older than the active one, newer than any run.
pub const FLUSHING_RANK: u64 = u64::MAX - 1;

/// A merge input: a sorted, duplicate-free stream and its recency rank.
/// Ranks must be unique among the sources of one merge.
pub struct Source<'a> {
    pub rank: u64,
    pub iter: KvIterator<'a>,
}

impl<'a> Source<'a> {
    pub fn new(rank: u64, iter: impl Iterator<Item = Result<Entry>> + Send + 'a) -> Self {
        Self {
            rank,
            iter: Box::new(iter),
        }
    }
}

struct HeapEntry<'a, C: Comparator> {
    entry: Entry,
    rank: u64,
    iterator: KvIterator<'a>,
    comparator: C,
}

impl<C: Comparator> std::fmt::Debug for HeapEntry<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("key", &self.entry.key())
            .field("rank", &self.rank)
            .finish()
    }
}

impl<C: Comparator> PartialEq for HeapEntry<'_, C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<C: Comparator> Eq for HeapEntry<'_, C> {}

impl<C: Comparator> PartialOrd for HeapEntry<'_, C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap pops the greatest element: smallest key first, and on equal keys
// the highest rank.
impl<C: Comparator> Ord for HeapEntry<'_, C> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.comparator.compare(self.entry.key(), other.entry.key()) {
            Ordering::Equal => self.rank.cmp(&other.rank),
            ord => ord.reverse(),
        }
    }
}

pub struct MergeIterator<'a, C: Comparator> {
    heap: BinaryHeap<HeapEntry<'a, C>>,
    errors: VecDeque<Error>,
    comparator: C,
}

impl<'a, C: Comparator> MergeIterator<'a, C> {
    pub fn new(comparator: C, sources: Vec<Source<'a>>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            errors: VecDeque::new(),
            comparator,
        };
        for source in sources {
            merge.advance(source.rank, source.iter);
        }
        merge
    }

    /// Pulls the next head of a source back into the heap. A failing source
    /// reports its error once and is dropped.
    fn advance(&mut self, rank: u64, mut iterator: KvIterator<'a>) {
        match iterator.next() {
            Some(Ok(entry)) => self.heap.push(HeapEntry {
                entry,
                rank,
                iterator,
                comparator: self.comparator.clone(),
            }),
            Some(Err(e)) => {
                tracing::warn!(rank, error = %e, "Merge source failed");
                self.errors.push_back(e);
            }
            None => {}
        }
    }
}

impl<C: Comparator> Iterator for MergeIterator<'_, C> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.errors.pop_front() {
            return Some(Err(err));
        }

        let winner = self.heap.pop()?;
        let entry = winner.entry;
        self.advance(winner.rank, winner.iterator);

        // Skip every older version of the same key
        loop {
            let shadowed = match self.heap.peek_mut() {
                Some(head) if self.comparator.equal(head.entry.key(), entry.key()) => {
                    PeekMut::pop(head)
                }
                _ => break,
            };
            self.advance(shadowed.rank, shadowed.iterator);
        }

        Some(Ok(entry))
    }
}

impl<C: Comparator> std::fmt::Debug for MergeIterator<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeIterator")
            .field("heads", &self.heap.len())
            .field("pending_errors", &self.errors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lsm::comparator::Bytewise;

    fn source(rank: u64, entries: Vec<Entry>) -> Source<'static> {
        Source::new(rank, entries.into_iter().map(Ok))
    }

    fn collect(iter: MergeIterator<'_, Bytewise>) -> Vec<Entry> {
        iter.collect::<Result<Vec<_>>>().expect("merge failed")
    }

    #[test]
    fn test_merge_sorted_union() {
        let merged = collect(MergeIterator::new(
            Bytewise,
            vec![
                source(1, vec![Entry::put("a", "1"), Entry::put("d", "4")]),
                source(2, vec![Entry::put("b", "2"), Entry::put("e", "5")]),
                source(3, vec![Entry::put("c", "3")]),
            ],
        ));

        let keys: Vec<_> = merged.iter().map(|e| e.key().to_vec()).collect();
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]
        );
    }

    #[test]
    fn test_newest_rank_wins_regardless_of_order() {
        let older_first = vec![
            source(FLUSHING_RANK, vec![Entry::put("k", "old")]),
            source(ACTIVE_RANK, vec![Entry::put("k", "new")]),
        ];
        let newer_first = vec![
            source(ACTIVE_RANK, vec![Entry::put("k", "new")]),
            source(FLUSHING_RANK, vec![Entry::put("k", "old")]),
        ];

        for sources in [older_first, newer_first] {
            let merged = collect(MergeIterator::new(Bytewise, sources));
            assert_eq!(merged, vec![Entry::put("k", "new")]);
        }
    }

    #[test]
    fn test_shadowed_sources_advance_past_key() {
        let merged = collect(MergeIterator::new(
            Bytewise,
            vec![
                source(1, vec![Entry::put("a", "run1"), Entry::put("b", "run1"), Entry::put("c", "run1")]),
                source(2, vec![Entry::put("b", "run2")]),
                source(3, vec![Entry::put("b", "run3"), Entry::put("c", "run3")]),
            ],
        ));

        assert_eq!(
            merged,
            vec![
                Entry::put("a", "run1"),
                Entry::put("b", "run3"),
                Entry::put("c", "run3"),
            ]
        );
    }

    #[test]
    fn test_tombstones_pass_through() {
        let merged = collect(MergeIterator::new(
            Bytewise,
            vec![
                source(1, vec![Entry::put("a", "1"), Entry::put("b", "2")]),
                source(2, vec![Entry::tombstone("a")]),
            ],
        ));

        assert_eq!(merged, vec![Entry::tombstone("a"), Entry::put("b", "2")]);
    }

    #[test]
    fn test_empty_sources() {
        let mut merged = MergeIterator::new(Bytewise, vec![source(1, vec![]), source(2, vec![])]);
        assert!(merged.next().is_none());
    }

    #[test]
    fn test_failing_source_reports_once() {
        let failing = Source::new(
            2,
            vec![Err(Error::ChecksumMismatch)].into_iter(),
        );
        let mut merged = MergeIterator::new(
            Bytewise,
            vec![source(1, vec![Entry::put("a", "1")]), failing],
        );

        assert!(matches!(merged.next(), Some(Err(Error::ChecksumMismatch))));
        assert_eq!(merged.next().unwrap().unwrap(), Entry::put("a", "1"));
        assert!(merged.next().is_none());
    }
}
