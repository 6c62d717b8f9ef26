//! Sparse block index: one entry per data block, keyed by its first key.

use std::convert::TryFrom;
use std::io::{Read, Write};
use std::ops::{Bound, RangeBounds};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    /// `(first_key, block_offset, block_size)`, sorted by key.
    entries: Vec<(Vec<u8>, u64, u64)>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: Vec<u8>, offset: u64, size: u64) {
        self.entries.push((key, offset, size));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.0.as_slice().cmp(key))
    }

    /// Returns `(offset, size)` of every block that may hold keys in `range`.
    pub fn range(&self, range: impl RangeBounds<Vec<u8>>) -> Vec<(u64, u64)> {
        let start_index = match range.start_bound() {
            // A block starting exactly at the key is the first candidate,
            // otherwise the key can only live in the preceding block.
            Bound::Included(start) | Bound::Excluded(start) => match self.search(start) {
                Ok(idx) => idx,
                Err(idx) => idx.saturating_sub(1),
            },
            Bound::Unbounded => 0,
        };

        let end_index = match range.end_bound() {
            Bound::Included(end) => match self.search(end) {
                Ok(idx) => idx + 1,
                Err(idx) => idx,
            },
            Bound::Excluded(end) => match self.search(end) {
                Ok(idx) | Err(idx) => idx,
            },
            Bound::Unbounded => self.entries.len(),
        };

        if start_index >= end_index {
            return Vec::new();
        }

        self.entries[start_index..end_index]
            .iter()
            .map(|(_, offset, size)| (*offset, *size))
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for (key, offset, size) in &self.entries {
            buffer.write_u16::<BigEndian>(key.len() as u16)?;
            buffer.write_all(key)?;
            buffer.write_u64::<BigEndian>(*offset)?;
            buffer.write_u64::<BigEndian>(*size)?;
        }
        Ok(buffer)
    }
}

impl TryFrom<&[u8]> for Index {
    type Error = Error;

    fn try_from(buffer: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buffer);
        let mut entries = Vec::new();

        while (cursor.position() as usize) < buffer.len() {
            let key_len = cursor
                .read_u16::<BigEndian>()
                .map_err(|e| Error::ReadError("key length in index block", e))?
                as usize;

            let mut key = vec![0u8; key_len];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::ReadError("key in index block", e))?;

            let block_offset = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::ReadError("block offset in index block", e))?;

            let block_size = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::ReadError("block size in index block", e))?;

            entries.push((key, block_offset, block_size));
        }
        Ok(Self { entries })
    }
}
