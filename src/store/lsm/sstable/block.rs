use std::{cmp::Ordering, fs::File, io, sync::Arc};

use crate::store::lsm::entry::Entry;
use crate::{error::Result, Error};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

const RESTART_INTERVAL: usize = 16;
const ENTRY_HEADER_LEN: usize = 8;

/// `value_len` marker for a tombstone. Real values are shorter than this.
pub const TOMBSTONE_LEN: u32 = u32::MAX;

/// Longest key the entry header and the index can describe.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Fails with `InvalidOperation` if the entry cannot be written to a run.
pub fn check_entry(key: &[u8], value: Option<&[u8]>) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidOperation(format!(
            "key of {} bytes exceeds the run format limit",
            key.len()
        )));
    }
    match value {
        Some(v) if v.len() >= TOMBSTONE_LEN as usize => Err(Error::InvalidOperation(format!(
            "value of {} bytes exceeds the run format limit",
            v.len()
        ))),
        _ => Ok(()),
    }
}

pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry; keys must arrive in ascending order.
    pub fn add_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        check_entry(key, value)?;
        let value_len = value.map_or(TOMBSTONE_LEN, |v| v.len() as u32);

        let shared_prefix_len = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared_key_len = key.len() - shared_prefix_len;

        self.buffer.write_u16::<BigEndian>(shared_prefix_len as u16)?;
        self.buffer.write_u16::<BigEndian>(unshared_key_len as u16)?;
        self.buffer.write_u32::<BigEndian>(value_len)?;
        self.buffer.extend_from_slice(&key[shared_prefix_len..]);
        if let Some(v) = value {
            self.buffer.extend_from_slice(v);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos)?;
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)?;
        Ok(self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

fn eof(what: &'static str) -> Error {
    Error::Decode(what, io::Error::new(io::ErrorKind::UnexpectedEof, "data too short"))
}

/// A decoded data block: entry bytes plus restart offsets.
pub struct Block {
    data: Vec<u8>,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn new(mut data: Vec<u8>) -> Result<Self> {
        let data_len = data.len();
        if data_len < 4 {
            return Err(eof("block trailer"));
        }

        let num_restarts_offset = data_len - 4;
        let num_restarts = BigEndian::read_u32(&data[num_restarts_offset..]) as usize;

        let restart_array_size = num_restarts
            .checked_mul(4)
            .filter(|size| *size <= num_restarts_offset)
            .ok_or_else(|| eof("block restart positions"))?;

        let restart_array_offset = num_restarts_offset - restart_array_size;
        let restart_positions = data[restart_array_offset..num_restarts_offset]
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .collect();

        data.truncate(restart_array_offset);
        Ok(Self {
            data,
            restart_positions,
        })
    }

    pub fn iter(self: Arc<Self>) -> BlockIterator {
        BlockIterator::new(self)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Reads the `(shared, unshared, value_len)` header at `pos`.
    fn header_at(&self, pos: usize) -> Result<(usize, usize, u32)> {
        let header = self
            .data
            .get(pos..pos + ENTRY_HEADER_LEN)
            .ok_or_else(|| eof("block entry header"))?;
        Ok((
            BigEndian::read_u16(&header[0..2]) as usize,
            BigEndian::read_u16(&header[2..4]) as usize,
            BigEndian::read_u32(&header[4..8]),
        ))
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    current_offset: usize,
    last_key: Vec<u8>,
}

impl BlockIterator {
    pub fn new(block: Arc<Block>) -> Self {
        let initial_offset = block.restart_positions.first().map_or(0, |&p| p as usize);
        Self {
            block,
            current_offset: initial_offset,
            last_key: Vec::new(),
        }
    }

    /// Reads the full key stored at a restart point without moving the iterator.
    fn restart_key(&self, offset: usize) -> Result<&[u8]> {
        let (shared_len, unshared_len, _) = self.block.header_at(offset)?;
        if shared_len != 0 {
            return Err(Error::IndexCorruption(
                "Restart point key has a shared prefix".into(),
            ));
        }
        let start = offset + ENTRY_HEADER_LEN;
        self.block
            .data
            .get(start..start + unshared_len)
            .ok_or_else(|| Error::IndexCorruption("Entry out of bounds".into()))
    }

    /// Positions the iterator so that the next call to `next()` returns the
    /// first key >= `target`, or `None` if there is none.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        let restarts = &self.block.restart_positions;
        if restarts.is_empty() {
            self.current_offset = self.block.data.len();
            return Ok(());
        }

        // Last restart point whose key is < target
        let mut left = 0;
        let mut right = restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            match self.restart_key(restarts[mid] as usize)?.cmp(target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart_index = left.saturating_sub(1);

        self.current_offset = restarts[restart_index] as usize;
        self.last_key.clear();

        loop {
            let offset = self.current_offset;
            let last_key = self.last_key.clone();
            match self.next() {
                Some(Ok(entry)) if entry.key() >= target => {
                    // Step back so next() yields this entry again
                    self.current_offset = offset;
                    self.last_key = last_key;
                    return Ok(());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    fn decode_next(&mut self) -> Result<Entry> {
        let mut pos = self.current_offset;
        let (shared_len, unshared_len, value_len) = self.block.header_at(pos)?;
        pos += ENTRY_HEADER_LEN;

        let data = &self.block.data;
        let stored_value_len = if value_len == TOMBSTONE_LEN {
            0
        } else {
            value_len as usize
        };
        if shared_len > self.last_key.len() || pos + unshared_len + stored_value_len > data.len() {
            return Err(Error::IndexCorruption("Block entry out of bounds".into()));
        }

        let mut key = Vec::with_capacity(shared_len + unshared_len);
        key.extend_from_slice(&self.last_key[..shared_len]);
        key.extend_from_slice(&data[pos..pos + unshared_len]);
        pos += unshared_len;

        let value = if value_len == TOMBSTONE_LEN {
            None
        } else {
            Some(data[pos..pos + stored_value_len].to_vec())
        };
        pos += stored_value_len;

        self.current_offset = pos;
        self.last_key.clone_from(&key);
        Ok(Entry::new(key, value))
    }
}

impl Iterator for BlockIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_offset >= self.block.data.len() {
            return None;
        }
        match self.decode_next() {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => {
                // A corrupt entry poisons the rest of the block
                self.current_offset = self.block.data.len();
                Some(Err(e))
            }
        }
    }
}

/// Reads `size` bytes at `offset` without touching the file cursor, so one
/// handle can serve any number of concurrent scans.
pub(crate) fn read_exact_at(file: &File, offset: u64, size: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(&mut buf, offset)?;
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            match file.seek_read(&mut buf[read..], offset + read as u64)? {
                0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                n => read += n,
            }
        }
    }

    Ok(buf)
}

/// Chains the blocks of one run together, loading each lazily.
pub struct MultiBlockIterator {
    file: Arc<File>,
    blocks: Vec<(u64, u64)>, // Block offset and size
    current_block_iter: Option<BlockIterator>,
    current_block_index: usize,
}

impl MultiBlockIterator {
    pub fn new(file: Arc<File>, blocks: Vec<(u64, u64)>) -> Self {
        Self {
            file,
            blocks,
            current_block_iter: None,
            current_block_index: 0,
        }
    }

    /// Seek to the first key >= target in the first block
    pub fn seek_first_block(&mut self, target: &[u8]) -> Result<()> {
        if !self.blocks.is_empty() && self.current_block_index == 0 {
            self.load_current_block()?;
            if let Some(iter) = &mut self.current_block_iter {
                iter.seek(target)?;
            }
        }
        Ok(())
    }

    fn load_current_block(&mut self) -> Result<()> {
        let Some(&(offset, size)) = self.blocks.get(self.current_block_index) else {
            self.current_block_iter = None;
            return Ok(());
        };

        let block_data = read_exact_at(&self.file, offset, size)
            .map_err(|e| Error::ReadError("data block", e))?;
        let block = Arc::new(Block::new(block_data)?);
        self.current_block_iter = Some(block.iter());
        self.current_block_index += 1;

        Ok(())
    }
}

impl Iterator for MultiBlockIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current_block_iter {
                if let Some(entry) = iter.next() {
                    return Some(entry);
                }
            }

            if let Err(e) = self.load_current_block() {
                // Stop after reporting, a missing block cannot be skipped over
                self.current_block_index = self.blocks.len();
                self.current_block_iter = None;
                return Some(Err(e));
            }

            self.current_block_iter.as_ref()?;
        }
    }
}
