//! On-disk run files.
//!
//! A run is an immutable sorted file made of prefix-compressed data blocks,
//! a sparse index holding the first key of every block, and a fixed footer.
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |  ← ~block_size bytes, restart point every 16 entries
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Index Block       |  ← key_len:u16 | key | offset:u64 | size:u64
//! +-------------------+
//! | Footer            |  ← index_offset | entry_count | index_crc32 | magic
//! +-------------------+
//! ```
//!
//! ### Block Entry Format
//! ```text
//! +----------------+----------------+-------------+--------+-------+
//! |shared_len:u16  |unshared_len:u16|value_len:u32| key   | value |
//! +----------------+----------------+-------------+--------+-------+
//! ```
//!
//! A `value_len` of `u32::MAX` marks a tombstone and is followed by no value
//! bytes. Tombstones must survive flushes so that they keep shadowing older
//! runs until compaction merges everything into a single run.

mod index;

pub mod block;
pub mod table;

pub use table::{write_table, Table, TableBuilder};
