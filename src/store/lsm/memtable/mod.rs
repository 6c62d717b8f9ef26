pub mod core;

// Re-export all types for easy access
pub use self::core::{Memtable, MemtableIterator};
