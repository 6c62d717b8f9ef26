//! strata: an embeddable LSM key-value store.
//!
//! ```no_run
//! use strata::{LsmStore, Store};
//!
//! # fn main() -> strata::Result<()> {
//! let store = LsmStore::open("/tmp/strata-demo")?;
//! store.set(b"key", b"value".to_vec())?;
//! assert_eq!(store.get(b"key")?.and_then(|e| e.value().map(<[u8]>::to_vec)), Some(b"value".to_vec()));
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod flock;
pub mod scheduler;
pub mod store;

pub use config::LsmConfig;
pub use error::{Error, Result};
pub use store::lsm::{Entry, LsmStore, StoreMetrics};
pub use store::{ScanIterator, Store};
