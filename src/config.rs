use std::path::PathBuf;

/// Configuration for the LSM store
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Directory holding the run files (default: ./strata)
    pub dir: PathBuf,

    /// Buffered bytes above which an upsert triggers a flush (default: 64MB)
    pub flush_threshold_bytes: usize,

    /// Target size of a data block inside a run (default: 4KB)
    pub block_size: usize,

    /// fsync run files before publishing them (default: true)
    pub sync_writes: bool,

    /// Thread name of the background worker (default: "strata-worker")
    pub worker_name: String,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./strata"),
            flush_threshold_bytes: 64 * 1024 * 1024, // 64MB
            block_size: 4096,
            sync_writes: true,
            worker_name: "strata-worker".to_string(),
        }
    }
}

impl LsmConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the auto-flush threshold
    pub fn flush_threshold_bytes(mut self, bytes: usize) -> Self {
        self.flush_threshold_bytes = bytes;
        self
    }

    /// Set the target data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size.max(1);
        self
    }

    /// Enable or disable fsync of new runs
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Set the background worker's thread name
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}
