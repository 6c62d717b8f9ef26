//! Exclusive advisory lock on the storage directory.
//!
//! Only one store may own a directory at a time; a second `open` of the same
//! directory, from this process or another one, fails instead of letting two
//! workers write runs side by side.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Opens (creating if needed) and locks the file at `path`.
    /// On success the file holds the owning process ID.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Don't truncate before the lock is ours, the owner's PID lives there
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking here; single-process use is the caller's job
        Ok(())
    }

    /// Releases the lock. The lock file itself stays on disk.
    pub fn unlock(self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use libc::{flock, LOCK_UN};

            let result = unsafe { flock(self.file.as_raw_fd(), LOCK_UN) };
            if result != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("LOCK");

        let lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        assert_eq!(lock.path(), lock_path.as_path());

        let content = fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());

        lock.unlock().expect("Failed to release lock");
    }

    #[cfg(unix)]
    #[test]
    fn test_double_lock() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("LOCK");

        let first = FileLock::lock(&lock_path).expect("Failed to acquire first lock");
        assert!(FileLock::lock(&lock_path).is_err());

        // The failed attempt must not have clobbered the owner's PID
        let content = fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());

        first.unlock().expect("Failed to release lock");
        let _second = FileLock::lock(&lock_path).expect("Lock should be free after unlock");
    }

    #[test]
    fn test_relock_after_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("LOCK");

        {
            let _lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        }

        let _again = FileLock::lock(&lock_path).expect("Lock should be free after drop");
    }
}
