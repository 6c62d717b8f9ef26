use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Decode(&'static str, io::Error),
    ReadError(&'static str, io::Error),
    WriteError(&'static str, io::Error),
    IndexCorruption(String),
    ChecksumMismatch,
    LockError(io::Error),
    MutexPoisoned,
    Frozen, // Write buffer was sealed
    Closed,
    /// Upsert rejected: a flush is in flight and memory pressure persists.
    Overload,
    /// A flush could not durably write its run.
    Persistence(Box<Error>),
    /// A compaction failed; the run set is left as it was.
    Compaction(Box<Error>),
    /// The run-store generation was retired by an earlier compaction.
    StaleHandle,
    /// A background task failed; kept until `status` or `close` reports it.
    Background { task: &'static str, message: String },
    InvalidState(String),
    InvalidOperation(String),
}

impl Error {
    /// True for failures that originate in the persistence layer, as opposed
    /// to logical errors such as overload or a closed engine.
    pub fn is_io(&self) -> bool {
        match self {
            Error::IoError(_)
            | Error::Decode(..)
            | Error::ReadError(..)
            | Error::WriteError(..)
            | Error::IndexCorruption(_)
            | Error::ChecksumMismatch
            | Error::LockError(_)
            | Error::Persistence(_)
            | Error::Compaction(_)
            | Error::Background { .. } => true,
            Error::MutexPoisoned
            | Error::Frozen
            | Error::Closed
            | Error::Overload
            | Error::StaleHandle
            | Error::InvalidState(_)
            | Error::InvalidOperation(_) => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::ReadError(context, err) => write!(f, "Failed to read {}: {}", context, err),
            Error::WriteError(context, err) => write!(f, "Failed to write {}: {}", context, err),
            Error::IndexCorruption(msg) => write!(f, "Index corruption: {}", msg),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::Frozen => write!(f, "Memtable is frozen"),
            Error::Closed => write!(f, "Store is closed"),
            Error::Overload => write!(f, "Write rejected: flush in progress, memory overloaded"),
            Error::Persistence(err) => write!(f, "Flush failed: {}", err),
            Error::Compaction(err) => write!(f, "Compaction failed: {}", err),
            Error::StaleHandle => write!(f, "Storage generation is no longer live"),
            Error::Background { task, message } => {
                write!(f, "Background task {} failed: {}", task, message)
            }
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err)
            | Error::Decode(_, err)
            | Error::ReadError(_, err)
            | Error::WriteError(_, err)
            | Error::LockError(err) => Some(err),
            Error::Persistence(err) | Error::Compaction(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
