use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("invalid page structure: page={page}, {details}")]
    CorruptPage { page: u64, details: String },

    #[error("invalid page type {found} for {operation}")]
    InvalidPageType { found: u8, operation: String },

    #[error("invalid page address {page}: {details}")]
    InvalidPageAddress { page: u64, details: String },

    #[error("corrupt journal at address {address}: {details}")]
    CorruptJournal { address: u64, details: String },

    /// Structural failure that is not retryable; the affected subsystem must stop.
    #[error("fatal internal error: {0}")]
    Fatal(String),

    /// No feasible rebalance point exists; the caller must split instead.
    #[error("rebalance not possible")]
    Rebalance,

    #[error("volume handle {handle} is not defined")]
    VolumeNotFound { handle: u32 },

    #[error("missing volume: {name}")]
    MissingVolume { name: String },

    #[error("journal is closed")]
    JournalClosed,

    #[error("journal is in append-only mode, cannot perform operation: {operation}")]
    AppendOnly { operation: String },

    #[error("interrupted while waiting: {operation}")]
    Interrupted { operation: String },

    #[error("timed out after {millis} ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    #[error("lock poisoned: {lock_name} (another thread panicked while holding this lock)")]
    LockPoisoned { lock_name: String },

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for outcomes the caller is expected to handle by taking an
    /// alternate path (split instead of rebalance, retry a wait, skip a
    /// missing volume). Everything else belongs to the fatal channel.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Rebalance
                | Error::Interrupted { .. }
                | Error::Timeout { .. }
                | Error::MissingVolume { .. }
        )
    }

    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::CorruptPage { .. } | Error::CorruptJournal { .. } | Error::Fatal(_)
        )
    }

    pub(crate) fn corrupt_page(page: u64, details: impl Into<String>) -> Self {
        Error::CorruptPage {
            page,
            details: details.into(),
        }
    }

    pub(crate) fn corrupt_journal(address: u64, details: impl Into<String>) -> Self {
        Error::CorruptJournal {
            address,
            details: details.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Other(format!("JSON error: {}", err))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned {
            lock_name: "unknown".to_string(),
        }
    }
}

// Record parsing reads fixed-width fields out of byte slices
impl From<std::array::TryFromSliceError> for Error {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Error::CorruptJournal {
            address: 0,
            details: "failed to parse binary field".to_string(),
        }
    }
}

pub trait PoisonedLockExt<'a, T> {
    fn recover_poison(self) -> T;
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockReadGuard<'a, T>> for std::sync::LockResult<std::sync::RwLockReadGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::RwLockReadGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockWriteGuard<'a, T>> for std::sync::LockResult<std::sync::RwLockWriteGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::RwLockWriteGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::MutexGuard<'a, T>> for std::sync::LockResult<std::sync::MutexGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::MutexGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_split() {
        assert!(Error::Rebalance.is_recoverable());
        assert!(Error::Timeout { operation: "claim".into(), millis: 5 }.is_recoverable());
        assert!(!Error::Fatal("no room".into()).is_recoverable());
        assert!(Error::Fatal("no room".into()).is_corruption());
        assert!(Error::corrupt_page(7, "bad tail").is_corruption());
        assert!(!Error::Io("disk".into()).is_corruption());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(ref s) if s.contains("boom")));
    }
}
