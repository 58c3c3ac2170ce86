use std::io;

/// Errors surfaced by the store. Never swallowed: every failure below the
/// facade propagates verbatim to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key does not exist")]
    KeyNotFound,

    #[error("require write permission")]
    RequireWrite,

    #[error("access denied: datastore is locked")]
    AccessDenied,

    #[error("corruption detected: datastore files are corrupted")]
    Corruption,

    #[error("invalid segment file name '{name}'")]
    InvalidFileName { name: String },

    #[error("key size must be greater than 0")]
    InvalidEmptyKey,

    #[error("value size must be greater than 0")]
    InvalidEmptyValue,

    #[error("key size {len} exceeds {max} bytes", max = u16::MAX)]
    KeyTooLarge { len: usize },

    #[error("value size {len} exceeds {max} bytes", max = u32::MAX)]
    ValueTooLarge { len: usize },

    #[error("timestamp error: {0}")]
    Timestamp(#[from] std::time::SystemTimeError),

    #[error("timestamp overflow: {0}")]
    TimestampOverflow(#[from] std::num::TryFromIntError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// A poisoned handle lock means a writer panicked mid-operation; surface it
// as an I/O failure instead of propagating the panic to every caller.
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::Io(io::Error::other("store handle lock poisoned"))
    }
}
