use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// How a failed operation should be treated by the caller.
///
/// `Temporary` failures are worth retrying once the network (or the
/// server) recovers; `Permanent` failures mean the item itself is bad
/// and retrying the same request cannot succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailClass {
    Temporary,
    Permanent,
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no API connection available\nCheck the network connection; the request can be retried.")]
    NoConnection,

    #[error("API call {call} failed with result {code}")]
    Api {
        call: &'static str,
        code: u64,
        class: FailClass,
    },

    #[error("malformed server response: {0}")]
    Protocol(String),

    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    #[error("server reports size {server} for a file expected to be {expected} bytes\nLocal metadata is stale; retry after the next sync cycle.")]
    SizeMismatch { expected: u64, server: u64 },

    #[error("checksum mismatch for {}", path.display())]
    ChecksumMismatch { path: PathBuf },

    #[error("cannot read local file {}", path.display())]
    LocalFile { path: PathBuf },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, NetError>;

impl NetError {
    pub fn class(&self) -> FailClass {
        match self {
            NetError::Api { class, .. } => *class,
            NetError::ChecksumMismatch { .. }
            | NetError::LocalFile { .. }
            | NetError::Config(_) => FailClass::Permanent,
            _ => FailClass::Temporary,
        }
    }

    /// True when the failure is worth retrying later.
    pub fn is_temporary(&self) -> bool {
        self.class() == FailClass::Temporary
    }
}
