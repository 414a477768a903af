//! Error taxonomy for the memory engine.
//!
//! Every fallible library operation returns [`Result`]. The variants map onto
//! the four failure classes the engine distinguishes (I/O, store, decode,
//! resource timeout) plus a few boundary errors. None of them is treated as
//! process-fatal: the worst case is a stale index for one file until the
//! next scan.

use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File read/write failure, permission problem, or missing path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Query error, schema mismatch, or any other database failure.
    #[error("store error: {0}")]
    Store(sqlx::Error),

    /// No pooled connection became available within the acquire timeout.
    #[error("timed out waiting for a database connection")]
    ResourceTimeout,

    /// Malformed structured response from the analysis collaborator.
    #[error("malformed collaborator response: {0}")]
    Decode(String),

    /// The collaborator could not be reached or refused the request.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// A memory file name that does not resolve inside the memory root.
    #[error("invalid memory target: {0}")]
    InvalidTarget(String),

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether a caller can reasonably retry the operation later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ResourceTimeout | Self::Collaborator(_) | Self::Io { .. }
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::ResourceTimeout,
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
