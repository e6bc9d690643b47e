use std::fmt;

use thiserror::Error;

use crate::types::{Digest, RelPath, RowKey};

pub type StowResult<T> = Result<T, StowError>;

#[derive(Debug, Error)]
pub enum StowError {
    #[error("not found: {0}")]
    NotFound(Missing),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integrity error: {key} expected {expected}, got {actual}")]
    Integrity {
        key: String,
        expected: Digest,
        actual: Digest,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a `NotFound` error refers to.
///
/// `Blob`, `Fileset` and `Row` mean the catalog never had (or no longer has)
/// the record. `Object` and `Member` mean the catalog record is live but the
/// backend object is gone, which is a data-loss condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Blob(Digest),
    Fileset(Digest),
    Row(RowKey),
    Object { key: String },
    Member { path: RelPath, digest: Digest },
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Blob(d) => write!(f, "blob {d} is not in the catalog"),
            Missing::Fileset(d) => write!(f, "fileset {d} is not in the catalog"),
            Missing::Row(r) => write!(f, "row {r} has no fileset"),
            Missing::Object { key } => write!(f, "backend object {key} is missing"),
            Missing::Member { path, digest } => {
                write!(f, "backend object for {path} (blob {digest}) is missing")
            }
        }
    }
}

/// Coarse classification of a [`StowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Io,
    Integrity,
    Config,
    Other,
}

impl StowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StowError::NotFound(_) => ErrorKind::NotFound,
            StowError::Conflict(_) => ErrorKind::Conflict,
            StowError::Integrity { .. } => ErrorKind::Integrity,
            StowError::Storage(_) | StowError::Io(_) => ErrorKind::Io,
            StowError::Config(_) => ErrorKind::Config,
            StowError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True when a live record points at a backend object that is gone.
    pub fn is_data_loss(&self) -> bool {
        matches!(
            self,
            StowError::NotFound(Missing::Object { .. } | Missing::Member { .. })
        )
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        StowError::Conflict(msg.into())
    }
}
