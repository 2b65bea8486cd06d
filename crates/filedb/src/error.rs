use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hash::{Digest, HashError};
use crate::record::ObjectId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the storage engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("refusing to store empty content")]
    EmptyContent,

    #[error("no such object: {0}")]
    NotFound(ObjectId),

    #[error("no blob stored for digest {0}")]
    BlobNotFound(Digest),

    #[error("object {id} is corrupted: expected digest {expected}, got {actual}")]
    Corrupted {
        id: ObjectId,
        expected: Digest,
        actual: Digest,
    },

    #[error("object {id} is corrupted: expected {expected} bytes, got {actual}")]
    SizeMismatch { id: ObjectId, expected: u64, actual: u64 },

    #[error("object {id} has no blob (digest {digest})")]
    MissingBlob { id: ObjectId, digest: Digest },

    #[error("permission denied: {}", path.display())]
    Permission {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write blob {digest}")]
    BlobWrite {
        digest: Digest,
        #[source]
        source: Box<Error>,
    },

    #[error("gave up inserting {digest} after {attempts} conflicting attempts")]
    Conflict { digest: Digest, attempts: u32 },

    #[error("store is in read-only mode")]
    ReadOnly,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error(transparent)]
    InvalidDigest(#[from] HashError),
}

impl Error {
    /// Map an I/O error on `path`, keeping permission failures distinct.
    pub(crate) fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => Error::Permission {
                path: path.into(),
                source,
            },
            _ => Error::Io(source),
        }
    }

    /// The stored data disagrees with its record: bits rotted or the blob is gone.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            Error::Corrupted { .. } | Error::SizeMismatch { .. } | Error::MissingBlob { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Failures where retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Permission { .. } | Error::Conflict { .. } => true,
            Error::Index(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
