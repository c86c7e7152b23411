//! Error taxonomy shared by every document store operation.

use std::fmt;
use std::io;

use crate::access::Action;

/// Coarse classification of a [`StoreError`], for callers that map failures onto
/// their own status codes or messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    NameConflict,
    InvalidName,
    Unauthorized,
    DirectoryNotEmpty,
    InvalidMove,
    IoFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("the name {0} is already taken")]
    NameConflict(String),
    #[error("{0:?} is not a valid name")]
    InvalidName(String),
    #[error("not allowed to {action} {target}")]
    Unauthorized { action: Action, target: String },
    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(String),
    #[error("cannot move {0} into itself")]
    InvalidMove(String),
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::NameConflict(_) => ErrorKind::NameConflict,
            StoreError::InvalidName(_) => ErrorKind::InvalidName,
            StoreError::Unauthorized { .. } => ErrorKind::Unauthorized,
            StoreError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            StoreError::InvalidMove(_) => ErrorKind::InvalidMove,
            StoreError::Io { .. } => ErrorKind::IoFailure,
        }
    }

    pub(crate) fn io(path: impl fmt::Display, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Attach the path an I/O error happened on, so the message names the file.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl fmt::Display) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl fmt::Display) -> Result<T> {
        self.map_err(|e| StoreError::io(path, e))
    }
}
