use std::fmt;
use std::io;

use atomfs::AfsError;

/// Errors of the file-backed store. I/O failures carry their source;
/// everything that crosses the filesystem trait boundary collapses into
/// the closed [`AfsError`] vocabulary.
#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    /// The data file does not start with the store signature
    InvalidSignature,
    /// Block size is zero or not a multiple of the minimum block size
    InvalidBlockSize(u32),
    OutOfSpace,
    BlockIndexInvalid,
    /// The store is in a (possibly recoverable) error state
    InErrorState,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "i/o error: {}", e),
            StoreError::InvalidSignature => write!(f, "invalid storage file signature"),
            StoreError::InvalidBlockSize(n) => write!(f, "invalid block size: {}", n),
            StoreError::OutOfSpace => write!(f, "out of space"),
            StoreError::BlockIndexInvalid => write!(f, "block index invalid"),
            StoreError::InErrorState => write!(f, "storage in error state"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<StoreError> for AfsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::OutOfSpace => AfsError::OutOfSpace,
            StoreError::BlockIndexInvalid => AfsError::BlockIndexInvalid,
            _ => AfsError::StorageInErrorState,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
