//! File-backed journaled block storage for the abstract filesystem.
//!
//! [`FileStore`] implements [`atomfs::AfsStorage`] over two OS files: a
//! data file holding the block array behind a signature header, and a
//! journal file that makes grouped block writes atomic across process
//! death. See the `file_store` module for the protocol.

pub mod block_alloc;
pub mod cache;
pub mod error;
pub mod file_store;
pub mod storage_file;

// Re-exports
pub use block_alloc::BlockAllocator;
pub use cache::BlockCache;
pub use error::{Result, StoreError};
pub use file_store::{Consistency, FileStore, MIN_BLOCK_SIZE};
pub use storage_file::{
    FileRole, IoOp, MIN_SECTOR_SIZE, SharedSimErrDecider, SimErrDecider, StorageFile,
};
