//! Abstract filesystem over journaled block storage.
//!
//! A hierarchical directory/file tree (B⁺-tree nodes inside fixed-size
//! blocks, small file contents inline in the file's top node) layered on
//! any [`traits::storage::AfsStorage`] implementation. Every mutation is
//! one journaled write: it either commits completely or leaves no trace.
//!
//! The filesystem expects exclusive access to its storage. Instances can
//! be shared between threads only with external locking.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod error;
pub mod fs;
pub mod mem_store;
pub mod obj_id;
pub mod traits;

// Re-exports
pub use block::{AfsBlock, BlockRef};
pub use error::{AfsError, Result};
pub use fs::layout::ObjType;
pub use fs::{Afs, DirEntry, NameComparer, StatFields, StatInfo, compare_names_binary};
pub use mem_store::MemStore;
pub use obj_id::ObjId;
pub use traits::storage::AfsStorage;
