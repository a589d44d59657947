use crate::block::BlockRef;
use crate::error::Result;

/// Journaled block storage abstraction — the foundation the filesystem
/// is built on.
///
/// Implementations may back onto an OS file, a memory image, or any other
/// random-access block medium, as long as they provide the journaled
/// write discipline: every mutation happens between
/// `begin_journaled_write` and `complete_journaled_write`, and a
/// completed write is all-or-nothing across process death.
///
/// One journaled write may be in flight at a time. The block size must
/// never change after the filesystem has first been initialized against
/// a particular store.
pub trait AfsStorage {
    /// Block size in bytes. At least `Afs::MIN_BLOCK_SIZE`.
    fn block_size(&self) -> u32;

    /// Upper bound on the number of blocks, `u64::MAX` when unlimited.
    /// May change at any time, including below `nr_blocks()`.
    fn max_nr_blocks(&self) -> u64;

    /// Number of blocks available, including blocks created during the
    /// current journaled write that are not yet committed. Zero when the
    /// filesystem has never been initialized.
    fn nr_blocks(&self) -> u64;

    /// Create a new zero-filled block just past the current last block,
    /// extending `nr_blocks()` by one. Must be called within a journaled
    /// write; the block must be included in `complete_journaled_write`.
    /// Returns `OutOfSpace` when `max_nr_blocks()` would be exceeded.
    fn add_new_block(&mut self) -> Result<BlockRef>;

    /// Obtain an existing, committed block. Outside a journaled write the
    /// handle is read-only by convention. Within a journaled write,
    /// obtaining the same index again returns the handle already given
    /// out, so staged bytes stay consistent. `BlockIndexInvalid` when the
    /// index is past the committed end of the store.
    fn obtain_block(&mut self, block_index: u64) -> Result<BlockRef>;

    /// Obtain an existing block without reading it; the contents are
    /// garbage until the caller overwrites them. Only valid within a
    /// journaled write.
    fn obtain_block_for_overwrite(&mut self, block_index: u64) -> Result<BlockRef>;

    /// Begin a journaled write. May first attempt recovery from an
    /// earlier storage failure; a failed recovery attempt surfaces as
    /// `StorageInErrorState`.
    fn begin_journaled_write(&mut self) -> Result<()>;

    /// Abort the journaled write, discarding in-flight buffers and any
    /// logical block-count extension. Infallible.
    fn abort_journaled_write(&mut self);

    /// Persist all dirty blocks of the journaled write atomically.
    /// Every handle passed must have a change pending, and every block
    /// created with `add_new_block` during this write must be included.
    fn complete_journaled_write(&mut self, blocks: &[BlockRef]) -> Result<()>;
}
