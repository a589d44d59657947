use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, Ref, RefCell, RefMut};

/// Handle to one storage block.
///
/// A clean handle shares its buffer with the store's block cache. The
/// first write clones the buffer (copy on write), so staged bytes are
/// visible only through this handle until the journaled write completes;
/// the cache keeps serving the committed contents.
pub struct AfsBlock {
    block_index: u64,
    data: RefCell<Rc<Vec<u8>>>,
    change_pending: Cell<bool>,
}

/// Shared handle type used throughout the filesystem.
pub type BlockRef = Rc<AfsBlock>;

impl AfsBlock {
    pub fn new(block_index: u64, data: Rc<Vec<u8>>) -> BlockRef {
        Rc::new(AfsBlock {
            block_index,
            data: RefCell::new(data),
            change_pending: Cell::new(false),
        })
    }

    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    pub fn block_size(&self) -> u32 {
        self.data.borrow().len() as u32
    }

    pub fn change_pending(&self) -> bool {
        self.change_pending.get()
    }

    /// Borrow the current contents read-only.
    pub fn read(&self) -> Ref<'_, [u8]> {
        Ref::map(self.data.borrow(), |rc| rc.as_slice())
    }

    /// Borrow the contents for writing. Marks the handle dirty and clones
    /// the buffer away from the cache on the first write.
    pub fn write(&self) -> RefMut<'_, [u8]> {
        self.change_pending.set(true);
        RefMut::map(self.data.borrow_mut(), |rc| {
            Rc::make_mut(rc).as_mut_slice()
        })
    }

    /// Mark the handle dirty without modifying bytes. Used for fresh
    /// zero-filled blocks that must still be part of the journaled write.
    pub fn touch(&self) {
        let _ = self.write();
    }

    /// Snapshot of the current contents, cheap when unshared.
    pub fn snapshot(&self) -> Rc<Vec<u8>> {
        self.data.borrow().clone()
    }

    /// Called by the store once the contents have been committed.
    pub fn clear_change_pending(&self) {
        self.change_pending.set(false);
    }

    pub fn zero(&self) {
        self.write().fill(0);
    }

    pub fn get_u8(&self, off: usize) -> u8 {
        self.read()[off]
    }

    pub fn put_u8(&self, off: usize, v: u8) {
        self.write()[off] = v;
    }

    pub fn get_u16(&self, off: usize) -> u16 {
        let d = self.read();
        u16::from_le_bytes(d[off..off + 2].try_into().unwrap())
    }

    pub fn put_u16(&self, off: usize, v: u16) {
        self.write()[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn get_u32(&self, off: usize) -> u32 {
        let d = self.read();
        u32::from_le_bytes(d[off..off + 4].try_into().unwrap())
    }

    pub fn put_u32(&self, off: usize, v: u32) {
        self.write()[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn get_u64(&self, off: usize) -> u64 {
        let d = self.read();
        u64::from_le_bytes(d[off..off + 8].try_into().unwrap())
    }

    pub fn put_u64(&self, off: usize, v: u64) {
        self.write()[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn copy_in(&self, off: usize, bytes: &[u8]) {
        self.write()[off..off + bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn copy_on_write_leaves_shared_buffer_alone() {
        let committed = Rc::new(vec![0u8; 64]);
        let block = AfsBlock::new(3, committed.clone());
        assert!(!block.change_pending());

        block.put_u64(8, 0xABCD);
        assert!(block.change_pending());
        assert_eq!(block.get_u64(8), 0xABCD);
        // the shared (cache-side) buffer is untouched
        assert_eq!(committed[8..16], [0u8; 8]);
    }

    #[test]
    fn fresh_buffer_is_not_cloned() {
        let block = AfsBlock::new(0, Rc::new(vec![0u8; 32]));
        let before = Rc::as_ptr(&block.snapshot());
        block.touch();
        let after = Rc::as_ptr(&block.snapshot());
        assert_eq!(before, after);
    }
}
