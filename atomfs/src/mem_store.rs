//! In-memory storage backing, mainly for embedders that want a volatile
//! filesystem and for exercising the tree machinery at small block
//! sizes. Journaled-write semantics are kept (all-or-nothing apply,
//! logical block-count extension, one write in flight) without a
//! journal: a memory image cannot be torn by process death.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;

use crate::block::{AfsBlock, BlockRef};
use crate::error::{AfsError, Result};
use crate::traits::storage::AfsStorage;

pub struct MemStore {
    block_size: u32,
    max_nr_blocks: u64,
    blocks: Vec<Rc<Vec<u8>>>,
    in_write: bool,
    /// Handles given out during the current journaled write, so a block
    /// obtained twice resolves to the same staged buffer.
    jw_handles: BTreeMap<u64, BlockRef>,
    nr_blocks_to_add: u64,
}

impl MemStore {
    pub fn new(block_size: u32, max_nr_blocks: u64) -> MemStore {
        assert!(block_size >= 8);
        MemStore {
            block_size,
            max_nr_blocks,
            blocks: Vec::new(),
            in_write: false,
            jw_handles: BTreeMap::new(),
            nr_blocks_to_add: 0,
        }
    }

    /// Committed contents of one block, for inspection in tests.
    pub fn committed_block(&self, index: u64) -> &[u8] {
        &self.blocks[index as usize]
    }
}

impl AfsStorage for MemStore {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn max_nr_blocks(&self) -> u64 {
        self.max_nr_blocks
    }

    fn nr_blocks(&self) -> u64 {
        self.blocks.len() as u64 + self.nr_blocks_to_add
    }

    fn add_new_block(&mut self) -> Result<BlockRef> {
        assert!(self.in_write, "add_new_block outside journaled write");
        let index = self.nr_blocks();
        if index >= self.max_nr_blocks {
            return Err(AfsError::OutOfSpace);
        }
        let handle = AfsBlock::new(index, Rc::new(vec![0u8; self.block_size as usize]));
        self.jw_handles.insert(index, handle.clone());
        self.nr_blocks_to_add += 1;
        Ok(handle)
    }

    fn obtain_block(&mut self, block_index: u64) -> Result<BlockRef> {
        if self.in_write {
            if let Some(handle) = self.jw_handles.get(&block_index) {
                return Ok(handle.clone());
            }
        }
        if block_index >= self.blocks.len() as u64 {
            return Err(AfsError::BlockIndexInvalid);
        }
        let handle = AfsBlock::new(block_index, self.blocks[block_index as usize].clone());
        if self.in_write {
            self.jw_handles.insert(block_index, handle.clone());
        }
        Ok(handle)
    }

    fn obtain_block_for_overwrite(&mut self, block_index: u64) -> Result<BlockRef> {
        assert!(self.in_write, "obtain_block_for_overwrite outside journaled write");
        if let Some(handle) = self.jw_handles.get(&block_index) {
            return Ok(handle.clone());
        }
        if block_index >= self.blocks.len() as u64 {
            return Err(AfsError::BlockIndexInvalid);
        }
        let handle = AfsBlock::new(block_index, Rc::new(vec![0u8; self.block_size as usize]));
        self.jw_handles.insert(block_index, handle.clone());
        Ok(handle)
    }

    fn begin_journaled_write(&mut self) -> Result<()> {
        assert!(!self.in_write, "journaled write already active");
        self.in_write = true;
        Ok(())
    }

    fn abort_journaled_write(&mut self) {
        if !self.in_write {
            return;
        }
        self.jw_handles.clear();
        self.nr_blocks_to_add = 0;
        self.in_write = false;
    }

    fn complete_journaled_write(&mut self, blocks: &[BlockRef]) -> Result<()> {
        assert!(self.in_write, "complete without begin");
        let committed_len = self.blocks.len() as u64;
        let expect_len = committed_len + self.nr_blocks_to_add;
        let mut nr_new_written = 0u64;
        for block in blocks {
            assert!(block.change_pending(), "clean block in journaled write");
            let index = block.block_index();
            if index >= committed_len {
                assert!(index < expect_len, "write past created blocks");
                nr_new_written += 1;
            }
        }
        assert_eq!(
            nr_new_written, self.nr_blocks_to_add,
            "created blocks missing from journaled write"
        );

        // Apply in index order; new blocks are dense at the end.
        let mut ordered: Vec<&BlockRef> = blocks.iter().collect();
        ordered.sort_by_key(|b| b.block_index());
        for block in ordered {
            let index = block.block_index() as usize;
            let data = block.snapshot();
            if index == self.blocks.len() {
                self.blocks.push(data);
            } else {
                self.blocks[index] = data;
            }
            block.clear_change_pending();
        }

        self.jw_handles.clear();
        self.nr_blocks_to_add = 0;
        self.in_write = false;
        Ok(())
    }
}
