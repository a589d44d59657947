//! Journaled-write context for filesystem mutations.
//!
//! Tracks every block handle a mutation touches, collects blocks to be
//! freed, and on completion pushes freed indices onto the free-block
//! chain before handing the dirty set to the store.

use alloc::vec::Vec;

use crate::block::BlockRef;
use crate::error::Result;
use crate::fs::layout::{FreeListView, MasterView, NO_BLOCK, block_kind};
use crate::traits::storage::AfsStorage;

pub(crate) struct JournaledWrite {
    master: BlockRef,
    touched: Vec<BlockRef>,
    to_free: Vec<BlockRef>,
    /// Cached free-list tail handle, shared between reclaim and free.
    free_tail: Option<BlockRef>,
}

impl JournaledWrite {
    /// Begin a journaled write and obtain the master block. The master is
    /// part of nearly every transaction because the unique-id counter
    /// moves forward.
    pub fn begin<S: AfsStorage>(storage: &mut S) -> Result<JournaledWrite> {
        storage.begin_journaled_write()?;
        let master = match storage.obtain_block(0) {
            Ok(b) => b,
            Err(e) => {
                storage.abort_journaled_write();
                return Err(e);
            }
        };
        let mut jw = JournaledWrite {
            master: master.clone(),
            touched: Vec::new(),
            to_free: Vec::new(),
            free_tail: None,
        };
        jw.track(master);
        Ok(jw)
    }

    pub fn master(&self) -> MasterView {
        MasterView::new(self.master.clone())
    }

    /// Register a handle whose changes, if any, belong to this write.
    pub fn track(&mut self, block: BlockRef) {
        self.touched.push(block);
    }

    /// Schedule a block for release to the free-block chain on
    /// completion.
    pub fn free_block(&mut self, block: BlockRef) {
        debug_assert!(
            !self
                .to_free
                .iter()
                .any(|b| b.block_index() == block.block_index())
        );
        self.track(block.clone());
        self.to_free.push(block);
    }

    /// Produce a usable block: pop an index off the free-list tail when
    /// one exists (preferring the tail preserves locality), otherwise
    /// extend the store. `kind` stamps byte 0 for metadata blocks; data
    /// blocks pass `None` and stay raw.
    pub fn reclaim_or_add_new<S: AfsStorage>(
        &mut self,
        storage: &mut S,
        kind: Option<u8>,
    ) -> Result<BlockRef> {
        let block = match self.try_reclaim(storage)? {
            Some(b) => b,
            None => {
                let b = storage.add_new_block()?;
                self.track(b.clone());
                b
            }
        };
        block.touch();
        if let Some(k) = kind {
            block.put_u8(0, k);
        }
        Ok(block)
    }

    fn try_reclaim<S: AfsStorage>(&mut self, storage: &mut S) -> Result<Option<BlockRef>> {
        let master = self.master();
        let tail_index = master.free_list_tail();
        if tail_index == NO_BLOCK {
            return Ok(None);
        }

        let tail = match &self.free_tail {
            Some(t) => t.clone(),
            None => {
                let t = storage.obtain_block(tail_index)?;
                self.track(t.clone());
                self.free_tail = Some(t.clone());
                t
            }
        };

        let view = FreeListView::new(tail.clone())?;
        let nr = view.nr_indices();
        if nr == 0 {
            // The chain node itself is the last reusable block at this
            // link; consume it and pop the chain.
            let prev = view.prev_free_list_block_index();
            master.set_free_list_tail(prev);
            if prev != NO_BLOCK {
                master.set_nr_full_free_list_nodes(master.nr_full_free_list_nodes() - 1);
            }
            self.free_tail = None;
            tail.zero();
            return Ok(Some(tail));
        }

        let index = view.free_block_index(nr - 1);
        view.set_nr_indices(nr - 1);
        let block = storage.obtain_block_for_overwrite(index)?;
        self.track(block.clone());
        block.zero();
        Ok(Some(block))
    }

    /// Append one freed block to the chain. A full (or absent) tail is
    /// extended by turning the freed block itself into the new tail.
    fn append_free<S: AfsStorage>(&mut self, storage: &mut S, block: BlockRef) -> Result<()> {
        let master = self.master();
        let block_size = storage.block_size();
        let tail_index = master.free_list_tail();

        let tail = if tail_index == NO_BLOCK {
            None
        } else {
            match &self.free_tail {
                Some(t) => Some(t.clone()),
                None => {
                    let t = storage.obtain_block(tail_index)?;
                    self.track(t.clone());
                    self.free_tail = Some(t.clone());
                    Some(t)
                }
            }
        };

        let tail_full = match &tail {
            Some(t) => {
                FreeListView::new(t.clone())?.nr_indices()
                    >= FreeListView::max_nr_indices(block_size)
            }
            None => true,
        };

        if tail_full {
            FreeListView::format(&block, tail_index);
            if tail.is_some() {
                master.set_nr_full_free_list_nodes(master.nr_full_free_list_nodes() + 1);
            }
            master.set_free_list_tail(block.block_index());
            self.free_tail = Some(block);
        } else {
            let view = FreeListView::new(tail.unwrap())?;
            let nr = view.nr_indices();
            view.set_free_block_index(nr, block.block_index());
            view.set_nr_indices(nr + 1);
            block.zero();
            block.put_u8(0, block_kind::FREE_BLOCK);
        }
        Ok(())
    }

    /// Push freed blocks onto the chain, then hand every dirty handle to
    /// the store as one atomic journaled write.
    pub fn complete<S: AfsStorage>(mut self, storage: &mut S) -> Result<()> {
        let to_free = core::mem::take(&mut self.to_free);
        for block in to_free {
            self.append_free(storage, block)?;
        }

        let mut dirty: Vec<BlockRef> = self
            .touched
            .iter()
            .filter(|b| b.change_pending())
            .cloned()
            .collect();
        dirty.sort_by_key(|b| b.block_index());
        dirty.dedup_by_key(|b| b.block_index());
        storage.complete_journaled_write(&dirty)
    }

    /// Allocate the next object unique id from the master block.
    pub fn take_unique_id(&self) -> u64 {
        let master = self.master();
        let id = master.next_unique_id();
        master.set_next_unique_id(id + 1);
        id
    }
}
