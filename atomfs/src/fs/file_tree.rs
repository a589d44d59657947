//! File extent trees.
//!
//! Small files live inline in the top node (mini view). Larger files
//! index whole data blocks through a B⁺-tree whose leaf entries are data
//! block indices and whose branch entries are `(first_file_offset,
//! child_block_index)` pairs. Files grow by appending blocks at the end
//! and shrink by trimming from the end, so the tree machinery is
//! append/trim shaped rather than general-insert shaped.

use alloc::vec;
use alloc::vec::Vec;

use crate::block::BlockRef;
use crate::error::{AfsError, Result};
use crate::fs::Afs;
use crate::fs::jw::JournaledWrite;
use crate::fs::layout::{
    FILE_BRANCH_ENTRY_SIZE, FILE_LEAF_ENTRY_SIZE, FILE_NODE_LEVEL_MINI,
    NAV_PATH_MAX_ENTRIES, NON_TOP_VIEW_OFF, ObjType, TopView, block_kind,
    file_branch_base_off, file_branch_entries_off, file_leaf_base_off,
    file_leaf_entries_off, file_mini_off, node_cat,
};
use crate::traits::storage::AfsStorage;

#[derive(Debug, Clone, Copy)]
struct FileBranchEntry {
    file_offset: u64,
    block_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Initial,
    Changed,
    Free,
}

struct FileNode {
    block: BlockRef,
    is_top: bool,
    level: u8,
    state: NodeState,
    view_off: usize,
    /// File offset covered by the first leaf entry (leaf nodes only).
    leaf_off: u64,
    leaf: Vec<u64>,
    /// Handles for data blocks touched this transaction, parallel to
    /// `leaf`.
    data: Vec<Option<BlockRef>>,
    branch: Vec<FileBranchEntry>,
    children: Vec<Option<usize>>,
}

impl FileNode {
    fn decode(block: &BlockRef, is_top: bool) -> Result<FileNode> {
        let view_off = if is_top {
            TopView::new(block.clone())?.tree_view_off()
        } else {
            if block.get_u8(0) != block_kind::NODE
                || block.get_u8(1) != node_cat::NON_TOP
            {
                return Err(AfsError::UnexpectedBlockKind);
            }
            ObjType::from_u8(block.get_u8(2))?;
            NON_TOP_VIEW_OFF
        };

        let data = block.read();
        let block_size = data.len();
        if view_off + 1 > block_size {
            return Err(AfsError::UnexpectedBlockKind);
        }
        let level = data[view_off];
        if level == FILE_NODE_LEVEL_MINI {
            if !is_top {
                return Err(AfsError::UnexpectedBlockKind);
            }
            drop(data);
            return Ok(FileNode {
                block: block.clone(),
                is_top,
                level,
                state: NodeState::Initial,
                view_off,
                leaf_off: 0,
                leaf: Vec::new(),
                data: Vec::new(),
                branch: Vec::new(),
                children: Vec::new(),
            });
        }

        let mut leaf_off = 0u64;
        let mut leaf = Vec::new();
        let mut branch = Vec::new();
        if level == 0 {
            let base = file_leaf_base_off(view_off);
            if base + 12 > block_size {
                return Err(AfsError::UnexpectedBlockKind);
            }
            leaf_off = u64::from_le_bytes(data[base..base + 8].try_into().unwrap());
            let nr =
                u32::from_le_bytes(data[base + 8..base + 12].try_into().unwrap()) as usize;
            let mut cursor = file_leaf_entries_off(view_off);
            if cursor + nr * FILE_LEAF_ENTRY_SIZE > block_size {
                return Err(AfsError::UnexpectedBlockKind);
            }
            leaf.reserve(nr);
            for _ in 0..nr {
                leaf.push(u64::from_le_bytes(
                    data[cursor..cursor + 8].try_into().unwrap(),
                ));
                cursor += FILE_LEAF_ENTRY_SIZE;
            }
        } else {
            let base = file_branch_base_off(view_off);
            if base + 4 > block_size {
                return Err(AfsError::UnexpectedBlockKind);
            }
            let nr = u32::from_le_bytes(data[base..base + 4].try_into().unwrap()) as usize;
            let mut cursor = file_branch_entries_off(view_off);
            if cursor + nr * FILE_BRANCH_ENTRY_SIZE > block_size {
                return Err(AfsError::UnexpectedBlockKind);
            }
            branch.reserve(nr);
            for _ in 0..nr {
                let file_offset =
                    u64::from_le_bytes(data[cursor..cursor + 8].try_into().unwrap());
                let block_index =
                    u64::from_le_bytes(data[cursor + 8..cursor + 16].try_into().unwrap());
                branch.push(FileBranchEntry {
                    file_offset,
                    block_index,
                });
                cursor += FILE_BRANCH_ENTRY_SIZE;
            }
        }
        drop(data);

        let data_handles = vec![None; leaf.len()];
        let children = vec![None; branch.len()];
        Ok(FileNode {
            block: block.clone(),
            is_top,
            level,
            state: NodeState::Initial,
            view_off,
            leaf_off,
            leaf,
            data: data_handles,
            branch,
            children,
        })
    }

    fn encode(&self) {
        debug_assert!(self.level != FILE_NODE_LEVEL_MINI);
        let mut buf = self.block.write();
        if !self.is_top {
            buf[0] = block_kind::NODE;
            buf[1] = node_cat::NON_TOP;
            buf[2] = ObjType::File as u8;
        }
        buf[self.view_off] = self.level;
        if self.level == 0 {
            let base = file_leaf_base_off(self.view_off);
            buf[base..base + 8].copy_from_slice(&self.leaf_off.to_le_bytes());
            buf[base + 8..base + 12].copy_from_slice(&(self.leaf.len() as u32).to_le_bytes());
            let mut cursor = file_leaf_entries_off(self.view_off);
            for idx in &self.leaf {
                buf[cursor..cursor + 8].copy_from_slice(&idx.to_le_bytes());
                cursor += FILE_LEAF_ENTRY_SIZE;
            }
        } else {
            let base = file_branch_base_off(self.view_off);
            buf[base..base + 4].copy_from_slice(&(self.branch.len() as u32).to_le_bytes());
            let mut cursor = file_branch_entries_off(self.view_off);
            for e in &self.branch {
                buf[cursor..cursor + 8].copy_from_slice(&e.file_offset.to_le_bytes());
                buf[cursor + 8..cursor + 16].copy_from_slice(&e.block_index.to_le_bytes());
                cursor += FILE_BRANCH_ENTRY_SIZE;
            }
        }
    }

    fn first_file_offset(&self) -> u64 {
        if self.level == 0 {
            self.leaf_off
        } else {
            self.branch[0].file_offset
        }
    }
}

type NavPath = Vec<(usize, usize)>;

/// Context for operations on one file.
pub(crate) struct FileCx {
    nodes: Vec<FileNode>,
    top: usize,
}

impl FileCx {
    pub fn load_top<S: AfsStorage>(fs: &mut Afs<S>, id: crate::obj_id::ObjId) -> Result<FileCx> {
        let block = fs.get_top_block(id, ObjType::File)?;
        let node = FileNode::decode(&block, true)?;
        Ok(FileCx {
            nodes: vec![node],
            top: 0,
        })
    }

    pub fn top_view(&self) -> TopView {
        TopView::new(self.nodes[self.top].block.clone()).expect("top checked at load")
    }

    pub fn is_mini(&self) -> bool {
        self.nodes[self.top].level == FILE_NODE_LEVEL_MINI
    }

    /// Largest content size that fits inline in this file's top node.
    pub fn max_mini_bytes<S: AfsStorage>(&self, fs: &Afs<S>) -> u32 {
        fs.block_size() - file_mini_off(self.nodes[self.top].view_off) as u32
    }

    fn mark_changed(&mut self, i: usize) {
        if self.nodes[i].state == NodeState::Initial {
            self.nodes[i].state = NodeState::Changed;
        }
        debug_assert!(self.nodes[i].state != NodeState::Free);
    }

    fn leaf_capacity<S: AfsStorage>(&self, fs: &Afs<S>, i: usize) -> usize {
        (fs.block_size() as usize - file_leaf_entries_off(self.nodes[i].view_off))
            / FILE_LEAF_ENTRY_SIZE
    }

    fn branch_capacity<S: AfsStorage>(&self, fs: &Afs<S>, i: usize) -> usize {
        (fs.block_size() as usize - file_branch_entries_off(self.nodes[i].view_off))
            / FILE_BRANCH_ENTRY_SIZE
    }

    fn load_child<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        parent: usize,
        pos: usize,
    ) -> Result<usize> {
        if let Some(ci) = self.nodes[parent].children[pos] {
            return Ok(ci);
        }
        let block_index = self.nodes[parent].branch[pos].block_index;
        let block = fs.storage.obtain_block(block_index)?;
        let node = FileNode::decode(&block, false)?;
        if node.level + 1 != self.nodes[parent].level {
            return Err(AfsError::UnexpectedBlockKind);
        }
        self.nodes.push(node);
        let ci = self.nodes.len() - 1;
        self.nodes[parent].children[pos] = Some(ci);
        Ok(ci)
    }

    fn nav_to_offset<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        offset: u64,
    ) -> Result<NavPath> {
        let block_size = fs.block_size() as u64;
        let mut path: NavPath = Vec::new();
        let mut cur = self.top;
        loop {
            assert!(path.len() < NAV_PATH_MAX_ENTRIES, "file tree too deep");
            let node = &self.nodes[cur];
            if node.level == 0 {
                debug_assert!(offset >= node.leaf_off);
                let pos = ((offset - node.leaf_off) / block_size) as usize;
                debug_assert!(pos < node.leaf.len());
                path.push((cur, pos));
                return Ok(path);
            }
            let mut pos = 0;
            for (i, e) in node.branch.iter().enumerate() {
                if e.file_offset <= offset {
                    pos = i;
                } else {
                    break;
                }
            }
            path.push((cur, pos));
            cur = self.load_child(fs, cur, pos)?;
        }
    }

    fn rightmost_node_at_level<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        level: u8,
    ) -> Result<usize> {
        let mut cur = self.top;
        debug_assert!(self.nodes[cur].level >= level);
        while self.nodes[cur].level > level {
            let pos = self.nodes[cur].branch.len() - 1;
            cur = self.load_child(fs, cur, pos)?;
        }
        Ok(cur)
    }

    fn new_non_top_node<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        level: u8,
        first_off: u64,
    ) -> Result<usize> {
        let block = jw.reclaim_or_add_new(&mut fs.storage, Some(block_kind::NODE))?;
        self.nodes.push(FileNode {
            block,
            is_top: false,
            level,
            state: NodeState::Changed,
            view_off: NON_TOP_VIEW_OFF,
            leaf_off: first_off,
            leaf: Vec::new(),
            data: Vec::new(),
            branch: Vec::new(),
            children: Vec::new(),
        });
        Ok(self.nodes.len() - 1)
    }

    fn split_top<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
    ) -> Result<usize> {
        let child_block = jw.reclaim_or_add_new(&mut fs.storage, Some(block_kind::NODE))?;
        let t = self.top;
        let level = self.nodes[t].level;
        assert!((level as usize) < NAV_PATH_MAX_ENTRIES, "file tree too deep");

        let leaf = core::mem::take(&mut self.nodes[t].leaf);
        let data = core::mem::take(&mut self.nodes[t].data);
        let branch = core::mem::take(&mut self.nodes[t].branch);
        let children = core::mem::take(&mut self.nodes[t].children);
        let leaf_off = self.nodes[t].leaf_off;
        let child = FileNode {
            block: child_block.clone(),
            is_top: false,
            level,
            state: NodeState::Changed,
            view_off: NON_TOP_VIEW_OFF,
            leaf_off,
            leaf,
            data,
            branch,
            children,
        };
        let first = child.first_file_offset();
        self.nodes.push(child);
        let ci = self.nodes.len() - 1;

        let tn = &mut self.nodes[t];
        tn.level = level + 1;
        tn.leaf_off = 0;
        tn.branch = vec![FileBranchEntry {
            file_offset: first,
            block_index: child_block.block_index(),
        }];
        tn.children = vec![Some(ci)];
        self.mark_changed(t);
        Ok(ci)
    }

    /// Append a branch entry (with its already-created child node) into
    /// the rightmost node at `level`, growing the tree as needed.
    fn append_branch_entry<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        level: u8,
        entry: FileBranchEntry,
        child: usize,
    ) -> Result<()> {
        assert!((level as usize) < NAV_PATH_MAX_ENTRIES, "file tree too deep");
        while self.nodes[self.top].level < level {
            self.split_top(fs, jw)?;
        }
        let bn = self.rightmost_node_at_level(fs, level)?;
        if self.nodes[bn].branch.len() < self.branch_capacity(fs, bn) {
            self.nodes[bn].branch.push(entry);
            self.nodes[bn].children.push(Some(child));
            self.mark_changed(bn);
            return Ok(());
        }
        if self.nodes[bn].is_top {
            self.split_top(fs, jw)?;
            return self.append_branch_entry(fs, jw, level, entry, child);
        }
        let nb = self.new_non_top_node(fs, jw, level, entry.file_offset)?;
        let nb_index = self.nodes[nb].block.block_index();
        self.append_branch_entry(
            fs,
            jw,
            level + 1,
            FileBranchEntry {
                file_offset: entry.file_offset,
                block_index: nb_index,
            },
            nb,
        )?;
        self.nodes[nb].branch.push(entry);
        self.nodes[nb].children.push(Some(child));
        Ok(())
    }

    /// Attach one data block at the end of the file.
    fn append_data_block<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        file_offset: u64,
        data_block: BlockRef,
    ) -> Result<()> {
        debug_assert!(!self.is_mini());
        let ln = self.rightmost_node_at_level(fs, 0)?;
        if self.nodes[ln].leaf.len() < self.leaf_capacity(fs, ln) {
            self.nodes[ln].leaf.push(data_block.block_index());
            self.nodes[ln].data.push(Some(data_block));
            self.mark_changed(ln);
            return Ok(());
        }
        let nl = self.new_non_top_node(fs, jw, 0, file_offset)?;
        let nl_index = self.nodes[nl].block.block_index();
        self.append_branch_entry(
            fs,
            jw,
            1,
            FileBranchEntry {
                file_offset,
                block_index: nl_index,
            },
            nl,
        )?;
        self.nodes[nl].leaf.push(data_block.block_index());
        self.nodes[nl].data.push(Some(data_block));
        Ok(())
    }

    /// Path along the rightmost edge from the top down to the last leaf.
    fn rightmost_path<S: AfsStorage>(&mut self, fs: &mut Afs<S>) -> Result<NavPath> {
        let mut path: NavPath = Vec::new();
        let mut cur = self.top;
        loop {
            assert!(path.len() < NAV_PATH_MAX_ENTRIES, "file tree too deep");
            if self.nodes[cur].level == 0 {
                let pos = self.nodes[cur].leaf.len().saturating_sub(1);
                path.push((cur, pos));
                return Ok(path);
            }
            let pos = self.nodes[cur].branch.len() - 1;
            path.push((cur, pos));
            cur = self.load_child(fs, cur, pos)?;
        }
    }

    /// Detach, zero, and free the file's last data block, unlinking any
    /// tree nodes emptied along the right edge.
    fn remove_last_data_block<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
    ) -> Result<()> {
        let mut path = self.rightmost_path(fs)?;
        let (ln, _) = *path.last().unwrap();
        let index = self.nodes[ln].leaf.pop().expect("shrink past first block");
        let handle = self.nodes[ln].data.pop().unwrap();
        self.mark_changed(ln);
        let block = match handle {
            Some(h) => h,
            None => {
                let h = fs.storage.obtain_block_for_overwrite(index)?;
                h.touch();
                h
            }
        };
        jw.free_block(block);

        // Unlink emptied non-top nodes bottom-up.
        while let Some(&(cur, _)) = path.last() {
            let n = &self.nodes[cur];
            if n.is_top {
                break;
            }
            let empty = if n.level == 0 {
                n.leaf.is_empty()
            } else {
                n.branch.is_empty()
            };
            if !empty {
                break;
            }
            self.nodes[cur].state = NodeState::Free;
            jw.free_block(self.nodes[cur].block.clone());
            path.pop();
            let (p, ppos) = *path.last().unwrap();
            debug_assert_eq!(self.nodes[p].children[ppos], Some(cur));
            self.nodes[p].branch.pop();
            self.nodes[p].children.pop();
            self.mark_changed(p);
        }
        Ok(())
    }

    /// While the top is a one-entry branch and the sole child fits
    /// inline, copy the child into the top and free it. A top branch
    /// whose last child was unlinked collapses back to an empty leaf.
    fn try_hoist<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
    ) -> Result<()> {
        loop {
            let t = self.top;
            if self.nodes[t].level == 0 || self.nodes[t].level == FILE_NODE_LEVEL_MINI {
                return Ok(());
            }
            if self.nodes[t].branch.is_empty() {
                let tn = &mut self.nodes[t];
                tn.level = 0;
                tn.leaf_off = 0;
                self.mark_changed(t);
                return Ok(());
            }
            if self.nodes[t].branch.len() != 1 {
                return Ok(());
            }
            let ci = self.load_child(fs, t, 0)?;
            let fits = if self.nodes[ci].level == 0 {
                self.nodes[ci].leaf.len() <= self.leaf_capacity(fs, t)
            } else {
                self.nodes[ci].branch.len() <= self.branch_capacity(fs, t)
            };
            if !fits {
                return Ok(());
            }
            let level = self.nodes[ci].level;
            let leaf_off = self.nodes[ci].leaf_off;
            let leaf = core::mem::take(&mut self.nodes[ci].leaf);
            let data = core::mem::take(&mut self.nodes[ci].data);
            let branch = core::mem::take(&mut self.nodes[ci].branch);
            let children = core::mem::take(&mut self.nodes[ci].children);
            let tn = &mut self.nodes[t];
            tn.level = level;
            tn.leaf_off = leaf_off;
            tn.leaf = leaf;
            tn.data = data;
            tn.branch = branch;
            tn.children = children;
            self.mark_changed(t);
            self.nodes[ci].state = NodeState::Free;
            jw.free_block(self.nodes[ci].block.clone());
        }
    }

    /// Switch from the inline mini shape to an (initially one-block)
    /// extent tree, carrying the existing content over.
    fn convert_mini_to_tree<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
    ) -> Result<()> {
        debug_assert!(self.is_mini());
        let tv = self.top_view();
        let size = tv.file_size_bytes() as usize;
        let t = self.top;
        let mini = file_mini_off(self.nodes[t].view_off);
        let content = if size > 0 {
            self.nodes[t].block.read()[mini..mini + size].to_vec()
        } else {
            Vec::new()
        };

        {
            let view_off = self.nodes[t].view_off;
            let mut buf = self.nodes[t].block.write();
            buf[view_off..].fill(0);
        }
        let tn = &mut self.nodes[t];
        tn.level = 0;
        tn.leaf_off = 0;
        tn.leaf = Vec::new();
        tn.data = Vec::new();
        self.mark_changed(t);

        if size > 0 {
            let first = jw.reclaim_or_add_new(&mut fs.storage, None)?;
            first.write()[..size].copy_from_slice(&content);
            self.append_data_block(fs, jw, 0, first)?;
        }
        Ok(())
    }

    /// One bounded round of growth toward `target` size. Returns the
    /// size reached this round; intermediate rounds stop on whole-block
    /// boundaries.
    pub fn enlarge_step<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        target: u64,
        max_blocks: usize,
    ) -> Result<u64> {
        let block_size = fs.block_size() as u64;
        let tv = self.top_view();
        let cur = tv.file_size_bytes();
        debug_assert!(target > cur);

        if self.is_mini() {
            if target <= self.max_mini_bytes(fs) as u64 {
                tv.set_file_size_bytes(target);
                return Ok(target);
            }
            self.convert_mini_to_tree(fs, jw)?;
        }

        let needed = target.div_ceil(block_size);
        let mut have = cur.div_ceil(block_size);
        let mut added = 0usize;
        while have < needed && added < max_blocks {
            let data_block = jw.reclaim_or_add_new(&mut fs.storage, None)?;
            self.append_data_block(fs, jw, have * block_size, data_block)?;
            have += 1;
            added += 1;
        }

        let new_size = if have >= needed { target } else { have * block_size };
        tv.set_file_size_bytes(new_size);
        Ok(new_size)
    }

    /// One bounded round of shrinking toward `target` size. Removed
    /// blocks are zeroed before being freed.
    pub fn shrink_step<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        target: u64,
        max_blocks: usize,
    ) -> Result<u64> {
        let block_size = fs.block_size() as u64;
        let tv = self.top_view();
        let cur = tv.file_size_bytes();
        debug_assert!(target < cur);

        if self.is_mini() {
            let t = self.top;
            let mini = file_mini_off(self.nodes[t].view_off);
            self.nodes[t].block.write()[mini + target as usize..mini + cur as usize].fill(0);
            tv.set_file_size_bytes(target);
            return Ok(target);
        }

        let needed = target.div_ceil(block_size);
        let mut have = cur.div_ceil(block_size);
        let mut removed = 0usize;
        while have > needed && removed < max_blocks {
            self.remove_last_data_block(fs, jw)?;
            have -= 1;
            removed += 1;
        }

        let new_size = if have == needed {
            // Zero the tail of the kept last block past the new size.
            if target % block_size != 0 {
                let path = self.nav_to_offset(fs, target - 1)?;
                let (ln, pos) = *path.last().unwrap();
                let handle = match &self.nodes[ln].data[pos] {
                    Some(h) => h.clone(),
                    None => {
                        let h = fs.storage.obtain_block(self.nodes[ln].leaf[pos])?;
                        self.nodes[ln].data[pos] = Some(h.clone());
                        h
                    }
                };
                handle.write()[(target % block_size) as usize..].fill(0);
            }
            target
        } else {
            have * block_size
        };
        tv.set_file_size_bytes(new_size);
        self.try_hoist(fs, jw)?;
        Ok(new_size)
    }

    /// Write `data` at `offset`. The file size must already cover the
    /// range.
    pub fn write_range<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        _jw: &mut JournaledWrite,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        debug_assert!(offset + data.len() as u64 <= self.top_view().file_size_bytes());

        if self.is_mini() {
            let t = self.top;
            let mini = file_mini_off(self.nodes[t].view_off);
            self.nodes[t].block.write()
                [mini + offset as usize..mini + offset as usize + data.len()]
                .copy_from_slice(data);
            return Ok(());
        }

        let block_size = fs.block_size() as u64;
        let mut path = self.nav_to_offset(fs, offset)?;
        let mut file_pos = offset;
        let mut consumed = 0usize;
        loop {
            let (ln, pos) = *path.last().unwrap();
            let block_off = self.nodes[ln].leaf_off + pos as u64 * block_size;
            let in_off = (file_pos - block_off) as usize;
            let take = core::cmp::min(
                block_size as usize - in_off,
                data.len() - consumed,
            );
            let handle = match &self.nodes[ln].data[pos] {
                Some(h) => h.clone(),
                None => {
                    let index = self.nodes[ln].leaf[pos];
                    let full = in_off == 0 && take == block_size as usize;
                    let h = if full {
                        fs.storage.obtain_block_for_overwrite(index)?
                    } else {
                        fs.storage.obtain_block(index)?
                    };
                    self.nodes[ln].data[pos] = Some(h.clone());
                    h
                }
            };
            handle.write()[in_off..in_off + take]
                .copy_from_slice(&data[consumed..consumed + take]);
            consumed += take;
            file_pos += take as u64;
            if consumed == data.len() {
                return Ok(());
            }
            self.advance(fs, &mut path)?;
        }
    }

    /// Stream `n` bytes starting at `offset` through the callback. The
    /// caller has validated and clamped the range; the final invocation
    /// carries `reached_end = true`.
    pub fn read_range<S: AfsStorage, F: FnMut(&[u8], bool)>(
        &mut self,
        fs: &mut Afs<S>,
        offset: u64,
        n: usize,
        mut on_data: F,
    ) -> Result<()> {
        if n == 0 {
            on_data(&[], true);
            return Ok(());
        }

        if self.is_mini() {
            let t = self.top;
            let mini = file_mini_off(self.nodes[t].view_off);
            let data = self.nodes[t].block.read();
            on_data(&data[mini + offset as usize..mini + offset as usize + n], true);
            return Ok(());
        }

        let block_size = fs.block_size() as u64;
        let mut path = self.nav_to_offset(fs, offset)?;
        let mut file_pos = offset;
        let mut remaining = n;
        loop {
            let (ln, pos) = *path.last().unwrap();
            let block_off = self.nodes[ln].leaf_off + pos as u64 * block_size;
            let in_off = (file_pos - block_off) as usize;
            let take = core::cmp::min(block_size as usize - in_off, remaining);
            let handle = fs.storage.obtain_block(self.nodes[ln].leaf[pos])?;
            remaining -= take;
            {
                let data = handle.read();
                on_data(&data[in_off..in_off + take], remaining == 0);
            }
            if remaining == 0 {
                return Ok(());
            }
            file_pos += take as u64;
            self.advance(fs, &mut path)?;
        }
    }

    fn advance<S: AfsStorage>(&mut self, fs: &mut Afs<S>, path: &mut NavPath) -> Result<()> {
        let (ln, pos) = *path.last().unwrap();
        if pos + 1 < self.nodes[ln].leaf.len() {
            path.last_mut().unwrap().1 = pos + 1;
            return Ok(());
        }
        // Move to the next leaf.
        path.pop();
        while let Some(&(n, p)) = path.last() {
            if p + 1 < self.nodes[n].branch.len() {
                path.last_mut().unwrap().1 = p + 1;
                let mut cur = self.load_child(fs, n, p + 1)?;
                loop {
                    path.push((cur, 0));
                    if self.nodes[cur].level == 0 {
                        return Ok(());
                    }
                    cur = self.load_child(fs, cur, 0)?;
                }
            }
            path.pop();
        }
        Err(AfsError::UnexpectedBlockKind)
    }

    /// Encode every changed node and register all blocks (tree nodes and
    /// touched data blocks) with the journaled write.
    pub fn finalize<S: AfsStorage>(&mut self, _fs: &Afs<S>, jw: &mut JournaledWrite) {
        for node in &self.nodes {
            match node.state {
                NodeState::Changed => {
                    if node.level != FILE_NODE_LEVEL_MINI {
                        node.encode();
                    }
                    jw.track(node.block.clone());
                }
                NodeState::Initial => jw.track(node.block.clone()),
                NodeState::Free => {}
            }
            for handle in node.data.iter().flatten() {
                jw.track(handle.clone());
            }
        }
    }
}
