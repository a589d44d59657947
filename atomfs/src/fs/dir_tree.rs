//! Directory trees.
//!
//! A directory is a shallow B⁺-tree whose root is the object's top node.
//! Leaf nodes hold `(id, type, name)` entries ordered by the injected
//! name comparator; branch nodes hold `(child_block_index, first_name)`
//! entries. Nodes are decoded into vectors, mutated there, and encoded
//! back when the context is finalized, so a failed operation leaves the
//! on-disk tree untouched.

use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::block::BlockRef;
use crate::error::{AfsError, Result};
use crate::fs::Afs;
use crate::fs::jw::JournaledWrite;
use crate::fs::layout::{
    DIR_BRANCH_ENTRY_OVERHEAD, DIR_LEAF_ENTRY_OVERHEAD, NAV_PATH_MAX_ENTRIES,
    NODE_REBALANCE_THRESHOLD_FRACTION, NON_TOP_VIEW_OFF, ObjType, TopView,
    block_kind, dir_entries_off, dir_nr_entries_off, node_cat,
};
use crate::obj_id::ObjId;
use crate::traits::storage::AfsStorage;

#[derive(Debug, Clone)]
pub struct DirLeafEntry {
    pub id: ObjId,
    pub obj_type: ObjType,
    pub name: Vec<u8>,
}

impl DirLeafEntry {
    fn encoded_size(&self) -> usize {
        DIR_LEAF_ENTRY_OVERHEAD + self.name.len()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DirBranchEntry {
    pub block_index: u64,
    pub name: Vec<u8>,
}

impl DirBranchEntry {
    fn encoded_size(&self) -> usize {
        DIR_BRANCH_ENTRY_OVERHEAD + self.name.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FindResult {
    NoEntries,
    FirstIsGreater,
    FoundEqual,
    FoundLessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Initial,
    Changed,
    Free,
}

/// Navigation path from the top node to a leaf: (arena index, entry
/// position) per level.
pub(crate) type NavPath = Vec<(usize, usize)>;

struct DirNode {
    block: BlockRef,
    is_top: bool,
    level: u8,
    state: NodeState,
    view_off: usize,
    leaf: Vec<DirLeafEntry>,
    branch: Vec<DirBranchEntry>,
    children: Vec<Option<usize>>,
}

impl DirNode {
    fn decode(block: &BlockRef, is_top: bool) -> Result<DirNode> {
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
        if view_off + 2 > block_size {
            return Err(AfsError::UnexpectedBlockKind);
        }
        let level = data[view_off];
        let nr_off = dir_nr_entries_off(view_off);
        if nr_off + 4 > block_size {
            return Err(AfsError::UnexpectedBlockKind);
        }
        let nr = u32::from_le_bytes(data[nr_off..nr_off + 4].try_into().unwrap()) as usize;
        let mut cursor = dir_entries_off(view_off);

        let mut leaf = Vec::new();
        let mut branch = Vec::new();
        if level == 0 {
            leaf.reserve(nr);
            for _ in 0..nr {
                if cursor + DIR_LEAF_ENTRY_OVERHEAD > block_size {
                    return Err(AfsError::UnexpectedBlockKind);
                }
                let id = ObjId::decode(&data[cursor..]).ok_or(AfsError::UnexpectedBlockKind)?;
                let obj_type = ObjType::from_u8(data[cursor + 16])?;
                let name_len =
                    u16::from_le_bytes(data[cursor + 17..cursor + 19].try_into().unwrap())
                        as usize;
                cursor += DIR_LEAF_ENTRY_OVERHEAD;
                if cursor + name_len > block_size {
                    return Err(AfsError::UnexpectedBlockKind);
                }
                leaf.push(DirLeafEntry {
                    id,
                    obj_type,
                    name: data[cursor..cursor + name_len].to_vec(),
                });
                cursor += name_len;
            }
        } else {
            branch.reserve(nr);
            for _ in 0..nr {
                if cursor + DIR_BRANCH_ENTRY_OVERHEAD > block_size {
                    return Err(AfsError::UnexpectedBlockKind);
                }
                let block_index =
                    u64::from_le_bytes(data[cursor..cursor + 8].try_into().unwrap());
                let name_len =
                    u16::from_le_bytes(data[cursor + 8..cursor + 10].try_into().unwrap())
                        as usize;
                cursor += DIR_BRANCH_ENTRY_OVERHEAD;
                if cursor + name_len > block_size {
                    return Err(AfsError::UnexpectedBlockKind);
                }
                branch.push(DirBranchEntry {
                    block_index,
                    name: data[cursor..cursor + name_len].to_vec(),
                });
                cursor += name_len;
            }
        }
        drop(data);

        let children = vec![None; branch.len()];
        Ok(DirNode {
            block: block.clone(),
            is_top,
            level,
            state: NodeState::Initial,
            view_off,
            leaf,
            branch,
            children,
        })
    }

    fn encode(&self) {
        let mut buf = self.block.write();
        if !self.is_top {
            buf[0] = block_kind::NODE;
            buf[1] = node_cat::NON_TOP;
            buf[2] = ObjType::Dir as u8;
        }
        buf[self.view_off] = self.level;
        buf[self.view_off + 1] = 0;
        let nr_off = dir_nr_entries_off(self.view_off);
        let mut cursor = dir_entries_off(self.view_off);
        if self.level == 0 {
            buf[nr_off..nr_off + 4].copy_from_slice(&(self.leaf.len() as u32).to_le_bytes());
            for e in &self.leaf {
                e.id.encode(&mut buf[cursor..cursor + 16]);
                buf[cursor + 16] = e.obj_type as u8;
                buf[cursor + 17..cursor + 19]
                    .copy_from_slice(&(e.name.len() as u16).to_le_bytes());
                cursor += DIR_LEAF_ENTRY_OVERHEAD;
                buf[cursor..cursor + e.name.len()].copy_from_slice(&e.name);
                cursor += e.name.len();
            }
        } else {
            buf[nr_off..nr_off + 4].copy_from_slice(&(self.branch.len() as u32).to_le_bytes());
            for e in &self.branch {
                buf[cursor..cursor + 8].copy_from_slice(&e.block_index.to_le_bytes());
                buf[cursor + 8..cursor + 10]
                    .copy_from_slice(&(e.name.len() as u16).to_le_bytes());
                cursor += DIR_BRANCH_ENTRY_OVERHEAD;
                buf[cursor..cursor + e.name.len()].copy_from_slice(&e.name);
                cursor += e.name.len();
            }
        }
    }

    fn nr_vec_entries(&self) -> usize {
        if self.level == 0 {
            self.leaf.len()
        } else {
            self.branch.len()
        }
    }

    fn encoded_entry_bytes(&self) -> usize {
        if self.level == 0 {
            self.leaf.iter().map(|e| e.encoded_size()).sum()
        } else {
            self.branch.iter().map(|e| e.encoded_size()).sum()
        }
    }

    fn first_name(&self) -> &[u8] {
        if self.level == 0 {
            &self.leaf[0].name
        } else {
            &self.branch[0].name
        }
    }
}

fn find_in_leaf(
    cmp: fn(&[u8], &[u8]) -> Ordering,
    entries: &[DirLeafEntry],
    name: &[u8],
) -> (FindResult, usize) {
    if entries.is_empty() {
        return (FindResult::NoEntries, 0);
    }
    let mut found = None;
    for (i, e) in entries.iter().enumerate() {
        match cmp(&e.name, name) {
            Ordering::Less => found = Some(i),
            Ordering::Equal => return (FindResult::FoundEqual, i),
            Ordering::Greater => break,
        }
    }
    match found {
        Some(i) => (FindResult::FoundLessThan, i),
        None => (FindResult::FirstIsGreater, 0),
    }
}

fn find_in_branch(
    cmp: fn(&[u8], &[u8]) -> Ordering,
    entries: &[DirBranchEntry],
    name: &[u8],
) -> (FindResult, usize) {
    if entries.is_empty() {
        return (FindResult::NoEntries, 0);
    }
    let mut found = None;
    for (i, e) in entries.iter().enumerate() {
        match cmp(&e.name, name) {
            Ordering::Less => found = Some(i),
            Ordering::Equal => return (FindResult::FoundEqual, i),
            Ordering::Greater => break,
        }
    }
    match found {
        Some(i) => (FindResult::FoundLessThan, i),
        None => (FindResult::FirstIsGreater, 0),
    }
}

/// Context for operations on one directory. Read-only callers never pass
/// a journaled write; mutating callers thread one through and call
/// `finalize` before completing it.
pub(crate) struct DirCx {
    nodes: Vec<DirNode>,
    top: usize,
    pub nr_entries_delta: i64,
}

impl DirCx {
    /// Load the directory's top node. `expect` errors follow the lookup
    /// contract: `DirNotFound` when gone, `ObjNotDir` when it is a file.
    pub fn load_top<S: AfsStorage>(fs: &mut Afs<S>, id: ObjId) -> Result<DirCx> {
        let block = fs.get_top_block(id, ObjType::Dir)?;
        let node = DirNode::decode(&block, true)?;
        Ok(DirCx {
            nodes: vec![node],
            top: 0,
            nr_entries_delta: 0,
        })
    }

    pub fn top_view(&self) -> TopView {
        TopView::new(self.nodes[self.top].block.clone()).expect("top checked at load")
    }

    fn mark_changed(&mut self, i: usize) {
        if self.nodes[i].state == NodeState::Initial {
            self.nodes[i].state = NodeState::Changed;
        }
        debug_assert!(self.nodes[i].state != NodeState::Free);
    }

    fn capacity_fits<S: AfsStorage>(&self, fs: &Afs<S>, i: usize) -> bool {
        let n = &self.nodes[i];
        dir_entries_off(n.view_off) + n.encoded_entry_bytes() <= fs.block_size() as usize
    }

    fn underfull<S: AfsStorage>(&self, fs: &Afs<S>, i: usize) -> bool {
        let n = &self.nodes[i];
        !n.is_top
            && ((n.encoded_entry_bytes() as u64)
                * (NODE_REBALANCE_THRESHOLD_FRACTION as u64)
                < fs.block_size() as u64)
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
        let node = DirNode::decode(&block, false)?;
        if node.level + 1 != self.nodes[parent].level {
            return Err(AfsError::UnexpectedBlockKind);
        }
        self.nodes.push(node);
        let ci = self.nodes.len() - 1;
        self.nodes[parent].children[pos] = Some(ci);
        Ok(ci)
    }

    /// Descend to the leaf that would contain `name`.
    pub fn nav_to_leaf<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        name: &[u8],
    ) -> Result<(FindResult, NavPath)> {
        let cmp = fs.cmp;
        let mut path: NavPath = Vec::new();
        let mut cur = self.top;
        loop {
            assert!(path.len() < NAV_PATH_MAX_ENTRIES, "directory tree too deep");
            if self.nodes[cur].level == 0 {
                let (r, pos) = find_in_leaf(cmp, &self.nodes[cur].leaf, name);
                path.push((cur, pos));
                return Ok((r, path));
            }
            let (r, pos) = find_in_branch(cmp, &self.nodes[cur].branch, name);
            if r == FindResult::NoEntries {
                return Err(AfsError::UnexpectedBlockKind);
            }
            path.push((cur, pos));
            cur = self.load_child(fs, cur, pos)?;
        }
    }

    /// Descend along the given edge (0 = leftmost) to a leaf.
    fn nav_to_edge<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        leftmost: bool,
    ) -> Result<NavPath> {
        let mut path: NavPath = Vec::new();
        let mut cur = self.top;
        loop {
            assert!(path.len() < NAV_PATH_MAX_ENTRIES, "directory tree too deep");
            if self.nodes[cur].level == 0 {
                path.push((cur, 0));
                return Ok(path);
            }
            let pos = if leftmost {
                0
            } else {
                self.nodes[cur].branch.len() - 1
            };
            path.push((cur, pos));
            cur = self.load_child(fs, cur, pos)?;
        }
    }

    /// Look a name up without modifying anything.
    pub fn find_entry<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        name: &[u8],
    ) -> Result<Option<DirLeafEntry>> {
        let (r, path) = self.nav_to_leaf(fs, name)?;
        if r != FindResult::FoundEqual {
            return Ok(None);
        }
        let (leaf, pos) = *path.last().unwrap();
        Ok(Some(self.nodes[leaf].leaf[pos].clone()))
    }

    /// Insert an entry; `NameExists` when the name is already present.
    pub fn add_leaf_entry<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        entry: DirLeafEntry,
    ) -> Result<()> {
        let (r, mut path) = self.nav_to_leaf(fs, &entry.name)?;
        let (leaf, pos) = *path.last().unwrap();
        let ins = match r {
            FindResult::FoundEqual => return Err(AfsError::NameExists),
            FindResult::FoundLessThan => pos + 1,
            FindResult::FirstIsGreater | FindResult::NoEntries => 0,
        };
        self.nodes[leaf].leaf.insert(ins, entry);
        self.mark_changed(leaf);
        path.last_mut().unwrap().1 = ins;
        if ins == 0 {
            let last = path.len() - 1;
            self.update_ancestor_names(fs, jw, &path, last)?;
        }
        let last = path.len() - 1;
        self.fit(fs, jw, &path, last)?;
        self.nr_entries_delta += 1;
        Ok(())
    }

    /// Remove an entry by name; `NameNotInDir` when absent.
    pub fn remove_leaf_entry<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        name: &[u8],
    ) -> Result<DirLeafEntry> {
        let (r, mut path) = self.nav_to_leaf(fs, name)?;
        if r != FindResult::FoundEqual {
            return Err(AfsError::NameNotInDir);
        }
        let (leaf, pos) = *path.last().unwrap();
        let removed = self.nodes[leaf].leaf.remove(pos);
        self.mark_changed(leaf);
        self.nr_entries_delta -= 1;
        let last = path.len() - 1;
        self.repair_level(fs, jw, &mut path, last)?;
        Ok(removed)
    }

    /// Update the parent branch entry name for the node at `path[lvl]`,
    /// propagating toward the top while the child sits at position 0.
    /// Longer names may overflow ancestors, which are split as needed.
    fn update_ancestor_names<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        path: &NavPath,
        mut lvl: usize,
    ) -> Result<()> {
        while lvl > 0 {
            let (p, ppos) = path[lvl - 1];
            let child = path[lvl].0;
            debug_assert!(self.nodes[child].nr_vec_entries() > 0);
            let first = self.nodes[child].first_name().to_vec();
            if self.nodes[p].branch[ppos].name == first {
                break;
            }
            self.nodes[p].branch[ppos].name = first;
            self.mark_changed(p);
            self.fit(fs, jw, path, lvl - 1)?;
            if ppos != 0 {
                break;
            }
            lvl -= 1;
        }
        Ok(())
    }

    /// Split the node at `path[lvl]` until it fits its block, promoting
    /// first keys into the parent and growing the tree through the top
    /// when necessary.
    fn fit<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        path: &[(usize, usize)],
        lvl: usize,
    ) -> Result<()> {
        let ni = path[lvl].0;
        if self.capacity_fits(fs, ni) {
            return Ok(());
        }
        if self.nodes[ni].is_top {
            let child = self.split_top(fs, jw)?;
            let sub = [(self.top, 0usize), (child, 0usize)];
            return self.fit(fs, jw, &sub, 1);
        }
        let (p, ppos) = path[lvl - 1];
        self.split_non_top(fs, jw, ni, p, ppos)?;
        self.fit(fs, jw, path, lvl - 1)
    }

    /// Byte-balanced split position, keeping at least one entry per half.
    fn split_index(&self, ni: usize) -> usize {
        let n = &self.nodes[ni];
        let total = n.encoded_entry_bytes();
        let len = n.nr_vec_entries();
        debug_assert!(len >= 2);
        let mut acc = 0usize;
        for i in 0..len {
            let sz = if n.level == 0 {
                n.leaf[i].encoded_size()
            } else {
                n.branch[i].encoded_size()
            };
            acc += sz;
            if acc * 2 >= total {
                return (i + 1).min(len - 1).max(1);
            }
        }
        len - 1
    }

    fn split_non_top<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        ni: usize,
        parent: usize,
        ppos: usize,
    ) -> Result<()> {
        let k = self.split_index(ni);
        let right_block = jw.reclaim_or_add_new(&mut fs.storage, Some(block_kind::NODE))?;
        let level = self.nodes[ni].level;

        let (right_leaf, right_branch, right_children) = {
            let n = &mut self.nodes[ni];
            if level == 0 {
                (n.leaf.split_off(k), Vec::new(), Vec::new())
            } else {
                (Vec::new(), n.branch.split_off(k), n.children.split_off(k))
            }
        };
        let right = DirNode {
            block: right_block.clone(),
            is_top: false,
            level,
            state: NodeState::Changed,
            view_off: NON_TOP_VIEW_OFF,
            leaf: right_leaf,
            branch: right_branch,
            children: right_children,
        };
        let first = right.first_name().to_vec();
        self.nodes.push(right);
        let ri = self.nodes.len() - 1;

        self.nodes[parent].branch.insert(
            ppos + 1,
            DirBranchEntry {
                block_index: right_block.block_index(),
                name: first,
            },
        );
        self.nodes[parent].children.insert(ppos + 1, Some(ri));
        self.mark_changed(ni);
        self.mark_changed(parent);
        debug_assert!(self.capacity_fits(fs, ni));
        debug_assert!(self.capacity_fits(fs, ri));
        Ok(())
    }

    /// Convert the top node into a one-entry branch whose sole child
    /// holds the top's previous contents. Returns the child's arena
    /// index.
    fn split_top<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
    ) -> Result<usize> {
        let child_block = jw.reclaim_or_add_new(&mut fs.storage, Some(block_kind::NODE))?;
        let t = self.top;
        let level = self.nodes[t].level;
        assert!((level as usize) < NAV_PATH_MAX_ENTRIES, "directory tree too deep");

        let leaf = core::mem::take(&mut self.nodes[t].leaf);
        let branch = core::mem::take(&mut self.nodes[t].branch);
        let children = core::mem::take(&mut self.nodes[t].children);
        let child = DirNode {
            block: child_block.clone(),
            is_top: false,
            level,
            state: NodeState::Changed,
            view_off: NON_TOP_VIEW_OFF,
            leaf,
            branch,
            children,
        };
        let first = child.first_name().to_vec();
        self.nodes.push(child);
        let ci = self.nodes.len() - 1;

        let tn = &mut self.nodes[t];
        tn.level = level + 1;
        tn.branch = vec![DirBranchEntry {
            block_index: child_block.block_index(),
            name: first,
        }];
        tn.children = vec![Some(ci)];
        self.mark_changed(t);
        Ok(ci)
    }

    /// Post-removal maintenance for the node at `path[lvl]`, where the
    /// entry at the recorded position was just removed: drop empty
    /// nodes, propagate first names, rebalance underfull nodes, and
    /// collapse the top when its sole child fits inline.
    fn repair_level<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
        lvl: usize,
    ) -> Result<()> {
        let (ni, pos) = path[lvl];
        let is_top = self.nodes[ni].is_top;

        if !is_top && self.nodes[ni].nr_vec_entries() == 0 {
            self.free_node(jw, ni);
            let (p, ppos) = path[lvl - 1];
            self.nodes[p].branch.remove(ppos);
            self.nodes[p].children.remove(ppos);
            self.mark_changed(p);
            path.truncate(lvl);
            return self.repair_level(fs, jw, path, lvl - 1);
        }

        if !is_top && pos == 0 && self.nodes[ni].nr_vec_entries() > 0 {
            self.update_ancestor_names(fs, jw, path, lvl)?;
        }

        if self.underfull(fs, ni) {
            self.rebalance_underfull(fs, jw, path, lvl)?;
        }

        self.try_hoist(fs, jw)
    }

    fn free_node(&mut self, jw: &mut JournaledWrite, ni: usize) {
        debug_assert!(self.nodes[ni].state != NodeState::Free);
        self.nodes[ni].state = NodeState::Free;
        jw.free_block(self.nodes[ni].block.clone());
    }

    fn move_entries(&mut self, from: usize, to: usize, to_front: bool) {
        let level = self.nodes[from].level;
        debug_assert_eq!(level, self.nodes[to].level);
        if level == 0 {
            let mut moved = core::mem::take(&mut self.nodes[from].leaf);
            if to_front {
                moved.extend(core::mem::take(&mut self.nodes[to].leaf));
                self.nodes[to].leaf = moved;
            } else {
                self.nodes[to].leaf.append(&mut moved);
            }
        } else {
            let mut moved = core::mem::take(&mut self.nodes[from].branch);
            let mut moved_children = core::mem::take(&mut self.nodes[from].children);
            if to_front {
                moved.extend(core::mem::take(&mut self.nodes[to].branch));
                moved_children.extend(core::mem::take(&mut self.nodes[to].children));
                self.nodes[to].branch = moved;
                self.nodes[to].children = moved_children;
            } else {
                self.nodes[to].branch.append(&mut moved);
                self.nodes[to].children.append(&mut moved_children);
            }
        }
    }

    fn rebalance_underfull<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
        path: &mut NavPath,
        lvl: usize,
    ) -> Result<()> {
        debug_assert!(lvl > 0);
        let ni = path[lvl].0;
        let (p, ppos) = path[lvl - 1];
        let block_size = fs.block_size() as usize;
        let threshold = block_size / NODE_REBALANCE_THRESHOLD_FRACTION as usize;

        // Merge into the left sibling when the union fits.
        if ppos > 0 {
            let li = self.load_child(fs, p, ppos - 1)?;
            let merged = self.nodes[li].encoded_entry_bytes()
                + self.nodes[ni].encoded_entry_bytes();
            if dir_entries_off(self.nodes[li].view_off) + merged <= block_size {
                self.move_entries(ni, li, false);
                self.mark_changed(li);
                self.free_node(jw, ni);
                self.nodes[p].branch.remove(ppos);
                self.nodes[p].children.remove(ppos);
                self.mark_changed(p);
                path.truncate(lvl);
                path[lvl - 1].1 = ppos;
                return self.repair_level(fs, jw, path, lvl - 1);
            }
        }

        let parent_len = self.nodes[p].branch.len();
        if ppos + 1 < parent_len {
            let ri = self.load_child(fs, p, ppos + 1)?;
            let merged = self.nodes[ni].encoded_entry_bytes()
                + self.nodes[ri].encoded_entry_bytes();
            if dir_entries_off(self.nodes[ni].view_off) + merged <= block_size {
                // Merge the right sibling into this node.
                self.move_entries(ri, ni, false);
                self.mark_changed(ni);
                self.free_node(jw, ri);
                self.nodes[p].branch.remove(ppos + 1);
                self.nodes[p].children.remove(ppos + 1);
                self.mark_changed(p);
                path.truncate(lvl);
                path[lvl - 1].1 = ppos + 1;
                return self.repair_level(fs, jw, path, lvl - 1);
            }

            // Borrow from the right sibling.
            let mut moved_any = false;
            while self.nodes[ni].encoded_entry_bytes() < threshold
                && self.nodes[ri].nr_vec_entries() > 1
            {
                let first_size = if self.nodes[ri].level == 0 {
                    self.nodes[ri].leaf[0].encoded_size()
                } else {
                    self.nodes[ri].branch[0].encoded_size()
                };
                if self.nodes[ri].encoded_entry_bytes() - first_size < threshold {
                    break;
                }
                if self.nodes[ri].level == 0 {
                    let e = self.nodes[ri].leaf.remove(0);
                    self.nodes[ni].leaf.push(e);
                } else {
                    let e = self.nodes[ri].branch.remove(0);
                    let c = self.nodes[ri].children.remove(0);
                    self.nodes[ni].branch.push(e);
                    self.nodes[ni].children.push(c);
                }
                moved_any = true;
            }
            if moved_any {
                self.mark_changed(ni);
                self.mark_changed(ri);
                let first = self.nodes[ri].first_name().to_vec();
                self.nodes[p].branch[ppos + 1].name = first;
                self.mark_changed(p);
                self.fit(fs, jw, path, lvl - 1)?;
            }
            return Ok(());
        }

        if ppos > 0 {
            // Borrow from the left sibling.
            let li = self.load_child(fs, p, ppos - 1)?;
            let mut moved_any = false;
            while self.nodes[ni].encoded_entry_bytes() < threshold
                && self.nodes[li].nr_vec_entries() > 1
            {
                let last = self.nodes[li].nr_vec_entries() - 1;
                let last_size = if self.nodes[li].level == 0 {
                    self.nodes[li].leaf[last].encoded_size()
                } else {
                    self.nodes[li].branch[last].encoded_size()
                };
                if self.nodes[li].encoded_entry_bytes() - last_size < threshold {
                    break;
                }
                if self.nodes[li].level == 0 {
                    let e = self.nodes[li].leaf.pop().unwrap();
                    self.nodes[ni].leaf.insert(0, e);
                } else {
                    let e = self.nodes[li].branch.pop().unwrap();
                    let c = self.nodes[li].children.pop().unwrap();
                    self.nodes[ni].branch.insert(0, e);
                    self.nodes[ni].children.insert(0, c);
                }
                moved_any = true;
            }
            if moved_any {
                self.mark_changed(ni);
                self.mark_changed(li);
                let first = self.nodes[ni].first_name().to_vec();
                self.nodes[p].branch[ppos].name = first;
                self.mark_changed(p);
                self.fit(fs, jw, path, lvl - 1)?;
            }
        }
        Ok(())
    }

    /// While the top is a one-entry branch and the sole child's entries
    /// fit inline, copy the child into the top and free it. A top branch
    /// whose last child was unlinked collapses back to an empty leaf.
    fn try_hoist<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        jw: &mut JournaledWrite,
    ) -> Result<()> {
        loop {
            let t = self.top;
            if self.nodes[t].level > 0 && self.nodes[t].branch.is_empty() {
                let tn = &mut self.nodes[t];
                tn.level = 0;
                tn.leaf.clear();
                tn.children.clear();
                self.mark_changed(t);
                return Ok(());
            }
            if self.nodes[t].level == 0 || self.nodes[t].branch.len() != 1 {
                return Ok(());
            }
            let ci = self.load_child(fs, t, 0)?;
            let child_bytes = self.nodes[ci].encoded_entry_bytes();
            if dir_entries_off(self.nodes[t].view_off) + child_bytes
                > fs.block_size() as usize
            {
                return Ok(());
            }
            let level = self.nodes[ci].level;
            let leaf = core::mem::take(&mut self.nodes[ci].leaf);
            let branch = core::mem::take(&mut self.nodes[ci].branch);
            let children = core::mem::take(&mut self.nodes[ci].children);
            let tn = &mut self.nodes[t];
            tn.level = level;
            tn.leaf = leaf;
            tn.branch = branch;
            tn.children = children;
            self.mark_changed(t);
            self.free_node(jw, ci);
        }
    }

    /// One enumeration batch: the remainder of the leaf containing the
    /// successor of `last_name_read` (the first leaf when `None`).
    pub fn read_batch<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        last_name_read: Option<&[u8]>,
    ) -> Result<(Vec<DirLeafEntry>, bool)> {
        let mut path = match last_name_read {
            None => self.nav_to_edge(fs, true)?,
            Some(last) => {
                let (r, path) = self.nav_to_leaf(fs, last)?;
                let mut path = path;
                let start = match r {
                    FindResult::FoundEqual | FindResult::FoundLessThan => {
                        path.last().unwrap().1 + 1
                    }
                    _ => 0,
                };
                path.last_mut().unwrap().1 = start;
                path
            }
        };

        let (leaf, start) = *path.last().unwrap();
        let mut entries: Vec<DirLeafEntry> = Vec::new();
        if start < self.nodes[leaf].leaf.len() {
            entries.extend_from_slice(&self.nodes[leaf].leaf[start..]);
        } else if self.advance_to_next_leaf(fs, &mut path)? {
            let (leaf, _) = *path.last().unwrap();
            entries.extend_from_slice(&self.nodes[leaf].leaf);
        } else {
            return Ok((entries, true));
        }

        let reached_end = !self.has_next_leaf(&path);
        Ok((entries, reached_end))
    }

    fn has_next_leaf(&self, path: &NavPath) -> bool {
        path[..path.len() - 1]
            .iter()
            .any(|&(n, pos)| pos + 1 < self.nodes[n].branch.len())
    }

    fn advance_to_next_leaf<S: AfsStorage>(
        &mut self,
        fs: &mut Afs<S>,
        path: &mut NavPath,
    ) -> Result<bool> {
        // Pop until an ancestor has a right sibling edge, then descend
        // leftmost.
        path.pop();
        while let Some(&(n, pos)) = path.last() {
            if pos + 1 < self.nodes[n].branch.len() {
                path.last_mut().unwrap().1 = pos + 1;
                let mut cur = self.load_child(fs, n, pos + 1)?;
                loop {
                    if self.nodes[cur].level == 0 {
                        path.push((cur, 0));
                        return Ok(true);
                    }
                    path.push((cur, 0));
                    cur = self.load_child(fs, cur, 0)?;
                }
            }
            path.pop();
        }
        Ok(false)
    }

    /// Encode every changed node and register all blocks with the
    /// journaled write.
    pub fn finalize<S: AfsStorage>(&mut self, _fs: &Afs<S>, jw: &mut JournaledWrite) {
        for node in &self.nodes {
            match node.state {
                NodeState::Changed => {
                    node.encode();
                    jw.track(node.block.clone());
                }
                NodeState::Initial => jw.track(node.block.clone()),
                NodeState::Free => {} // queued by free_node
            }
        }
    }
}
