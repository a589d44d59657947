//! The filesystem proper: a hierarchical directory/file tree layered
//! over an [`AfsStorage`], with every mutation wrapped in one journaled
//! write.

use alloc::vec::Vec;
use core::cmp::Ordering;

use bitflags::bitflags;

use crate::block::BlockRef;
use crate::error::{AfsError, Result};
use crate::obj_id::ObjId;
use crate::traits::storage::AfsStorage;

pub mod layout;

pub(crate) mod dir_tree;
pub(crate) mod file_tree;
pub(crate) mod jw;
pub(crate) mod path;

use dir_tree::DirCx;
use file_tree::FileCx;
use jw::JournaledWrite;
use layout::{
    FILE_NODE_LEVEL_MINI, FILE_SET_SIZE_MAX_BLOCKS_PER_ROUND, FreeListView,
    MasterView, NO_BLOCK, ObjType, TopView, block_kind, canonical,
};

pub use dir_tree::DirLeafEntry as DirEntry;

/// Name ordering hook; injecting a different comparator makes the
/// filesystem case-insensitive or collation-aware.
pub type NameComparer = fn(&[u8], &[u8]) -> Ordering;

/// Default comparator: byte-wise, case-sensitive.
pub fn compare_names_binary(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

bitflags! {
    /// Field selector for [`Afs::obj_set_stat`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatFields: u32 {
        const CREATE_TIME = 0x01;
        const MODIFY_TIME = 0x02;
        const META_DATA   = 0x04;
    }
}

/// Snapshot of one object's top-node metadata.
#[derive(Debug, Clone)]
pub struct StatInfo {
    pub obj_type: ObjType,
    pub id: ObjId,
    pub parent_id: ObjId,
    /// Entry count when a directory, `u64::MAX` otherwise.
    pub dir_nr_entries: u64,
    /// Size in bytes when a file, `u64::MAX` otherwise.
    pub file_size_bytes: u64,
    pub create_time: u64,
    pub modify_time: u64,
    pub meta_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsState {
    Uninited,
    Inited,
    Error,
}

/// The abstract filesystem over one storage instance.
///
/// Not internally synchronized: callers arrange their own locking when
/// sharing an instance between threads.
pub struct Afs<S: AfsStorage> {
    pub(crate) storage: S,
    pub(crate) cmp: NameComparer,
    state: FsState,
    block_size: u32,
    max_name_bytes: u32,
    max_meta_bytes: u32,
}

impl<S: AfsStorage> Afs<S> {
    /// First block size at which the derived maximum name length is
    /// useful.
    pub const MIN_BLOCK_SIZE: u32 = 144;

    pub fn new(storage: S) -> Afs<S> {
        let block_size = storage.block_size();
        Afs {
            storage,
            cmp: compare_names_binary,
            state: FsState::Uninited,
            block_size,
            max_name_bytes: 0,
            max_meta_bytes: 0,
        }
    }

    /// Must be called before `init`.
    pub fn set_name_comparer(&mut self, cmp: NameComparer) {
        assert!(
            self.state == FsState::Uninited,
            "name comparer must be set before init"
        );
        self.cmp = cmp;
    }

    /// Initialize against the storage: format a fresh store (root
    /// directory with the given metadata), or validate an existing one.
    pub fn init(&mut self, root_dir_meta: &[u8], now: u64) -> Result<()> {
        assert!(self.state == FsState::Uninited, "already initialized");
        let block_size = self.storage.block_size();
        if block_size < Self::MIN_BLOCK_SIZE {
            return Err(AfsError::UnsupportedFsVersion);
        }
        let (max_name, max_meta) = layout::derive_limits(block_size);
        if max_name == 0 {
            return Err(AfsError::UnsupportedFsVersion);
        }
        self.block_size = block_size;
        self.max_name_bytes = max_name;
        self.max_meta_bytes = max_meta;

        if self.storage.nr_blocks() == 0 {
            if root_dir_meta.len() > max_meta as usize {
                return Err(AfsError::MetaDataTooLong);
            }
            self.storage.begin_journaled_write()?;
            let result = (|| -> Result<()> {
                let master = self.storage.add_new_block()?;
                let root = self.storage.add_new_block()?;
                MasterView::format(&master, root.block_index(), 2);
                TopView::format(
                    &root,
                    ObjType::Dir,
                    ObjId::ROOT.unique_id,
                    ObjId::NONE,
                    now,
                    root_dir_meta,
                );
                self.storage
                    .complete_journaled_write(&[master, root])
            })();
            if let Err(e) = result {
                self.storage.abort_journaled_write();
                return Err(e);
            }
            log::debug!("initialized fresh filesystem, block size {}", block_size);
        } else {
            let master = self.storage.obtain_block(0)?;
            MasterView::check(&master)?;
            log::debug!("opened existing filesystem, block size {}", block_size);
        }
        self.state = FsState::Inited;
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn max_name_bytes(&self) -> u32 {
        assert!(self.state == FsState::Inited);
        self.max_name_bytes
    }

    pub fn max_meta_bytes(&self) -> u32 {
        assert!(self.state == FsState::Inited);
        self.max_meta_bytes
    }

    pub fn check_name(&self, name: &[u8]) -> Result<()> {
        assert!(self.state == FsState::Inited);
        self.check_name_inner(name)
    }

    fn check_name_inner(&self, name: &[u8]) -> Result<()> {
        if name.len() > self.max_name_bytes as usize {
            return Err(AfsError::NameTooLong);
        }
        if name.is_empty() || name == b"." || name == b".." {
            return Err(AfsError::NameInvalid);
        }
        if name.iter().any(|&b| b == 0 || b == b'/') {
            return Err(AfsError::NameInvalid);
        }
        Ok(())
    }

    fn ensure_inited(&self) -> Result<()> {
        match self.state {
            FsState::Inited => Ok(()),
            FsState::Error => Err(AfsError::StorageInErrorState),
            FsState::Uninited => panic!("filesystem not initialized"),
        }
    }

    /// Structure and storage failures taint the instance; plain result
    /// codes pass through.
    fn note_error(&mut self, e: AfsError) -> AfsError {
        match e {
            AfsError::StorageInErrorState
            | AfsError::UnexpectedBlockKind
            | AfsError::BlockIndexInvalid => self.state = FsState::Error,
            _ => {}
        }
        e
    }

    /// Run one mutation inside a journaled write; abort on any failure
    /// so nothing of a failed operation is ever visible.
    fn run_in_jw<T>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut JournaledWrite) -> Result<T>,
    ) -> Result<T> {
        let mut jw = match JournaledWrite::begin(&mut self.storage) {
            Ok(jw) => jw,
            Err(e) => return Err(self.note_error(e)),
        };
        match f(self, &mut jw) {
            Ok(v) => match jw.complete(&mut self.storage) {
                Ok(()) => Ok(v),
                Err(e) => {
                    self.storage.abort_journaled_write();
                    Err(self.note_error(e))
                }
            },
            Err(e) => {
                self.storage.abort_journaled_write();
                Err(self.note_error(e))
            }
        }
    }

    fn master_view(&mut self) -> Result<MasterView> {
        let master = self.storage.obtain_block(0)?;
        MasterView::check(&master)?;
        Ok(MasterView::new(master))
    }

    /// Resolve an object id to its top-node block, checking identity and
    /// object type. `expect` selects the error vocabulary.
    pub(crate) fn get_top_block(&mut self, id: ObjId, expect: ObjType) -> Result<BlockRef> {
        let id = canonical(id);
        if !id.any() {
            return Err(AfsError::InvalidObjId);
        }
        let index = if id == ObjId::ROOT {
            self.master_view()?.root_dir_top_node_index()
        } else {
            id.index
        };
        if index == 0 || index >= self.storage.nr_blocks() {
            return Err(AfsError::InvalidObjId);
        }

        let not_found = match expect {
            ObjType::Dir => AfsError::DirNotFound,
            _ => AfsError::ObjNotFound,
        };
        let block = self.storage.obtain_block(index)?;
        if block.get_u8(0) != block_kind::NODE
            || block.get_u8(layout::NODE_CAT_OFF) != layout::node_cat::TOP
        {
            return Err(not_found);
        }
        let top = TopView::new(block.clone())?;
        if top.unique_id() != id.unique_id {
            return Err(not_found);
        }
        let obj_type = top.obj_type()?;
        match expect {
            ObjType::Any => {}
            ObjType::Dir if obj_type != ObjType::Dir => return Err(AfsError::ObjNotDir),
            ObjType::File if obj_type != ObjType::File => return Err(AfsError::ObjNotFile),
            _ => {}
        }
        Ok(block)
    }

    // ---- lookups -------------------------------------------------------

    pub fn find_name_in_dir(&mut self, parent: ObjId, name: &[u8]) -> Result<DirEntry> {
        self.ensure_inited()?;
        let mut cx = DirCx::load_top(self, parent)?;
        cx.find_entry(self, name)?.ok_or(AfsError::NameNotInDir)
    }

    /// Walk an absolute path, appending one entry per component. On a
    /// failed lookup the entries walked so far remain in `entries` and
    /// the error refers to the next component.
    pub fn crack_path(&mut self, abs_path: &[u8], entries: &mut Vec<DirEntry>) -> Result<()> {
        self.ensure_inited()?;
        let components = path::parse_abs_path(abs_path)?;
        let mut cur = ObjId::ROOT;
        for comp in components {
            let entry = {
                let mut cx = DirCx::load_top(self, cur)?;
                cx.find_entry(self, comp)?.ok_or(AfsError::NameNotInDir)?
            };
            cur = entry.id;
            entries.push(entry);
        }
        Ok(())
    }

    pub fn obj_stat(&mut self, id: ObjId) -> Result<StatInfo> {
        self.ensure_inited()?;
        let block = self.get_top_block(id, ObjType::Any)?;
        let top = TopView::new(block)?;
        let obj_type = top.obj_type()?;
        Ok(StatInfo {
            obj_type,
            id: top.obj_id(),
            parent_id: top.parent_id(),
            dir_nr_entries: if obj_type == ObjType::Dir {
                top.dir_nr_entries()
            } else {
                u64::MAX
            },
            file_size_bytes: if obj_type == ObjType::File {
                top.file_size_bytes()
            } else {
                u64::MAX
            },
            create_time: top.create_time(),
            modify_time: top.modify_time(),
            meta_data: top.meta(),
        })
    }

    /// Update the fields selected by `fields`. Metadata keeps its
    /// length; a length change returns `MetaDataCannotChangeLen`.
    pub fn obj_set_stat(&mut self, id: ObjId, info: &StatInfo, fields: StatFields) -> Result<()> {
        self.ensure_inited()?;
        self.run_in_jw(|fs, jw| {
            let block = fs.get_top_block(id, ObjType::Any)?;
            let top = TopView::new(block.clone())?;
            if fields.contains(StatFields::META_DATA) {
                if info.meta_data.len() != top.meta_len() {
                    return Err(AfsError::MetaDataCannotChangeLen);
                }
                top.set_meta(&info.meta_data);
            }
            if fields.contains(StatFields::CREATE_TIME) {
                top.set_create_time(info.create_time);
            }
            if fields.contains(StatFields::MODIFY_TIME) {
                top.set_modify_time(info.modify_time);
            }
            jw.track(block);
            Ok(())
        })
    }

    // ---- directory mutations -------------------------------------------

    pub fn dir_create(
        &mut self,
        parent: ObjId,
        name: &[u8],
        meta: &[u8],
        now: u64,
    ) -> Result<ObjId> {
        self.ensure_inited()?;
        self.check_name_inner(name)?;
        if meta.len() > self.max_meta_bytes as usize {
            return Err(AfsError::MetaDataTooLong);
        }
        self.run_in_jw(|fs, jw| {
            let mut cx = DirCx::load_top(fs, parent)?;
            let parent_id = cx.top_view().obj_id();
            let unique_id = jw.take_unique_id();
            let top_block = jw.reclaim_or_add_new(&mut fs.storage, Some(block_kind::NODE))?;
            TopView::format(&top_block, ObjType::Dir, unique_id, parent_id, now, meta);
            let id = ObjId::new(unique_id, top_block.block_index());
            cx.add_leaf_entry(
                fs,
                jw,
                DirEntry {
                    id,
                    obj_type: ObjType::Dir,
                    name: name.to_vec(),
                },
            )?;
            Self::apply_dir_top_updates(&cx, now);
            cx.finalize(fs, jw);
            jw.track(top_block);
            Ok(id)
        })
    }

    pub fn file_create(
        &mut self,
        parent: ObjId,
        name: &[u8],
        meta: &[u8],
        now: u64,
    ) -> Result<ObjId> {
        self.ensure_inited()?;
        self.check_name_inner(name)?;
        if meta.len() > self.max_meta_bytes as usize {
            return Err(AfsError::MetaDataTooLong);
        }
        self.run_in_jw(|fs, jw| {
            let mut cx = DirCx::load_top(fs, parent)?;
            let parent_id = cx.top_view().obj_id();
            let unique_id = jw.take_unique_id();
            let top_block = jw.reclaim_or_add_new(&mut fs.storage, Some(block_kind::NODE))?;
            let top = TopView::format(&top_block, ObjType::File, unique_id, parent_id, now, meta);
            // files are born in the inline mini shape
            top_block.put_u8(top.tree_view_off(), FILE_NODE_LEVEL_MINI);
            let id = ObjId::new(unique_id, top_block.block_index());
            cx.add_leaf_entry(
                fs,
                jw,
                DirEntry {
                    id,
                    obj_type: ObjType::File,
                    name: name.to_vec(),
                },
            )?;
            Self::apply_dir_top_updates(&cx, now);
            cx.finalize(fs, jw);
            jw.track(top_block);
            Ok(id)
        })
    }

    fn apply_dir_top_updates(cx: &DirCx, now: u64) {
        let top = cx.top_view();
        let nr = (top.dir_nr_entries() as i64 + cx.nr_entries_delta) as u64;
        top.set_dir_nr_entries(nr);
        top.set_modify_time(now);
    }

    /// Delete the named object. Directories must be empty and files must
    /// have size zero, so the object's top node is the only block freed
    /// (beyond any parent-tree shrink effects).
    pub fn obj_delete(&mut self, parent: ObjId, name: &[u8], now: u64) -> Result<()> {
        self.ensure_inited()?;
        self.run_in_jw(|fs, jw| {
            let mut cx = DirCx::load_top(fs, parent)?;
            let entry = cx
                .find_entry(fs, name)?
                .ok_or(AfsError::NameNotInDir)?;
            let target = fs.storage.obtain_block(entry.id.index)?;
            let top = TopView::new(target.clone())?;
            if top.unique_id() != entry.id.unique_id {
                return Err(AfsError::UnexpectedBlockKind);
            }
            match entry.obj_type {
                ObjType::Dir => {
                    if top.dir_nr_entries() != 0 {
                        return Err(AfsError::DirNotEmpty);
                    }
                }
                ObjType::File => {
                    if top.file_size_bytes() != 0 {
                        return Err(AfsError::FileNotEmpty);
                    }
                }
                ObjType::Any => return Err(AfsError::UnexpectedBlockKind),
            }
            cx.remove_leaf_entry(fs, jw, name)?;
            jw.free_block(target);
            Self::apply_dir_top_updates(&cx, now);
            cx.finalize(fs, jw);
            Ok(())
        })
    }

    /// Move and/or rename an object. Moving a directory under its own
    /// subtree returns `MoveDestInvalid`.
    pub fn obj_move(
        &mut self,
        parent_old: ObjId,
        name_old: &[u8],
        parent_new: ObjId,
        name_new: &[u8],
        now: u64,
    ) -> Result<()> {
        self.ensure_inited()?;
        self.check_name_inner(name_new)?;
        let same_parent = canonical(parent_old) == canonical(parent_new);
        self.run_in_jw(|fs, jw| {
            if same_parent {
                let mut cx = DirCx::load_top(fs, parent_old)?;
                if cx.find_entry(fs, name_new)?.is_some() {
                    return Err(AfsError::NameExists);
                }
                let entry = cx.remove_leaf_entry(fs, jw, name_old)?;
                cx.add_leaf_entry(
                    fs,
                    jw,
                    DirEntry {
                        id: entry.id,
                        obj_type: entry.obj_type,
                        name: name_new.to_vec(),
                    },
                )?;
                Self::apply_dir_top_updates(&cx, now);
                cx.finalize(fs, jw);
                return Ok(());
            }

            let mut cx_old = DirCx::load_top(fs, parent_old)?;
            let mut cx_new = DirCx::load_top(fs, parent_new)?;
            let entry = cx_old
                .find_entry(fs, name_old)?
                .ok_or(AfsError::NameNotInDir)?;
            if cx_new.find_entry(fs, name_new)?.is_some() {
                return Err(AfsError::NameExists);
            }

            if entry.obj_type == ObjType::Dir {
                // Walking parent ids from the destination must not pass
                // through the object being moved.
                let mut cur = cx_new.top_view().obj_id();
                loop {
                    if cur == entry.id {
                        return Err(AfsError::MoveDestInvalid);
                    }
                    if cur == ObjId::ROOT || !cur.any() {
                        break;
                    }
                    let block = fs.get_top_block(cur, ObjType::Any)?;
                    cur = TopView::new(block)?.parent_id();
                }
            }

            cx_old.remove_leaf_entry(fs, jw, name_old)?;
            cx_new.add_leaf_entry(
                fs,
                jw,
                DirEntry {
                    id: entry.id,
                    obj_type: entry.obj_type,
                    name: name_new.to_vec(),
                },
            )?;

            let moved = fs.storage.obtain_block(entry.id.index)?;
            let moved_top = TopView::new(moved.clone())?;
            if moved_top.unique_id() != entry.id.unique_id {
                return Err(AfsError::UnexpectedBlockKind);
            }
            moved_top.set_parent_id(cx_new.top_view().obj_id());
            jw.track(moved);

            Self::apply_dir_top_updates(&cx_old, now);
            Self::apply_dir_top_updates(&cx_new, now);
            cx_old.finalize(fs, jw);
            cx_new.finalize(fs, jw);
            Ok(())
        })
    }

    /// Resumable enumeration: pass an empty `last_name_read` to start,
    /// then the last name received to continue. Appends one leaf's worth
    /// of entries per call; `entries` is not cleared. Returns whether
    /// the end of the directory was reached.
    pub fn dir_read(
        &mut self,
        dir: ObjId,
        last_name_read: &[u8],
        entries: &mut Vec<DirEntry>,
    ) -> Result<bool> {
        self.ensure_inited()?;
        let mut cx = DirCx::load_top(self, dir)?;
        let last = if last_name_read.is_empty() {
            None
        } else {
            Some(last_name_read)
        };
        let (batch, reached_end) = cx.read_batch(self, last)?;
        entries.extend(batch);
        Ok(reached_end)
    }

    // ---- file operations -----------------------------------------------

    pub fn file_max_mini_node_bytes(&mut self, id: ObjId) -> Result<u32> {
        self.ensure_inited()?;
        let cx = FileCx::load_top(self, id)?;
        Ok(cx.max_mini_bytes(self))
    }

    /// Stream a byte range through `on_data`; the last invocation has
    /// `reached_end = true`. Reading past the size is `InvalidOffset`;
    /// a range poking beyond the end is clamped.
    pub fn file_read<F: FnMut(&[u8], bool)>(
        &mut self,
        id: ObjId,
        offset: u64,
        n: usize,
        on_data: F,
    ) -> Result<()> {
        self.ensure_inited()?;
        let mut cx = FileCx::load_top(self, id)?;
        let size = cx.top_view().file_size_bytes();
        if offset > size {
            return Err(AfsError::InvalidOffset);
        }
        let n = core::cmp::min(n as u64, size - offset) as usize;
        cx.read_range(self, offset, n, on_data)
    }

    /// Write bytes at `offset`, enlarging the file first when the range
    /// reaches past the current end. Enlargement runs in bounded
    /// journaled-write rounds; the data lands in the final round.
    pub fn file_write(&mut self, id: ObjId, offset: u64, data: &[u8], now: u64) -> Result<()> {
        self.ensure_inited()?;
        let target_end = offset
            .checked_add(data.len() as u64)
            .ok_or(AfsError::InvalidOffset)?;
        loop {
            let done = self.run_in_jw(|fs, jw| {
                let mut cx = FileCx::load_top(fs, id)?;
                let size = cx.top_view().file_size_bytes();
                let target = core::cmp::max(size, target_end);
                let mut done = true;
                if target > size {
                    let reached =
                        cx.enlarge_step(fs, jw, target, FILE_SET_SIZE_MAX_BLOCKS_PER_ROUND)?;
                    done = reached >= target;
                }
                if done {
                    cx.write_range(fs, jw, offset, data)?;
                    cx.top_view().set_modify_time(now);
                }
                cx.finalize(fs, jw);
                Ok(done)
            })?;
            if done {
                return Ok(());
            }
        }
    }

    /// Grow or shrink to `new_size` in bounded rounds; shrunk-away
    /// blocks are zeroed before they are freed. Returns the size
    /// reached. When growth runs out of space, the rounds committed so
    /// far persist and are observable through `obj_stat`.
    pub fn file_set_size(&mut self, id: ObjId, new_size: u64, now: u64) -> Result<u64> {
        self.ensure_inited()?;
        loop {
            let (done, reached) = self.run_in_jw(|fs, jw| {
                let mut cx = FileCx::load_top(fs, id)?;
                let size = cx.top_view().file_size_bytes();
                let (done, reached) = if new_size > size {
                    let r = cx.enlarge_step(fs, jw, new_size, FILE_SET_SIZE_MAX_BLOCKS_PER_ROUND)?;
                    (r >= new_size, r)
                } else if new_size < size {
                    let r = cx.shrink_step(fs, jw, new_size, FILE_SET_SIZE_MAX_BLOCKS_PER_ROUND)?;
                    (r <= new_size, r)
                } else {
                    (true, size)
                };
                if done {
                    cx.top_view().set_modify_time(now);
                }
                cx.finalize(fs, jw);
                Ok((done, reached))
            })?;
            if done {
                return Ok(reached);
            }
        }
    }

    // ---- free space ----------------------------------------------------

    /// Number of blocks recorded on the free-block chain.
    pub fn free_space_blocks(&mut self) -> Result<u64> {
        self.ensure_inited()?;
        let master = self.master_view()?;
        let cap = FreeListView::max_nr_indices(self.block_size) as u64;
        let mut free = master.nr_full_free_list_nodes() * cap;
        let tail = master.free_list_tail();
        if tail != NO_BLOCK {
            let block = self.storage.obtain_block(tail)?;
            free += FreeListView::new(block)?.nr_indices() as u64;
        }
        Ok(free)
    }

    pub fn free_space_bytes(&mut self) -> Result<u64> {
        Ok(self
            .free_space_blocks()?
            .saturating_mul(self.block_size as u64))
    }

    /// Walk the free-block chain and check it against the master block
    /// counters and the per-block kind stamps. Returns the number of
    /// recorded free blocks.
    pub fn verify_free_list(&mut self) -> Result<u64> {
        self.ensure_inited()?;
        let master = self.master_view()?;
        let cap = FreeListView::max_nr_indices(self.block_size);
        let nr_blocks = self.storage.nr_blocks();

        let mut seen = alloc::collections::BTreeSet::new();
        let mut total = 0u64;
        let mut full_nodes = 0u64;
        let mut cur = master.free_list_tail();
        let mut first = true;
        while cur != NO_BLOCK {
            if !seen.insert(cur) {
                return Err(AfsError::UnexpectedBlockKind);
            }
            let block = self.storage.obtain_block(cur)?;
            let view = FreeListView::new(block)?;
            let nr = view.nr_indices();
            if !first {
                if nr != cap {
                    return Err(AfsError::UnexpectedBlockKind);
                }
                full_nodes += 1;
            }
            for i in 0..nr {
                let index = view.free_block_index(i);
                if index == 0 || index >= nr_blocks || !seen.insert(index) {
                    return Err(AfsError::UnexpectedBlockKind);
                }
                let freed = self.storage.obtain_block(index)?;
                if freed.get_u8(0) != block_kind::FREE_BLOCK {
                    return Err(AfsError::UnexpectedBlockKind);
                }
                total += 1;
            }
            cur = view.prev_free_list_block_index();
            first = false;
        }
        if full_nodes != master.nr_full_free_list_nodes() {
            return Err(AfsError::UnexpectedBlockKind);
        }
        Ok(total)
    }

    /// Consume the filesystem, returning the storage.
    pub fn into_storage(self) -> S {
        self.storage
    }
}
