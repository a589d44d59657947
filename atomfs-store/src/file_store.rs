//! File-backed journaled block store.
//!
//! The data file carries a fixed 4096-byte header block (signature +
//! block size) followed by the raw block array. Grouped block writes are
//! made atomic through a side journal file: the record is written and
//! synced first, then applied to the data file, then the journal is
//! truncated. An outstanding record found on open is replayed before
//! anything else reads a block; replay is idempotent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use atomfs::{AfsBlock, AfsError, AfsStorage, BlockRef};

use crate::block_alloc::BlockAllocator;
use crate::cache::BlockCache;
use crate::error::{Result, StoreError};
use crate::storage_file::{FileRole, SharedSimErrDecider, StorageFile};

/// Data file header size and minimum unit of the block size.
pub const MIN_BLOCK_SIZE: u32 = 4096;

const SIGNATURE: &[u8] = b"AfsFileStorage\x1A";

const JOURNAL_OP_ENTRY: u8 = 1;
const JOURNAL_OP_END: u8 = 2;

/// Durability level, configured at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Consistency {
    /// No write-through anywhere and no journal: process-crash safe
    /// only, not power-loss safe.
    NoFlush,
    /// No journal; the data file is synced after each apply phase.
    Flush,
    /// Journal and data file are write-through. The correctness default.
    Journal,
    /// Like `Journal`, but the record is re-read and parsed before it is
    /// applied. For self-tests.
    VerifyJournal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Ready,
    JournaledWrite,
    Abortable,
    RecoverableExecuteJournal,
    RecoverableClearJournal,
    Unrecoverable,
}

pub struct FileStore {
    state: State,
    block_size: u32,
    max_nr_blocks: u64,
    consistency: Consistency,
    allocator: BlockAllocator,
    data_file: StorageFile,
    journal_file: StorageFile,
    nr_blocks_stored: u64,
    nr_blocks_to_add: u64,
    nr_cache_hits: u64,
    nr_cache_misses: u64,
    cache_target_size: usize,
    cache_max_age: Duration,
    cache: BlockCache,
    /// Handles given out during the current journaled write; obtaining
    /// the same index again resolves to the same staged buffer.
    jw_handles: BTreeMap<u64, BlockRef>,
}

impl FileStore {
    /// The journal file sits next to the data file: same base name,
    /// `.jnl` extension.
    pub fn journal_file_path(data_file_path: &Path) -> PathBuf {
        data_file_path.with_extension("jnl")
    }

    /// Open or create a store. For an existing store `create_block_size`
    /// is ignored; for a fresh one it must be a nonzero multiple of
    /// [`MIN_BLOCK_SIZE`].
    pub fn open(
        data_file_full_path: &Path,
        create_block_size: u32,
        consistency: Consistency,
    ) -> Result<FileStore> {
        let write_through = consistency >= Consistency::Journal;

        let mut allocator = BlockAllocator::new(MIN_BLOCK_SIZE as usize);
        let mut data_file = StorageFile::new(FileRole::Data);
        data_file.set_block_size(MIN_BLOCK_SIZE as usize);
        data_file.set_full_path(data_file_full_path);
        data_file.open(write_through, false)?;

        let mut journal_file = StorageFile::new(FileRole::Journal);
        if consistency >= Consistency::Journal {
            journal_file.set_block_size(MIN_BLOCK_SIZE as usize);
            journal_file.set_full_path(&Self::journal_file_path(data_file_full_path));
            journal_file.open(true, true)?;
        }

        let block_size;
        let nr_blocks_stored;
        if data_file.file_size() == 0 {
            if create_block_size == 0 || create_block_size % MIN_BLOCK_SIZE != 0 {
                return Err(StoreError::InvalidBlockSize(create_block_size));
            }
            block_size = create_block_size;

            let mut header = allocator.get_block();
            header[..SIGNATURE.len()].copy_from_slice(SIGNATURE);
            header[SIGNATURE.len()..SIGNATURE.len() + 4]
                .copy_from_slice(&block_size.to_le_bytes());
            let result = data_file.write_blocks(&header, 0);
            allocator.release_block(header);
            result?;
            nr_blocks_stored = 0;
            log::info!(
                "created store {} with block size {}",
                data_file_full_path.display(),
                block_size
            );
        } else {
            let mut header = allocator.get_block();
            let result = data_file.read_blocks(&mut header, 0);
            if let Err(e) = result {
                allocator.release_block(header);
                return Err(e);
            }
            if &header[..SIGNATURE.len()] != SIGNATURE {
                allocator.release_block(header);
                return Err(StoreError::InvalidSignature);
            }
            let decoded = u32::from_le_bytes(
                header[SIGNATURE.len()..SIGNATURE.len() + 4]
                    .try_into()
                    .unwrap(),
            );
            allocator.release_block(header);
            if decoded == 0 || decoded % MIN_BLOCK_SIZE != 0 {
                return Err(StoreError::InvalidBlockSize(decoded));
            }
            block_size = decoded;
            nr_blocks_stored = data_file
                .file_size()
                .saturating_sub(MIN_BLOCK_SIZE as u64)
                / block_size as u64;
            log::info!(
                "opened store {} ({} blocks of {})",
                data_file_full_path.display(),
                nr_blocks_stored,
                block_size
            );
        }

        allocator.set_bytes_per_block(block_size as usize);
        data_file.set_block_size(block_size as usize);
        journal_file.set_block_size(block_size as usize);

        let mut store = FileStore {
            state: State::Initial,
            block_size,
            max_nr_blocks: u64::MAX,
            consistency,
            allocator,
            data_file,
            journal_file,
            nr_blocks_stored,
            nr_blocks_to_add: 0,
            nr_cache_hits: 0,
            nr_cache_misses: 0,
            cache_target_size: 100,
            cache_max_age: Duration::from_secs(60),
            cache: BlockCache::new(),
            jw_handles: BTreeMap::new(),
        };

        if consistency >= Consistency::Journal {
            match store.read_journal()? {
                Some(entries) if !entries.is_empty() => {
                    log::info!("replaying journal record with {} blocks", entries.len());
                    store.execute_entries(&entries)?;
                }
                Some(_) => {}
                None => {
                    if store.journal_file.file_size() != 0 {
                        log::warn!("discarding incomplete journal record");
                    }
                }
            }
            store.clear_journal()?;
        }

        store.state = State::Ready;
        Ok(store)
    }

    /// Bound the data file size (journal excluded, which may briefly
    /// grow to arbitrary size). `u64::MAX` for unlimited.
    pub fn set_max_size_bytes(&mut self, max_size_bytes: u64) {
        if max_size_bytes == u64::MAX {
            self.max_nr_blocks = u64::MAX;
        } else {
            self.max_nr_blocks =
                max_size_bytes.saturating_sub(MIN_BLOCK_SIZE as u64) / self.block_size as u64;
        }
    }

    pub fn set_cache_limits(&mut self, target_size: usize, max_age: Duration) {
        self.cache_target_size = target_size;
        self.cache_max_age = max_age;
    }

    /// Install or clear the simulated-error decider on both files.
    pub fn set_sim_err_decider(&mut self, decider: Option<SharedSimErrDecider>) {
        self.data_file.set_sim_err_decider(decider.clone());
        self.journal_file.set_sim_err_decider(decider);
    }

    pub fn nr_simulated_io_errs_data(&self) -> u64 {
        self.data_file.nr_simulated_io_errs()
    }

    pub fn nr_simulated_io_errs_journal(&self) -> u64 {
        self.journal_file.nr_simulated_io_errs()
    }

    pub fn nr_cache_hits(&self) -> u64 {
        self.nr_cache_hits
    }

    pub fn nr_cache_misses(&self) -> u64 {
        self.nr_cache_misses
    }

    fn data_offset(&self, block_index: u64) -> u64 {
        MIN_BLOCK_SIZE as u64 + self.block_size as u64 * block_index
    }

    /// Parse the outstanding journal record, if any. `Ok(None)` means
    /// empty, truncated, or corrupt — the record never made it fully to
    /// stable storage and must be discarded.
    fn read_journal(&mut self) -> Result<Option<BTreeMap<u64, Rc<Vec<u8>>>>> {
        let journal_size = self.journal_file.file_size();
        if journal_size == 0 {
            return Ok(None);
        }

        let block_size = self.block_size as usize;
        let mut raw = self.allocator.alloc_memory(journal_size as usize);
        let result = self.journal_file.read_blocks(&mut raw, 0);
        result?;
        let raw = &raw[..journal_size as usize];

        let mut entries = BTreeMap::new();
        let mut cursor = 0usize;
        loop {
            if cursor >= raw.len() {
                return Ok(None);
            }
            match raw[cursor] {
                JOURNAL_OP_END => return Ok(Some(entries)),
                JOURNAL_OP_ENTRY => {
                    cursor += 1;
                    if cursor + 8 + block_size > raw.len() {
                        return Ok(None);
                    }
                    let block_index =
                        u64::from_le_bytes(raw[cursor..cursor + 8].try_into().unwrap());
                    cursor += 8;
                    entries.insert(block_index, Rc::new(raw[cursor..cursor + block_size].to_vec()));
                    cursor += block_size;
                }
                _ => return Ok(None),
            }
        }
    }

    fn write_journal(&mut self, entries: &BTreeMap<u64, Rc<Vec<u8>>>) -> Result<()> {
        let block_size = self.block_size as usize;
        let bytes_per_entry = 1 + 8 + block_size;
        let total_bytes = bytes_per_entry * entries.len() + 1;
        let mut record = self.allocator.alloc_memory(total_bytes);
        let record_len = record.len();

        let mut cursor = 0usize;
        for (&block_index, data) in entries {
            record[cursor] = JOURNAL_OP_ENTRY;
            record[cursor + 1..cursor + 9].copy_from_slice(&block_index.to_le_bytes());
            record[cursor + 9..cursor + 9 + block_size].copy_from_slice(data);
            cursor += bytes_per_entry;
        }
        record[cursor] = JOURNAL_OP_END;

        self.journal_file.write_blocks(&record, 0)?;
        self.journal_file.set_eof(record_len as u64)?;
        Ok(())
    }

    fn clear_journal(&mut self) -> Result<()> {
        let block = self.allocator.get_block();
        let result = self.journal_file.write_blocks(&block, 0);
        self.allocator.release_block(block);
        result?;
        self.journal_file.set_eof(self.block_size as u64)
    }

    /// Apply journal entries to the data file. Consecutive block runs
    /// are issued as single writes.
    fn execute_entries(&mut self, entries: &BTreeMap<u64, Rc<Vec<u8>>>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let block_size = self.block_size as usize;
        let mut run: Vec<(u64, &[u8])> = Vec::new();
        let mut flush_run = |store: &mut FileStore, run: &mut Vec<(u64, &[u8])>| -> Result<()> {
            if run.is_empty() {
                return Ok(());
            }
            let first = run[0].0;
            if run.len() == 1 {
                store
                    .data_file
                    .write_blocks(run[0].1, store.data_offset(first))?;
            } else {
                let mut buf = store.allocator.alloc_memory(run.len() * block_size);
                for (i, (_, data)) in run.iter().enumerate() {
                    buf[i * block_size..(i + 1) * block_size].copy_from_slice(data);
                }
                store
                    .data_file
                    .write_blocks(&buf[..run.len() * block_size], store.data_offset(first))?;
            }
            run.clear();
            Ok(())
        };

        for (&block_index, data) in entries {
            let data: &[u8] = data;
            assert_eq!(data.len(), block_size);
            match run.last() {
                Some(&(last, _)) if last + 1 == block_index => run.push((block_index, data)),
                None => run.push((block_index, data)),
                Some(_) => {
                    flush_run(self, &mut run)?;
                    run.push((block_index, data));
                }
            }
        }
        flush_run(self, &mut run)?;

        if self.consistency == Consistency::Flush {
            self.data_file.sync()?;
        }

        let last_block_index = *entries.keys().next_back().unwrap();
        if last_block_index >= self.nr_blocks_stored {
            self.nr_blocks_stored = last_block_index + 1;
        }
        Ok(())
    }

    /// Retry whatever the last failure left undone. On success the state
    /// becomes `Ready`; on failure it stays recoverable.
    fn try_recover(&mut self) -> Result<()> {
        if self.consistency < Consistency::Journal {
            return Err(StoreError::InErrorState);
        }
        if self.state == State::RecoverableExecuteJournal {
            log::info!("retrying journal application");
            if let Some(entries) = self.read_journal()? {
                self.execute_entries(&entries)?;
                self.state = State::RecoverableClearJournal;
            }
        }
        if self.state == State::RecoverableClearJournal {
            log::info!("retrying journal truncation");
            self.clear_journal()?;
            self.cache.clear();
            self.nr_blocks_to_add = 0;
            self.jw_handles.clear();
            self.state = State::Ready;
        }
        if self.state == State::Ready {
            Ok(())
        } else {
            Err(StoreError::InErrorState)
        }
    }

    fn recover_if_needed(&mut self) -> Result<()> {
        if self.state == State::RecoverableExecuteJournal
            || self.state == State::RecoverableClearJournal
        {
            self.try_recover()?;
        }
        Ok(())
    }

    fn complete_inner(&mut self, blocks: &[BlockRef]) -> Result<()> {
        assert!(self.state == State::JournaledWrite, "complete without begin");
        let start_nr_blocks_stored = self.nr_blocks_stored;
        let expect_nr_blocks_stored = self.nr_blocks_stored + self.nr_blocks_to_add;
        let mut nr_new_written = 0u64;

        self.state = State::Unrecoverable;

        let mut entries: BTreeMap<u64, Rc<Vec<u8>>> = BTreeMap::new();
        for block in blocks {
            assert!(block.change_pending(), "clean block in journaled write");
            let block_index = block.block_index();
            let data = block.snapshot();
            assert_eq!(data.len(), self.block_size as usize);
            let prev = entries.insert(block_index, data.clone());
            assert!(prev.is_none(), "duplicate block in journaled write");
            if block_index >= start_nr_blocks_stored {
                assert!(block_index < expect_nr_blocks_stored, "write past created blocks");
                nr_new_written += 1;
            }
            self.cache.insert(block_index, data);
        }
        assert_eq!(
            nr_new_written, self.nr_blocks_to_add,
            "created blocks missing from journaled write"
        );

        if self.consistency < Consistency::Journal {
            self.execute_entries(&entries)?;
        } else {
            // Journal write failure aborts the transaction: clear the
            // journal and the (now poisoned) cache so the store remains
            // usable.
            if let Err(e) = self.write_journal(&entries) {
                if let Err(clear_err) = self.clear_journal() {
                    log::warn!("journal clear after failed write failed: {}", clear_err);
                    self.state = State::RecoverableClearJournal;
                    return Err(e);
                }
                self.cache.clear();
                self.state = State::Abortable;
                return Err(e);
            }

            // The journal is durable: from here on the transaction is
            // committed, and apply/truncate failures are retried later.
            let apply_result = if self.consistency == Consistency::VerifyJournal {
                match self.read_journal() {
                    Ok(Some(read_back)) => self.execute_entries(&read_back),
                    Ok(None) => {
                        log::error!("journal record unreadable right after writing it");
                        return Err(StoreError::InErrorState);
                    }
                    Err(e) => Err(e),
                }
            } else {
                self.execute_entries(&entries)
            };
            if apply_result.is_err() {
                self.state = State::RecoverableExecuteJournal;
                return Ok(());
            }

            if self.clear_journal().is_err() {
                self.state = State::RecoverableClearJournal;
                return Ok(());
            }
        }

        assert_eq!(expect_nr_blocks_stored, self.nr_blocks_stored);
        for block in blocks {
            block.clear_change_pending();
        }
        self.nr_blocks_to_add = 0;
        self.jw_handles.clear();
        self.cache.prune(self.cache_target_size, self.cache_max_age);
        self.state = State::Ready;
        Ok(())
    }
}

impl AfsStorage for FileStore {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn max_nr_blocks(&self) -> u64 {
        self.max_nr_blocks
    }

    fn nr_blocks(&self) -> u64 {
        self.nr_blocks_stored + self.nr_blocks_to_add
    }

    fn add_new_block(&mut self) -> atomfs::Result<BlockRef> {
        assert!(
            self.state == State::JournaledWrite,
            "add_new_block outside journaled write"
        );
        let nr_blocks = self.nr_blocks();
        if nr_blocks >= self.max_nr_blocks {
            return Err(AfsError::OutOfSpace);
        }
        let handle = AfsBlock::new(nr_blocks, Rc::new(self.allocator.get_block()));
        self.jw_handles.insert(nr_blocks, handle.clone());
        self.nr_blocks_to_add += 1;
        Ok(handle)
    }

    fn obtain_block(&mut self, block_index: u64) -> atomfs::Result<BlockRef> {
        self.recover_if_needed().map_err(AfsError::from)?;
        if self.state == State::Unrecoverable {
            return Err(AfsError::StorageInErrorState);
        }
        assert!(
            self.state == State::Ready || self.state == State::JournaledWrite,
            "obtain_block in invalid state"
        );

        if self.state == State::JournaledWrite {
            if let Some(handle) = self.jw_handles.get(&block_index) {
                return Ok(handle.clone());
            }
        }
        if block_index >= self.nr_blocks_stored {
            return Err(AfsError::BlockIndexInvalid);
        }

        let data = match self.cache.find(block_index) {
            Some(data) => {
                self.nr_cache_hits += 1;
                data
            }
            None => {
                let mut buf = self.allocator.get_block();
                let offset = self.data_offset(block_index);
                if let Err(e) = self.data_file.read_blocks(&mut buf, offset) {
                    self.allocator.release_block(buf);
                    return Err(StoreError::from(e).into());
                }
                self.nr_cache_misses += 1;
                let data = Rc::new(buf);
                self.cache.insert(block_index, data.clone());
                data
            }
        };

        let handle = AfsBlock::new(block_index, data);
        if self.state == State::JournaledWrite {
            self.jw_handles.insert(block_index, handle.clone());
        }
        self.cache.prune(self.cache_target_size, self.cache_max_age);
        Ok(handle)
    }

    fn obtain_block_for_overwrite(&mut self, block_index: u64) -> atomfs::Result<BlockRef> {
        assert!(
            self.state == State::JournaledWrite,
            "obtain_block_for_overwrite outside journaled write"
        );
        if let Some(handle) = self.jw_handles.get(&block_index) {
            return Ok(handle.clone());
        }
        if block_index >= self.nr_blocks_stored {
            return Err(AfsError::BlockIndexInvalid);
        }

        // No read: the contents are declared garbage until overwritten.
        let data = match self.cache.find(block_index) {
            Some(data) => {
                self.nr_cache_hits += 1;
                data
            }
            None => {
                self.nr_cache_misses += 1;
                Rc::new(self.allocator.get_block())
            }
        };
        let handle = AfsBlock::new(block_index, data);
        self.jw_handles.insert(block_index, handle.clone());
        self.cache.prune(self.cache_target_size, self.cache_max_age);
        Ok(handle)
    }

    fn begin_journaled_write(&mut self) -> atomfs::Result<()> {
        self.recover_if_needed().map_err(AfsError::from)?;
        if self.state == State::Unrecoverable {
            return Err(AfsError::StorageInErrorState);
        }
        assert!(self.state == State::Ready, "begin with a write in flight");
        self.state = State::JournaledWrite;
        Ok(())
    }

    fn abort_journaled_write(&mut self) {
        match self.state {
            State::RecoverableClearJournal
            | State::RecoverableExecuteJournal
            | State::Unrecoverable => return,
            State::JournaledWrite | State::Abortable => {}
            _ => panic!("abort without journaled write"),
        }
        self.jw_handles.clear();
        self.nr_blocks_to_add = 0;
        self.state = State::Ready;
    }

    fn complete_journaled_write(&mut self, blocks: &[BlockRef]) -> atomfs::Result<()> {
        self.complete_inner(blocks).map_err(AfsError::from)
    }
}
