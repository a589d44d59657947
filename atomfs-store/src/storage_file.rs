//! OS-file wrapper used for the data and journal files.
//!
//! All regular I/O is block-aligned. The logical size is tracked
//! separately from the on-disk size: reads past end-of-file zero-fill,
//! and only explicit writes and `set_eof` move the on-disk size.
//! Write-through mode syncs data to stable storage after every write.
//!
//! An injectable error decider can force I/O failures on selected
//! operations, which is how crash-at-any-boundary tests are driven.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{Result, StoreError};

pub const MIN_SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Data,
    Journal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    SetEof,
}

/// Decides whether a given I/O operation should fail with a simulated
/// error. Used by tests to exercise every failure boundary of the
/// journal protocol.
pub trait SimErrDecider {
    fn should_fail(&mut self, role: FileRole, op: IoOp) -> bool;
}

pub type SharedSimErrDecider = Rc<RefCell<dyn SimErrDecider>>;

pub struct StorageFile {
    role: FileRole,
    file: Option<File>,
    full_path: PathBuf,
    old_full_paths: Vec<PathBuf>,
    block_size: usize,
    write_through: bool,
    /// Unaligned reads are permitted only for OS-cached files.
    allow_unaligned_reads: bool,
    file_size: u64,
    decider: Option<SharedSimErrDecider>,
    nr_simulated_io_errs: u64,
}

impl StorageFile {
    pub fn new(role: FileRole) -> StorageFile {
        StorageFile {
            role,
            file: None,
            full_path: PathBuf::new(),
            old_full_paths: Vec::new(),
            block_size: 0,
            write_through: false,
            allow_unaligned_reads: true,
            file_size: 0,
            decider: None,
            nr_simulated_io_errs: 0,
        }
    }

    /// Must be called before `open`; may be called later to change the
    /// block size.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn set_full_path(&mut self, path: &Path) {
        self.full_path = path.to_path_buf();
    }

    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    /// Register a file name used by previous versions; on open, a file
    /// found under exactly one old name (and not the new one) is
    /// renamed.
    pub fn add_old_full_path(&mut self, path: &Path) {
        self.old_full_paths.push(path.to_path_buf());
    }

    pub fn set_sim_err_decider(&mut self, decider: Option<SharedSimErrDecider>) {
        self.decider = decider;
    }

    pub fn nr_simulated_io_errs(&self) -> u64 {
        self.nr_simulated_io_errs
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn is_write_through(&self) -> bool {
        self.write_through
    }

    pub fn open(&mut self, write_through: bool, uncached: bool) -> Result<()> {
        assert!(!self.full_path.as_os_str().is_empty(), "path not set");
        assert!(self.block_size != 0, "block size not set");

        if !self.old_full_paths.is_empty() {
            self.check_old_paths_and_rename()?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.full_path)?;
        self.file_size = file.metadata()?.len();
        self.file = Some(file);
        self.write_through = write_through;
        self.allow_unaligned_reads = !uncached;
        Ok(())
    }

    fn check_old_paths_and_rename(&mut self) -> Result<()> {
        let mut existing: Option<&PathBuf> = None;
        for old in &self.old_full_paths {
            if old.is_file() {
                assert!(
                    existing.is_none(),
                    "storage file exists under more than one old file name"
                );
                existing = Some(old);
            }
        }
        if let Some(old) = existing {
            assert!(
                !self.full_path.is_file(),
                "storage file exists under both an old and a new file name"
            );
            log::info!(
                "renaming storage file {} -> {}",
                old.display(),
                self.full_path.display()
            );
            std::fs::rename(old, &self.full_path)?;
        }
        Ok(())
    }

    fn maybe_fail(&mut self, op: IoOp) -> Result<()> {
        if let Some(decider) = &self.decider {
            if decider.borrow_mut().should_fail(self.role, op) {
                self.nr_simulated_io_errs += 1;
                return Err(StoreError::Io(io::Error::other("simulated i/o error")));
            }
        }
        Ok(())
    }

    fn file(&self) -> &File {
        self.file.as_ref().expect("file not open")
    }

    /// Read whole blocks at a block-aligned offset. Bytes past the
    /// on-disk end read as zero.
    pub fn read_blocks(&mut self, dst: &mut [u8], offset: u64) -> Result<()> {
        assert_eq!(offset % MIN_SECTOR_SIZE, 0);
        assert_eq!(dst.len() % self.block_size, 0);
        self.maybe_fail(IoOp::Read)?;
        self.read_inner(dst, offset)
    }

    /// Read at an arbitrary offset; OS-cached files only.
    pub fn read_bytes_unaligned(&mut self, dst: &mut [u8], offset: u64) -> Result<()> {
        assert!(self.allow_unaligned_reads, "unaligned read on uncached file");
        self.maybe_fail(IoOp::Read)?;
        self.read_inner(dst, offset)
    }

    fn read_inner(&mut self, dst: &mut [u8], offset: u64) -> Result<()> {
        let mut read_total = 0usize;
        if offset < self.file_size {
            let file = self.file();
            while read_total < dst.len() {
                let n = file.read_at(&mut dst[read_total..], offset + read_total as u64)?;
                if n == 0 {
                    break;
                }
                read_total += n;
            }
        }
        dst[read_total..].fill(0);
        Ok(())
    }

    /// Write whole blocks at a block-aligned offset, which must not be
    /// past the current logical size.
    pub fn write_blocks(&mut self, src: &[u8], offset: u64) -> Result<()> {
        assert!(offset <= self.file_size, "write would leave a hole");
        assert_eq!(offset % MIN_SECTOR_SIZE, 0);
        assert_eq!(src.len() % self.block_size, 0);
        self.maybe_fail(IoOp::Write)?;
        self.file().write_all_at(src, offset)?;
        if self.write_through {
            self.file().sync_data()?;
        }
        let end = offset + src.len() as u64;
        if self.file_size < end {
            self.file_size = end;
        }
        Ok(())
    }

    pub fn set_eof(&mut self, offset: u64) -> Result<()> {
        assert_eq!(offset % MIN_SECTOR_SIZE, 0);
        self.maybe_fail(IoOp::SetEof)?;
        self.file().set_len(offset)?;
        if self.write_through {
            self.file().sync_data()?;
        }
        self.file_size = offset;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.maybe_fail(IoOp::Write)?;
        self.file().sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn reads_past_eof_zero_fill() {
        let (_dir, path) = temp_file("zf.dat");
        let mut f = StorageFile::new(FileRole::Data);
        f.set_block_size(512);
        f.set_full_path(&path);
        f.open(false, false).unwrap();

        let block = vec![0xABu8; 512];
        f.write_blocks(&block, 0).unwrap();
        let mut out = vec![0u8; 1024];
        f.read_blocks(&mut out, 0).unwrap();
        assert_eq!(&out[..512], &block[..]);
        assert_eq!(&out[512..], &[0u8; 512][..]);
    }

    #[test]
    fn logical_size_follows_writes_and_eof() {
        let (_dir, path) = temp_file("sz.dat");
        let mut f = StorageFile::new(FileRole::Data);
        f.set_block_size(512);
        f.set_full_path(&path);
        f.open(false, false).unwrap();
        assert_eq!(f.file_size(), 0);

        f.write_blocks(&vec![1u8; 1024], 0).unwrap();
        assert_eq!(f.file_size(), 1024);
        f.set_eof(512).unwrap();
        assert_eq!(f.file_size(), 512);
    }

    #[test]
    fn old_path_is_renamed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("before.dat");
        let new = dir.path().join("after.dat");
        std::fs::write(&old, vec![0u8; 512]).unwrap();

        let mut f = StorageFile::new(FileRole::Data);
        f.set_block_size(512);
        f.set_full_path(&new);
        f.add_old_full_path(&old);
        f.open(false, false).unwrap();
        assert!(new.is_file());
        assert!(!old.exists());
    }
}
