//! End-to-end scenarios over the file-backed store: durability across
//! reopen, crash-equivalent fault injection on both sides of the journal
//! write, idempotent replay, and consistency levels.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use atomfs::{Afs, AfsError, AfsStorage, ObjId};
use atomfs_store::{Consistency, FileRole, FileStore, IoOp, SimErrDecider};

const BLOCK_SIZE: u32 = 4096;

/// Test fault plan: fail data-file writes while armed, and/or fail the
/// next journal-file write once.
#[derive(Default)]
struct FaultPlan {
    fail_data_writes: bool,
    fail_next_journal_write: bool,
}

impl SimErrDecider for FaultPlan {
    fn should_fail(&mut self, role: FileRole, op: IoOp) -> bool {
        match (role, op) {
            (FileRole::Data, IoOp::Write) => self.fail_data_writes,
            (FileRole::Journal, IoOp::Write) => {
                if self.fail_next_journal_write {
                    self.fail_next_journal_write = false;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

fn open_fs(path: &Path, consistency: Consistency) -> Afs<FileStore> {
    let store = FileStore::open(path, BLOCK_SIZE, consistency).unwrap();
    let mut afs = Afs::new(store);
    afs.init(b"", 1).unwrap();
    afs
}

fn read_to_vec(afs: &mut Afs<FileStore>, id: ObjId, offset: u64, n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut end_seen = false;
    afs.file_read(id, offset, n, |chunk, reached_end| {
        out.extend_from_slice(chunk);
        end_seen = reached_end;
    })
    .unwrap();
    assert!(end_seen);
    out
}

#[test]
fn journal_file_sits_next_to_data_file() {
    assert_eq!(
        FileStore::journal_file_path(Path::new("/tmp/x/store.dat")),
        Path::new("/tmp/x/store.jnl")
    );
    assert_eq!(
        FileStore::journal_file_path(Path::new("store")),
        Path::new("store.jnl")
    );
}

#[test]
fn create_reopen_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");

    let f = {
        let mut afs = open_fs(&path, Consistency::Journal);
        let d = afs.dir_create(ObjId::ROOT, b"a", b"", 10).unwrap();
        let f = afs.file_create(d, b"hello.txt", b"", 11).unwrap();
        afs.file_write(f, 0, b"Hello, world!", 12).unwrap();
        f
    };

    let mut afs = open_fs(&path, Consistency::Journal);
    let mut entries = Vec::new();
    afs.crack_path(b"/a/hello.txt", &mut entries).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].id, f);
    assert_eq!(read_to_vec(&mut afs, f, 0, 13), b"Hello, world!");
}

#[test]
fn large_content_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");

    let content: Vec<u8> = (0..10 * BLOCK_SIZE as usize + 99)
        .map(|i| (i * 31 % 256) as u8)
        .collect();
    let f = {
        let mut afs = open_fs(&path, Consistency::Journal);
        let f = afs.file_create(ObjId::ROOT, b"blob", b"", 1).unwrap();
        afs.file_write(f, 0, &content, 2).unwrap();
        f
    };

    let mut afs = open_fs(&path, Consistency::Journal);
    assert_eq!(read_to_vec(&mut afs, f, 0, content.len()), content);
    afs.verify_free_list().unwrap();
}

#[test]
fn crash_after_journal_write_commits_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");
    let plan = Rc::new(RefCell::new(FaultPlan::default()));

    {
        let mut store = FileStore::open(&path, BLOCK_SIZE, Consistency::Journal).unwrap();
        store.set_sim_err_decider(Some(plan.clone()));
        let mut afs = Afs::new(store);
        afs.init(b"", 1).unwrap();
        afs.dir_create(ObjId::ROOT, b"before", b"", 2).unwrap();

        // the journal record lands on disk, the apply phase dies
        plan.borrow_mut().fail_data_writes = true;
        afs.dir_create(ObjId::ROOT, b"under-fault", b"", 3).unwrap();
        // process "dies" here: the store is dropped without recovering
    }

    let mut afs = open_fs(&path, Consistency::Journal);
    assert!(afs.find_name_in_dir(ObjId::ROOT, b"before").is_ok());
    assert!(
        afs.find_name_in_dir(ObjId::ROOT, b"under-fault").is_ok(),
        "a journaled transaction is committed once the record is durable"
    );
    afs.verify_free_list().unwrap();
}

#[test]
fn crash_before_journal_write_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");
    let plan = Rc::new(RefCell::new(FaultPlan::default()));

    {
        let mut store = FileStore::open(&path, BLOCK_SIZE, Consistency::Journal).unwrap();
        store.set_sim_err_decider(Some(plan.clone()));
        let mut afs = Afs::new(store);
        afs.init(b"", 1).unwrap();
        afs.dir_create(ObjId::ROOT, b"before", b"", 2).unwrap();

        plan.borrow_mut().fail_next_journal_write = true;
        assert_eq!(
            afs.dir_create(ObjId::ROOT, b"never", b"", 3).unwrap_err(),
            AfsError::StorageInErrorState
        );
    }

    let mut afs = open_fs(&path, Consistency::Journal);
    assert!(afs.find_name_in_dir(ObjId::ROOT, b"before").is_ok());
    assert_eq!(
        afs.find_name_in_dir(ObjId::ROOT, b"never").unwrap_err(),
        AfsError::NameNotInDir
    );
}

#[test]
fn journal_replay_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");
    let journal_path = FileStore::journal_file_path(&path);
    let plan = Rc::new(RefCell::new(FaultPlan::default()));

    {
        let mut store = FileStore::open(&path, BLOCK_SIZE, Consistency::Journal).unwrap();
        store.set_sim_err_decider(Some(plan.clone()));
        let mut afs = Afs::new(store);
        afs.init(b"", 1).unwrap();
        plan.borrow_mut().fail_data_writes = true;
        afs.dir_create(ObjId::ROOT, b"replayed", b"", 2).unwrap();
    }
    let saved_journal = std::fs::read(&journal_path).unwrap();
    assert!(!saved_journal.is_empty());

    // first replay
    drop(open_fs(&path, Consistency::Journal));
    let data_after_once = std::fs::read(&path).unwrap();

    // put the already-applied record back and replay it again
    std::fs::write(&journal_path, &saved_journal).unwrap();
    drop(open_fs(&path, Consistency::Journal));
    let data_after_twice = std::fs::read(&path).unwrap();

    assert_eq!(data_after_once, data_after_twice);

    let mut afs = open_fs(&path, Consistency::Journal);
    assert!(afs.find_name_in_dir(ObjId::ROOT, b"replayed").is_ok());
}

#[test]
fn corrupt_journal_record_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");
    let journal_path = FileStore::journal_file_path(&path);

    {
        let mut afs = open_fs(&path, Consistency::Journal);
        afs.dir_create(ObjId::ROOT, b"kept", b"", 2).unwrap();
    }

    // a record that never made it fully to disk parses as garbage
    std::fs::write(&journal_path, vec![0xFFu8; BLOCK_SIZE as usize]).unwrap();

    let mut afs = open_fs(&path, Consistency::Journal);
    assert!(afs.find_name_in_dir(ObjId::ROOT, b"kept").is_ok());
    // and the bad record was truncated away
    assert!(std::fs::metadata(&journal_path).unwrap().len() <= BLOCK_SIZE as u64);
}

#[test]
fn no_flush_mode_skips_the_journal_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");
    let journal_path = FileStore::journal_file_path(&path);

    {
        let mut afs = open_fs(&path, Consistency::NoFlush);
        afs.dir_create(ObjId::ROOT, b"a", b"", 2).unwrap();
    }
    assert!(!journal_path.exists());

    let mut afs = open_fs(&path, Consistency::NoFlush);
    assert!(afs.find_name_in_dir(ObjId::ROOT, b"a").is_ok());
}

#[test]
fn verify_journal_mode_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");

    let f = {
        let mut afs = open_fs(&path, Consistency::VerifyJournal);
        let f = afs.file_create(ObjId::ROOT, b"f", b"", 1).unwrap();
        afs.file_write(f, 0, &vec![7u8; 2 * BLOCK_SIZE as usize], 2)
            .unwrap();
        f
    };

    let mut afs = open_fs(&path, Consistency::VerifyJournal);
    let data = read_to_vec(&mut afs, f, 0, 2 * BLOCK_SIZE as usize);
    assert!(data.iter().all(|&b| b == 7));
}

#[test]
fn max_size_limits_growth() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");

    let mut store = FileStore::open(&path, BLOCK_SIZE, Consistency::Journal).unwrap();
    store.set_max_size_bytes(MIN_HEADER + 6 * BLOCK_SIZE as u64);
    let mut afs = Afs::new(store);
    afs.init(b"", 1).unwrap();

    let f = afs.file_create(ObjId::ROOT, b"f", b"", 2).unwrap();
    let err = afs
        .file_set_size(f, 100 * BLOCK_SIZE as u64, 3)
        .unwrap_err();
    assert_eq!(err, AfsError::OutOfSpace);
    // the committed prefix survives and the store stays usable
    let stat = afs.obj_stat(f).unwrap();
    assert!(stat.file_size_bytes < 100 * BLOCK_SIZE as u64);
}

const MIN_HEADER: u64 = BLOCK_SIZE as u64;

#[test]
fn storage_level_block_round_trip_and_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");

    {
        let mut store = FileStore::open(&path, BLOCK_SIZE, Consistency::Journal).unwrap();
        store.begin_journaled_write().unwrap();
        let block = store.add_new_block().unwrap();
        block.put_u64(0, 0xDEAD_BEEF);
        store.complete_journaled_write(&[block]).unwrap();

        // served from cache after commit
        let hits_before = store.nr_cache_hits();
        let again = store.obtain_block(0).unwrap();
        assert_eq!(again.get_u64(0), 0xDEAD_BEEF);
        assert_eq!(store.nr_cache_hits(), hits_before + 1);
    }

    let mut store = FileStore::open(&path, BLOCK_SIZE, Consistency::Journal).unwrap();
    assert_eq!(store.nr_blocks(), 1);
    let block = store.obtain_block(0).unwrap();
    assert_eq!(block.get_u64(0), 0xDEAD_BEEF);
    assert!(store.obtain_block(1).is_err());
}

#[test]
fn aborted_write_discards_new_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");

    let mut store = FileStore::open(&path, BLOCK_SIZE, Consistency::Journal).unwrap();
    store.begin_journaled_write().unwrap();
    let block = store.add_new_block().unwrap();
    block.put_u64(0, 1);
    assert_eq!(store.nr_blocks(), 1);
    store.abort_journaled_write();
    assert_eq!(store.nr_blocks(), 0);
}

#[test]
fn wrong_signature_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");
    std::fs::write(&path, vec![0x42u8; 2 * BLOCK_SIZE as usize]).unwrap();
    assert!(FileStore::open(&path, BLOCK_SIZE, Consistency::Journal).is_err());
}

#[test]
fn odd_create_block_size_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.dat");
    assert!(FileStore::open(&path, 1000, Consistency::Journal).is_err());
    assert!(FileStore::open(&path, 0, Consistency::Journal).is_err());
}
