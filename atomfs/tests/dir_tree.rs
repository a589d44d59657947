//! Directory tree behavior over the in-memory store, at a block size
//! small enough to force multi-level trees.

use atomfs::{Afs, AfsError, AfsStorage, DirEntry, MemStore, ObjId, ObjType};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

const BLOCK_SIZE: u32 = 160;

fn fresh_fs() -> Afs<MemStore> {
    let mut afs = Afs::new(MemStore::new(BLOCK_SIZE, u64::MAX));
    afs.init(b"", 1).unwrap();
    afs
}

fn enumerate_all(afs: &mut Afs<MemStore>, dir: ObjId) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut last = Vec::new();
    loop {
        let before = entries.len();
        let reached_end = afs.dir_read(dir, &last, &mut entries).unwrap();
        if let Some(e) = entries.last() {
            last = e.name.clone();
        }
        if reached_end {
            return entries;
        }
        assert!(entries.len() > before, "enumeration must make progress");
    }
}

fn assert_sorted_unique(entries: &[DirEntry]) {
    for pair in entries.windows(2) {
        assert!(pair[0].name < pair[1].name, "names out of order");
    }
}

#[test]
fn create_find_delete_single() {
    let mut afs = fresh_fs();
    let id = afs.dir_create(ObjId::ROOT, b"home", b"m", 10).unwrap();
    assert!(id.unique_id >= 2);

    let found = afs.find_name_in_dir(ObjId::ROOT, b"home").unwrap();
    assert_eq!(found.id, id);
    assert_eq!(found.obj_type, ObjType::Dir);

    assert_eq!(
        afs.find_name_in_dir(ObjId::ROOT, b"nope").unwrap_err(),
        AfsError::NameNotInDir
    );
    assert_eq!(
        afs.dir_create(ObjId::ROOT, b"home", b"", 11).unwrap_err(),
        AfsError::NameExists
    );

    afs.obj_delete(ObjId::ROOT, b"home", 12).unwrap();
    assert_eq!(
        afs.find_name_in_dir(ObjId::ROOT, b"home").unwrap_err(),
        AfsError::NameNotInDir
    );
}

#[test]
fn name_and_meta_limits() {
    let mut afs = fresh_fs();
    let max_name = afs.max_name_bytes() as usize;
    let max_meta = afs.max_meta_bytes() as usize;

    let long_name = vec![b'x'; max_name + 1];
    assert_eq!(
        afs.dir_create(ObjId::ROOT, &long_name, b"", 1).unwrap_err(),
        AfsError::NameTooLong
    );
    assert_eq!(afs.check_name(&long_name), Err(AfsError::NameTooLong));
    assert_eq!(afs.check_name(b""), Err(AfsError::NameInvalid));
    assert_eq!(afs.check_name(b"."), Err(AfsError::NameInvalid));
    assert_eq!(afs.check_name(b"a/b"), Err(AfsError::NameInvalid));
    assert_eq!(afs.check_name(b"ok"), Ok(()));

    let long_meta = vec![0u8; max_meta + 1];
    assert_eq!(
        afs.dir_create(ObjId::ROOT, b"d", &long_meta, 1).unwrap_err(),
        AfsError::MetaDataTooLong
    );

    // the maxima themselves are accepted
    let name = vec![b'n'; max_name];
    let meta = vec![7u8; max_meta];
    afs.dir_create(ObjId::ROOT, &name, &meta, 1).unwrap();
}

#[test]
fn many_names_stay_ordered_through_interleaved_deletion() {
    let mut afs = fresh_fs();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut names: Vec<Vec<u8>> = (0..300)
        .map(|i| {
            // uneven lengths exercise byte-based splits and first-name
            // growth on deletion
            let pad = (i * 7) % 23;
            let mut n = format!("n{:03}", i).into_bytes();
            n.extend(std::iter::repeat_n(b'p', pad));
            n
        })
        .collect();
    names.shuffle(&mut rng);

    for (i, name) in names.iter().enumerate() {
        afs.dir_create(ObjId::ROOT, name, b"", i as u64).unwrap();
    }

    let entries = enumerate_all(&mut afs, ObjId::ROOT);
    assert_eq!(entries.len(), names.len());
    assert_sorted_unique(&entries);

    let stat = afs.obj_stat(ObjId::ROOT).unwrap();
    assert_eq!(stat.dir_nr_entries, names.len() as u64);

    // delete every other name in shuffled order, re-checking invariants
    // along the way
    let mut to_delete: Vec<Vec<u8>> = names.iter().step_by(2).cloned().collect();
    to_delete.shuffle(&mut rng);
    for (i, name) in to_delete.iter().enumerate() {
        afs.obj_delete(ObjId::ROOT, name, 1000 + i as u64).unwrap();
        if i % 25 == 0 {
            let entries = enumerate_all(&mut afs, ObjId::ROOT);
            assert_sorted_unique(&entries);
            afs.verify_free_list().unwrap();
        }
    }

    let entries = enumerate_all(&mut afs, ObjId::ROOT);
    assert_eq!(entries.len(), names.len() - to_delete.len());
    assert_sorted_unique(&entries);
    afs.verify_free_list().unwrap();

    let stat = afs.obj_stat(ObjId::ROOT).unwrap();
    assert_eq!(stat.dir_nr_entries, entries.len() as u64);
}

#[test]
fn deleting_everything_returns_all_blocks_to_the_free_list() {
    let mut afs = fresh_fs();
    for i in 0..200u32 {
        let name = format!("entry{:04}", i).into_bytes();
        afs.dir_create(ObjId::ROOT, &name, b"", i as u64).unwrap();
    }
    for i in 0..200u32 {
        let name = format!("entry{:04}", i).into_bytes();
        afs.obj_delete(ObjId::ROOT, &name, 500 + i as u64).unwrap();
    }

    let free = afs.verify_free_list().unwrap();
    assert_eq!(free, afs.free_space_blocks().unwrap());

    // the tree is back to an empty top node: every block except the
    // master, the root top node, and the free-list chain itself is on
    // the free list
    let store = afs.into_storage();
    let mut chain_blocks = 0u64;
    {
        // count free-list chain nodes by walking the master block
        let master = store.committed_block(0);
        let mut tail = u64::from_le_bytes(master[16..24].try_into().unwrap());
        while tail != u64::MAX {
            chain_blocks += 1;
            let node = store.committed_block(tail);
            tail = u64::from_le_bytes(node[8..16].try_into().unwrap());
        }
    }
    assert_eq!(store.nr_blocks(), 2 + free + chain_blocks);
}

#[test]
fn reclaimed_blocks_are_reused() {
    let mut afs = fresh_fs();
    for name in [b"a", b"b", b"c"] {
        afs.dir_create(ObjId::ROOT, name, b"", 1).unwrap();
    }
    afs.verify_free_list().unwrap();
    for name in [b"a", b"b", b"c"] {
        afs.obj_delete(ObjId::ROOT, name, 2).unwrap();
    }
    // the first freed block became the chain tail; the other two are
    // recorded as free indices
    assert_eq!(afs.free_space_blocks().unwrap(), 2);

    afs.dir_create(ObjId::ROOT, b"d", b"", 3).unwrap();
    assert_eq!(afs.free_space_blocks().unwrap(), 1);
    afs.verify_free_list().unwrap();
}

#[test]
fn unique_ids_are_strictly_monotonic_even_with_index_reuse() {
    let mut afs = fresh_fs();
    let a = afs.dir_create(ObjId::ROOT, b"a", b"", 1).unwrap();
    afs.obj_delete(ObjId::ROOT, b"a", 2).unwrap();
    let b = afs.dir_create(ObjId::ROOT, b"b", b"", 3).unwrap();
    assert!(b.unique_id > a.unique_id);
    assert_eq!(b.index, a.index, "top-node block index is reused");

    // the stale id never resolves to the new object
    assert_eq!(afs.obj_stat(a).unwrap_err(), AfsError::ObjNotFound);
}

#[test]
fn dir_read_resumes_and_terminates() {
    let mut afs = fresh_fs();
    for i in 0..40u32 {
        let name = format!("f{:02}", i).into_bytes();
        afs.dir_create(ObjId::ROOT, &name, b"", 1).unwrap();
    }
    // resuming from a deleted name continues at its successor
    afs.obj_delete(ObjId::ROOT, b"f20", 2).unwrap();
    let mut entries = Vec::new();
    afs.dir_read(ObjId::ROOT, b"f20", &mut entries).unwrap();
    assert!(!entries.is_empty());
    assert_eq!(entries[0].name, b"f21");

    // an empty directory reads as immediately finished
    let d = afs.dir_create(ObjId::ROOT, b"zz-empty", b"", 3).unwrap();
    let mut entries = Vec::new();
    assert!(afs.dir_read(d, b"", &mut entries).unwrap());
    assert!(entries.is_empty());
}

#[test]
fn move_renames_and_reparents() {
    let mut afs = fresh_fs();
    let a = afs.dir_create(ObjId::ROOT, b"a", b"", 1).unwrap();
    let b = afs.dir_create(ObjId::ROOT, b"b", b"", 1).unwrap();
    let x = afs.dir_create(a, b"x", b"", 2).unwrap();

    // rename within a directory
    afs.obj_move(a, b"x", a, b"y", 3).unwrap();
    assert_eq!(afs.find_name_in_dir(a, b"y").unwrap().id, x);

    // move across directories
    afs.obj_move(a, b"y", b, b"x2", 4).unwrap();
    assert_eq!(
        afs.find_name_in_dir(a, b"y").unwrap_err(),
        AfsError::NameNotInDir
    );
    assert_eq!(afs.find_name_in_dir(b, b"x2").unwrap().id, x);
    assert_eq!(afs.obj_stat(x).unwrap().parent_id, b);

    // destination name collisions are rejected
    afs.dir_create(b, b"taken", b"", 5).unwrap();
    assert_eq!(
        afs.obj_move(b, b"x2", b, b"taken", 6).unwrap_err(),
        AfsError::NameExists
    );
}

#[test]
fn move_rejects_cycles() {
    let mut afs = fresh_fs();
    let a = afs.dir_create(ObjId::ROOT, b"a", b"", 1).unwrap();
    let b = afs.dir_create(a, b"b", b"", 1).unwrap();
    let c = afs.dir_create(b, b"c", b"", 1).unwrap();

    // moving a under its grandchild c would create a cycle
    assert_eq!(
        afs.obj_move(ObjId::ROOT, b"a", c, b"a", 2).unwrap_err(),
        AfsError::MoveDestInvalid
    );
    // moving a into itself as well
    assert_eq!(
        afs.obj_move(ObjId::ROOT, b"a", a, b"a", 3).unwrap_err(),
        AfsError::MoveDestInvalid
    );
    // a sibling move of a leaf dir is fine
    afs.obj_move(b, b"c", a, b"c", 4).unwrap();
}

#[test]
fn delete_requires_empty_dir() {
    let mut afs = fresh_fs();
    let a = afs.dir_create(ObjId::ROOT, b"a", b"", 1).unwrap();
    afs.dir_create(a, b"child", b"", 2).unwrap();
    assert_eq!(
        afs.obj_delete(ObjId::ROOT, b"a", 3).unwrap_err(),
        AfsError::DirNotEmpty
    );
    afs.obj_delete(a, b"child", 4).unwrap();
    afs.obj_delete(ObjId::ROOT, b"a", 5).unwrap();
}

#[test]
fn crack_path_walks_and_reports_partial_results() {
    let mut afs = fresh_fs();
    let a = afs.dir_create(ObjId::ROOT, b"a", b"", 1).unwrap();
    let bdir = afs.dir_create(a, b"b", b"", 1).unwrap();
    afs.file_create(bdir, b"f.txt", b"", 2).unwrap();

    let mut entries = Vec::new();
    afs.crack_path(b"/", &mut entries).unwrap();
    assert!(entries.is_empty());

    afs.crack_path(b"/a/b/f.txt", &mut entries).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].name, b"a");
    assert_eq!(entries[2].obj_type, ObjType::File);

    // trailing slash is ignored
    let mut entries = Vec::new();
    afs.crack_path(b"/a/b/", &mut entries).unwrap();
    assert_eq!(entries.len(), 2);

    // lookup failure leaves the walked prefix behind
    let mut entries = Vec::new();
    let err = afs.crack_path(b"/a/missing/x", &mut entries).unwrap_err();
    assert_eq!(err, AfsError::NameNotInDir);
    assert_eq!(entries.len(), 1);

    // a file in the middle of the path is ObjNotDir
    let mut entries = Vec::new();
    let err = afs.crack_path(b"/a/b/f.txt/deeper", &mut entries).unwrap_err();
    assert_eq!(err, AfsError::ObjNotDir);
    assert_eq!(entries.len(), 3);

    assert_eq!(
        afs.crack_path(b"a/b", &mut Vec::new()).unwrap_err(),
        AfsError::InvalidPathSyntax
    );
    assert_eq!(
        afs.crack_path(b"/a//b", &mut Vec::new()).unwrap_err(),
        AfsError::InvalidPathSyntax
    );
}

#[test]
fn set_stat_updates_selected_fields_only() {
    use atomfs::StatFields;

    let mut afs = fresh_fs();
    let a = afs.dir_create(ObjId::ROOT, b"a", b"abcd", 100).unwrap();

    let mut info = afs.obj_stat(a).unwrap();
    assert_eq!(info.create_time, 100);
    assert_eq!(info.meta_data, b"abcd");

    info.create_time = 5;
    info.modify_time = 6;
    info.meta_data = b"wxyz".to_vec();
    afs.obj_set_stat(a, &info, StatFields::CREATE_TIME | StatFields::META_DATA)
        .unwrap();

    let after = afs.obj_stat(a).unwrap();
    assert_eq!(after.create_time, 5);
    assert_eq!(after.modify_time, 100, "modify time not selected");
    assert_eq!(after.meta_data, b"wxyz");

    // metadata length is fixed
    let mut bad = after.clone();
    bad.meta_data = b"toolong".to_vec();
    assert_eq!(
        afs.obj_set_stat(a, &bad, StatFields::META_DATA).unwrap_err(),
        AfsError::MetaDataCannotChangeLen
    );
}

#[test]
fn custom_name_comparer_controls_ordering() {
    fn case_insensitive(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        let la = a.iter().map(|c| c.to_ascii_lowercase());
        let lb = b.iter().map(|c| c.to_ascii_lowercase());
        la.cmp(lb)
    }

    let mut afs = Afs::new(MemStore::new(BLOCK_SIZE, u64::MAX));
    afs.set_name_comparer(case_insensitive);
    afs.init(b"", 1).unwrap();

    afs.dir_create(ObjId::ROOT, b"Hello", b"", 1).unwrap();
    assert_eq!(
        afs.dir_create(ObjId::ROOT, b"hello", b"", 2).unwrap_err(),
        AfsError::NameExists
    );
    assert!(afs.find_name_in_dir(ObjId::ROOT, b"HELLO").is_ok());
}

#[test]
fn out_of_space_surfaces_and_aborts_cleanly() {
    let mut afs = Afs::new(MemStore::new(BLOCK_SIZE, 8));
    afs.init(b"", 1).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let mut created = 0u32;
    loop {
        let name: Vec<u8> = (0..8).map(|_| rng.gen_range(b'a'..=b'z')).collect();
        match afs.dir_create(ObjId::ROOT, &name, b"", 1) {
            Ok(_) => created += 1,
            Err(AfsError::NameExists) => continue,
            Err(AfsError::OutOfSpace) => break,
            Err(e) => panic!("unexpected error: {:?}", e),
        }
        assert!(created < 1000, "store never filled up");
    }
    // the failed create left the directory consistent
    let entries = enumerate_all(&mut afs, ObjId::ROOT);
    assert_eq!(entries.len(), created as usize);
    assert_sorted_unique(&entries);
}
