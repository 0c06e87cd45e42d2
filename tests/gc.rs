mod common;

use common::{blocks, file, open_db};
use file_index::{
    FileSet, StopSignal, Vector, KEY_TYPE_BLOCK_LIST, KEY_TYPE_VERSION, LOCAL_DEVICE,
};
use std::sync::Arc;
use test_log::test;

fn count_prefix(db: &file_index::Db, key_type: u8) -> usize {
    let tx = db.backend().new_read_transaction().unwrap();
    tx.iter_prefix(&[key_type]).count()
}

#[test]
fn gc_collects_unreferenced_block_lists() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    // Three files above the indirection cutoff: three block lists
    files.update(
        &LOCAL_DEVICE,
        vec![
            file("a", &[(1, 1)], blocks(100, 1)),
            file("b", &[(1, 1)], blocks(200, 2)),
            file("c", &[(1, 1)], blocks(300, 3)),
        ],
    )?;
    assert_eq!(3, count_prefix(&db, KEY_TYPE_BLOCK_LIST));

    // Mutating every file leaves the old lists behind
    files.update(
        &LOCAL_DEVICE,
        vec![
            file("a", &[(1, 2)], blocks(100, 4)),
            file("b", &[(1, 2)], blocks(200, 5)),
            file("c", &[(1, 2)], blocks(300, 6)),
        ],
    )?;
    assert_eq!(6, count_prefix(&db, KEY_TYPE_BLOCK_LIST));

    let stats = db.gc_indirect(&StopSignal::default())?;
    assert!(stats.completed);
    assert_eq!(3, stats.block_lists_kept);
    assert_eq!(3, stats.block_lists_removed);
    assert_eq!(3, count_prefix(&db, KEY_TYPE_BLOCK_LIST));

    // Records still read back with their full block lists
    for (name, count) in [("a", 100), ("b", 200), ("c", 300)] {
        let stored = files.get(&LOCAL_DEVICE, name)?.unwrap();
        assert_eq!(count, stored.blocks.len(), "{name}");
        assert_eq!(Vector::with(&[(1, 2)]), stored.version);
    }

    Ok(())
}

#[test]
fn gc_collects_unreferenced_version_vectors() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    // Wider than the version indirection cutoff of two counters
    files.update(
        &LOCAL_DEVICE,
        vec![file("a", &[(1, 1), (2, 1), (3, 1)], vec![])],
    )?;
    assert_eq!(1, count_prefix(&db, KEY_TYPE_VERSION));

    files.update(
        &LOCAL_DEVICE,
        vec![file("a", &[(1, 2), (2, 1), (3, 1)], vec![])],
    )?;
    assert_eq!(2, count_prefix(&db, KEY_TYPE_VERSION));

    let stats = db.gc_indirect(&StopSignal::default())?;
    assert!(stats.completed);
    assert_eq!(1, stats.versions_kept);
    assert_eq!(1, stats.versions_removed);

    let stored = files.get(&LOCAL_DEVICE, "a")?.unwrap();
    assert_eq!(Vector::with(&[(1, 2), (2, 1), (3, 1)]), stored.version);

    Ok(())
}

#[test]
fn shared_block_lists_are_deduplicated_and_survive() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    // Two files with identical content share one block list
    files.update(
        &LOCAL_DEVICE,
        vec![
            file("one", &[(1, 1)], blocks(100, 1)),
            file("two", &[(1, 1)], blocks(100, 1)),
        ],
    )?;
    assert_eq!(1, count_prefix(&db, KEY_TYPE_BLOCK_LIST));

    // Rewriting one of them must keep the list the other still uses
    files.update(&LOCAL_DEVICE, vec![file("one", &[(1, 2)], blocks(100, 2))])?;

    let stats = db.gc_indirect(&StopSignal::default())?;
    assert_eq!(2, stats.block_lists_kept);
    assert_eq!(0, stats.block_lists_removed);

    assert_eq!(100, files.get(&LOCAL_DEVICE, "two")?.unwrap().blocks.len());

    Ok(())
}

#[test]
fn cancelled_gc_is_safe() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    files.update(&LOCAL_DEVICE, vec![file("a", &[(1, 1)], blocks(100, 1))])?;
    files.update(&LOCAL_DEVICE, vec![file("a", &[(1, 2)], blocks(100, 2))])?;

    let signal = StopSignal::default();
    signal.send("shutting down");
    assert_eq!(Some("shutting down"), signal.reason());

    let stats = db.gc_indirect(&signal)?;
    assert!(!stats.completed);

    // Nothing live was deleted; reads still work
    assert_eq!(100, files.get(&LOCAL_DEVICE, "a")?.unwrap().blocks.len());

    // A later full run still collects the garbage
    let stats = db.gc_indirect(&StopSignal::default())?;
    assert!(stats.completed);
    assert_eq!(1, stats.block_lists_removed);

    Ok(())
}
