mod common;

use common::{block, blocks, deleted_file, device, file, open_db};
use file_index::{
    BlockFinder, FileItem, FileSet, Vector, KEY_TYPE_BLOCK, KEY_TYPE_DEVICE, KEY_TYPE_GLOBAL,
    KEY_TYPE_NEED, KEY_TYPE_SEQUENCE, LOCAL_DEVICE,
};
use std::sync::Arc;
use test_log::test;

#[test]
fn basic_local_add() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    files.update(
        &LOCAL_DEVICE,
        vec![file("a", &[(1, 1)], vec![block(1), block(2)])],
    )?;

    // The record is stored and sequenced
    let stored = files.get(&LOCAL_DEVICE, "a")?.unwrap();
    assert_eq!(1, stored.sequence);
    assert_eq!(2, stored.blocks.len());
    assert_eq!(1, files.sequence(&LOCAL_DEVICE));

    // It is the global winner and nothing is needed
    let global = files.get_global("a")?.unwrap();
    assert_eq!(stored.version, global.version);
    assert_eq!(vec![LOCAL_DEVICE], files.availability("a")?);
    assert_eq!(0, files.need_size(&LOCAL_DEVICE));

    let mut needed = vec![];
    files.with_need(&LOCAL_DEVICE, |f| {
        needed.push(f.name.clone());
        true
    })?;
    assert!(needed.is_empty());

    // The sequence index delivers it in order
    let mut sequenced = vec![];
    files.with_have_sequence(1, |f| {
        sequenced.push((f.sequence, f.name.clone()));
        true
    })?;
    assert_eq!(vec![(1, "a".to_owned())], sequenced);

    // Block entries exist for both blocks, at their indexes
    let finder = BlockFinder::new(Arc::clone(&db));
    for (seed, index) in [(1u8, 0u32), (2, 1)] {
        let mut found = None;
        finder.iterate(&["default"], &block(seed).hash, |folder, name, idx| {
            found = Some((folder.to_owned(), name.to_owned(), idx));
            true
        })?;
        assert_eq!(Some(("default".to_owned(), "a".to_owned(), index)), found);
    }

    // Counts agree
    let counts = files.local_size();
    assert_eq!(1, counts.files);
    assert_eq!(256 * 1_024, counts.bytes);
    assert_eq!(counts.files, files.global_size().files);

    Ok(())
}

#[test]
fn remote_beats_local() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    files.update(&LOCAL_DEVICE, vec![file("a", &[(1, 1)], vec![block(1)])])?;
    files.update(&remote, vec![file("a", &[(1, 2)], vec![block(9)])])?;

    // The remote version dominates and becomes the global
    let global = files.get_global("a")?.unwrap();
    assert_eq!(Vector::with(&[(1, 2)]), global.version);
    assert_eq!(vec![remote], files.availability("a")?);

    // The local device now needs the file
    assert_eq!(1, files.need_size(&LOCAL_DEVICE));
    assert_eq!(0, files.need_size(&remote));

    let mut needed = vec![];
    files.with_need(&LOCAL_DEVICE, |f| {
        needed.push((f.name.clone(), f.version.clone()));
        true
    })?;
    assert_eq!(vec![("a".to_owned(), Vector::with(&[(1, 2)]))], needed);

    // Catching up clears the need
    files.update(&LOCAL_DEVICE, vec![file("a", &[(1, 2)], vec![block(9)])])?;
    assert_eq!(0, files.need_size(&LOCAL_DEVICE));

    let mut needed = 0;
    files.with_need(&LOCAL_DEVICE, |_| {
        needed += 1;
        true
    })?;
    assert_eq!(0, needed);

    Ok(())
}

#[test]
fn update_is_idempotent() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    let f = file("a", &[(1, 1)], vec![block(1)]);
    files.update(&LOCAL_DEVICE, vec![f.clone()])?;
    files.update(&LOCAL_DEVICE, vec![f])?;

    // The unchanged record was skipped: same sequence, same counts
    assert_eq!(1, files.get(&LOCAL_DEVICE, "a")?.unwrap().sequence);
    assert_eq!(1, files.sequence(&LOCAL_DEVICE));
    assert_eq!(1, files.local_size().files);
    assert_eq!(1, files.global_size().files);

    Ok(())
}

#[test]
fn last_write_wins_within_batch() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    files.update(
        &LOCAL_DEVICE,
        vec![
            file("a", &[(1, 1)], vec![block(1)]),
            file("b", &[(1, 1)], vec![block(2)]),
            file("a", &[(1, 2)], vec![block(3)]),
        ],
    )?;

    let stored = files.get(&LOCAL_DEVICE, "a")?.unwrap();
    assert_eq!(Vector::with(&[(1, 2)]), stored.version);
    assert_eq!(vec![block(3)], stored.blocks);
    assert_eq!(2, files.local_size().files);

    Ok(())
}

#[test]
fn unusable_names_are_dropped() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    files.update(
        &LOCAL_DEVICE,
        vec![
            file("", &[(1, 1)], vec![]),
            file(".", &[(1, 1)], vec![]),
            file("/etc/passwd", &[(1, 1)], vec![]),
            file("ok", &[(1, 1)], vec![]),
        ],
    )?;

    assert_eq!(1, files.local_size().total());
    assert!(files.get(&LOCAL_DEVICE, "ok")?.is_some());

    Ok(())
}

#[test]
fn prefixed_iteration() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    files.update(
        &LOCAL_DEVICE,
        vec![
            file("foo", &[(1, 1)], vec![]),
            file("foo/bar", &[(1, 1)], vec![]),
            file("foo/baz", &[(1, 1)], vec![]),
            file("foobar", &[(1, 1)], vec![]),
        ],
    )?;

    // The exact match comes first, then the subtree; siblings that merely
    // share a byte prefix stay out
    let mut seen = vec![];
    files.with_have(&LOCAL_DEVICE, "foo", |f| {
        seen.push(f.name.clone());
        true
    })?;
    assert_eq!(vec!["foo", "foo/bar", "foo/baz"], seen);

    // Unrestricted iteration sees everything in name order
    let mut seen = vec![];
    files.with_have_truncated(&LOCAL_DEVICE, "", |f| {
        seen.push(f.name.clone());
        true
    })?;
    assert_eq!(vec!["foo", "foo/bar", "foo/baz", "foobar"], seen);

    // Cooperative cancellation stops the scan
    let mut seen = 0;
    files.with_have(&LOCAL_DEVICE, "", |_| {
        seen += 1;
        false
    })?;
    assert_eq!(1, seen);

    Ok(())
}

#[test]
fn global_iteration_prefers_winners() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    files.update(&LOCAL_DEVICE, vec![file("a", &[(1, 1)], vec![block(1)])])?;
    files.update(&remote, vec![file("a", &[(1, 2)], vec![block(2)])])?;
    files.update(&remote, vec![file("b", &[(1, 1)], vec![block(3)])])?;

    let mut seen = vec![];
    files.with_global("", |f| {
        seen.push((f.name.clone(), f.version.clone()));
        true
    })?;
    assert_eq!(
        vec![
            ("a".to_owned(), Vector::with(&[(1, 2)])),
            ("b".to_owned(), Vector::with(&[(1, 1)])),
        ],
        seen
    );

    // The truncated view carries no block list
    files.with_global_truncated("", |f| {
        assert!(f.version.counters().len() <= 2);
        true
    })?;

    Ok(())
}

#[test]
fn remote_need_is_computed_from_globals() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    // The remote announces an old version of "a" and nothing else;
    // locally we have "a" (newer) and "b"
    files.update(&remote, vec![file("a", &[(1, 1)], vec![block(1)])])?;
    files.update(
        &LOCAL_DEVICE,
        vec![
            file("a", &[(1, 1), (2, 1)], vec![block(2)]),
            file("b", &[(2, 1)], vec![block(3)]),
        ],
    )?;

    let mut needed = vec![];
    files.with_need(&remote, |f| {
        needed.push(f.name.clone());
        true
    })?;
    assert_eq!(vec!["a", "b"], needed);

    Ok(())
}

#[test]
fn deleted_global_is_not_needed_without_local_copy() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    files.update(&remote, vec![deleted_file("gone", &[(1, 2)])])?;

    assert_eq!(0, files.need_size(&LOCAL_DEVICE));

    // But with a local older copy, the deletion is needed
    files.update(&LOCAL_DEVICE, vec![file("gone", &[(1, 1)], vec![block(1)])])?;
    assert_eq!(1, files.need_size(&LOCAL_DEVICE));

    Ok(())
}

#[test]
fn invalid_global_is_never_needed() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    let mut f = file("ignored", &[(1, 1)], vec![block(1)]);
    f.raw_invalid = true;
    files.update(&remote, vec![f])?;

    assert_eq!(0, files.need_size(&LOCAL_DEVICE));

    let mut count = 0;
    files.with_need(&LOCAL_DEVICE, |_| {
        count += 1;
        true
    })?;
    assert_eq!(0, count);

    Ok(())
}

#[test]
fn drop_device_promotes_remaining_version() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    files.update(&LOCAL_DEVICE, vec![file("foo", &[(1, 1)], vec![block(1)])])?;
    files.update(&remote, vec![file("foo", &[(1, 2)], vec![block(2)])])?;

    assert_eq!(1, files.need_size(&LOCAL_DEVICE));

    files.drop_device(&remote)?;

    // The local version is the global again, nothing is needed
    let global = files.get_global("foo")?.unwrap();
    assert_eq!(Vector::with(&[(1, 1)]), global.version);
    assert_eq!(vec![LOCAL_DEVICE], files.availability("foo")?);
    assert_eq!(0, files.need_size(&LOCAL_DEVICE));
    assert_eq!(0, files.need_size(&remote));

    // The indices were maintained, not left for repair
    assert_eq!(0, db.check_repair("default")?);

    Ok(())
}

#[test]
fn drop_folder_erases_every_key() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    files.update(
        &LOCAL_DEVICE,
        vec![
            file("a", &[(1, 1)], blocks(100, 1)),
            file("b", &[(1, 1)], vec![block(1)]),
        ],
    )?;
    files.update(&remote, vec![file("c", &[(1, 1)], vec![block(2)])])?;

    db.drop_folder("default")?;

    // No folder-scoped key space retains anything
    let tx = db.backend().new_read_transaction()?;
    for key_type in [
        KEY_TYPE_DEVICE,
        KEY_TYPE_GLOBAL,
        KEY_TYPE_BLOCK,
        KEY_TYPE_SEQUENCE,
        KEY_TYPE_NEED,
    ] {
        assert_eq!(
            0,
            tx.iter_prefix(&[key_type]).count(),
            "key type {key_type} not erased"
        );
    }
    drop(tx);

    // A fresh file set over the same folder starts empty
    let files = FileSet::new("default", Arc::clone(&db))?;
    assert_eq!(0, files.local_size().total());
    assert!(files.get(&LOCAL_DEVICE, "a")?.is_none());

    Ok(())
}

#[test]
fn availability_lists_all_holders_of_the_winner() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let (r1, r2) = (device(1), device(2));

    files.update(&r1, vec![file("a", &[(1, 1)], vec![block(1)])])?;
    files.update(&r2, vec![file("a", &[(1, 1)], vec![block(1)])])?;

    assert_eq!(vec![r1, r2], files.availability("a")?);

    // An invalid holder of the same version is not advertised
    let mut f = file("a", &[(1, 1)], vec![block(1)]);
    f.raw_invalid = true;
    let r3 = device(3);
    files.update(&r3, vec![f])?;

    assert_eq!(vec![r1, r2], files.availability("a")?);

    Ok(())
}

#[test]
fn with_blocks_hash_finds_large_files() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    // Above the indirection cutoff, so the block list is content-addressed
    files.update(&LOCAL_DEVICE, vec![file("big", &[(1, 1)], blocks(100, 7))])?;

    let stored = files.get(&LOCAL_DEVICE, "big")?.unwrap();
    assert_eq!(100, stored.blocks.len());
    assert!(!stored.blocks_hash.is_empty());

    let mut found = vec![];
    files.with_blocks_hash(&stored.blocks_hash, |f| {
        found.push(f.name.clone());
        true
    })?;
    assert_eq!(vec!["big"], found);

    Ok(())
}

#[test]
fn sequence_iteration_resumes_mid_stream() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        files.update(
            &LOCAL_DEVICE,
            vec![file(name, &[(1, i as u64 + 1)], vec![block(i as u8)])],
        )?;
    }

    let mut seen = vec![];
    files.with_have_sequence(3, |f| {
        seen.push(f.sequence);
        true
    })?;
    assert_eq!(vec![3, 4], seen);

    // Modifying a file moves it to the end of the stream
    files.update(&LOCAL_DEVICE, vec![file("a", &[(1, 9)], vec![block(9)])])?;

    let mut seen = vec![];
    files.with_have_sequence(3, |f| {
        seen.push((f.sequence, f.name.clone()));
        true
    })?;
    assert_eq!(
        vec![(3, "c".to_owned()), (4, "d".to_owned()), (5, "a".to_owned())],
        seen
    );

    Ok(())
}

#[test]
fn index_ids() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    // The local ID is generated once and sticks
    let local = files.index_id(&LOCAL_DEVICE)?;
    assert!(!local.is_none());
    assert_eq!(local, files.index_id(&LOCAL_DEVICE)?);

    // Remote IDs are zero until announced
    assert!(files.index_id(&remote)?.is_none());
    files.set_index_id(&remote, file_index::IndexId(42))?;
    assert_eq!(file_index::IndexId(42), files.index_id(&remote)?);

    // Dropping all index IDs voids the conversation; the local side
    // regenerates, the remote reads as unannounced again
    db.drop_index_ids()?;
    assert!(files.index_id(&remote)?.is_none());
    let regenerated = files.index_id(&LOCAL_DEVICE)?;
    assert!(!regenerated.is_none());
    assert_ne!(local, regenerated);

    Ok(())
}

#[test]
fn meta_survives_reload_and_recalc() -> file_index::Result<()> {
    let backend = common::open_backend();
    let db = common::open_db_on(Arc::clone(&backend))?;
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    files.update(&LOCAL_DEVICE, vec![file("a", &[(1, 1)], vec![block(1)])])?;
    files.update(&remote, vec![file("a", &[(1, 2)], vec![block(2)])])?;

    let local = files.local_size();
    let global = files.global_size();
    let needed = files.need_size(&LOCAL_DEVICE);

    // Reopening loads the persisted counts
    let db2 = common::open_db_on(Arc::clone(&backend))?;
    let files2 = FileSet::new("default", Arc::clone(&db2))?;
    assert_eq!(local, files2.local_size());
    assert_eq!(global, files2.global_size());
    assert_eq!(needed, files2.need_size(&LOCAL_DEVICE));
    assert_eq!(files.sequence(&LOCAL_DEVICE), files2.sequence(&LOCAL_DEVICE));

    // Destroying the blob forces a recalculation with the same result
    let meta_key = db2.keyer().folder_meta_key_ro("default").unwrap();
    db2.backend().delete(&meta_key)?;

    let db3 = common::open_db_on(Arc::clone(&backend))?;
    let files3 = FileSet::new("default", Arc::clone(&db3))?;
    assert_eq!(local, files3.local_size());
    assert_eq!(global, files3.global_size());
    assert_eq!(needed, files3.need_size(&LOCAL_DEVICE));

    Ok(())
}

#[test]
fn flag_only_changes_are_not_skipped() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    files.update(&LOCAL_DEVICE, vec![file("a", &[(1, 1)], vec![block(1)])])?;
    assert_eq!(1, files.local_size().files);

    // Ignoring the file without a version bump must still take effect
    let mut ignored = file("a", &[(1, 1)], vec![block(1)]);
    ignored.local_flags = file_index::FLAG_LOCAL_IGNORED;
    files.update(&LOCAL_DEVICE, vec![ignored])?;

    assert_eq!(0, files.local_size().files);
    assert!(files.get(&LOCAL_DEVICE, "a")?.unwrap().is_invalid());

    // The invalid local copy no longer backs a usable global
    assert_eq!(0, files.availability("a")?.len());

    Ok(())
}
