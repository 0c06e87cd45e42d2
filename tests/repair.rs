mod common;

use common::{block, device, file, open_db};
use file_index::{Decode, Encode, FileSet, FileVersion, Vector, VersionList, LOCAL_DEVICE};
use std::sync::Arc;
use test_log::test;

#[test]
fn sequence_repair() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;

    files.update(&LOCAL_DEVICE, vec![file("ok", &[(1, 1)], vec![block(1)])])?;

    // Inject a local record with sequence 101 but no sequence entry
    let mut orphan_record = file("orphan", &[(1, 1)], vec![block(2)]);
    orphan_record.sequence = 101;
    let record_key = db
        .keyer()
        .device_key("default", &LOCAL_DEVICE, b"orphan")?;
    db.backend()
        .put(&record_key, &orphan_record.encode_into_vec())?;

    // And a sequence entry pointing at a record that does not exist
    let dangling_key = db.keyer().sequence_key("default", 55)?;
    let missing_record_key = db
        .keyer()
        .device_key("default", &LOCAL_DEVICE, b"no-such-file")?;
    db.backend().put(&dangling_key, &missing_record_key)?;

    assert!(db.check_repair("default")? >= 2);

    // Every record is now reachable through the sequence index, in order
    let mut seen = vec![];
    files.with_have_sequence(1, |f| {
        seen.push((f.sequence, f.name.clone()));
        true
    })?;
    assert_eq!(
        vec![(1, "ok".to_owned()), (101, "orphan".to_owned())],
        seen
    );

    // The dangling entry is gone
    assert_eq!(None, db.backend().get(&dangling_key)?);

    // A second pass finds nothing left to fix
    assert_eq!(0, db.check_repair("default")?);

    Ok(())
}

#[test]
fn globals_without_records_are_pruned() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    files.update(&LOCAL_DEVICE, vec![file("kept", &[(1, 1)], vec![block(1)])])?;

    // Inject a version list naming a device that has no record at all
    let ghost = device(9);
    let list = VersionList {
        versions: vec![FileVersion {
            version: Vector::with(&[(9, 1)]),
            deleted: false,
            devices: vec![ghost],
            invalid_devices: vec![],
        }],
    };
    let ghost_key = db.keyer().global_key("default", b"ghost")?;
    db.backend().put(&ghost_key, &list.encode_into_vec())?;

    // And add a ghost device to an otherwise healthy list
    files.update(&remote, vec![file("kept", &[(1, 1)], vec![block(1)])])?;
    let kept_key = db.keyer().global_key("default", b"kept")?;
    let mut kept_list = VersionList::decode_from_slice(
        &db.backend().get(&kept_key)?.unwrap(),
    )
    .unwrap();
    kept_list.versions[0].devices.push(device(8));
    db.backend().put(&kept_key, &kept_list.encode_into_vec())?;

    assert!(db.check_repair("default")? >= 2);

    // The empty list is gone, the healthy one lost only the ghost
    assert_eq!(None, db.backend().get(&ghost_key)?);
    let repaired =
        VersionList::decode_from_slice(&db.backend().get(&kept_key)?.unwrap()).unwrap();
    assert_eq!(
        vec![LOCAL_DEVICE, remote],
        repaired.versions[0].devices
    );

    // Pruning can move global winners, so the repairs threw away the
    // persisted counts; a fresh view recalculates them from the records
    let meta_key = db.keyer().folder_meta_key_ro("default").unwrap();
    assert_eq!(None, db.backend().get(&meta_key)?);

    let reopened = FileSet::new("default", Arc::clone(&db))?;
    assert_eq!(1, reopened.local_size().files);
    assert_eq!(1, reopened.global_size().files);
    assert_eq!(0, reopened.need_size(&LOCAL_DEVICE));

    assert_eq!(0, db.check_repair("default")?);

    Ok(())
}

#[test]
fn need_index_reconciliation() -> file_index::Result<()> {
    let db = open_db();
    let files = FileSet::new("default", Arc::clone(&db))?;
    let remote = device(1);

    // One genuinely needed file and one satisfied file
    files.update(&remote, vec![file("wanted", &[(1, 2)], vec![block(1)])])?;
    files.update(&LOCAL_DEVICE, vec![file("fine", &[(1, 1)], vec![block(2)])])?;

    // Sabotage the index both ways
    let wanted_key = db.keyer().need_key("default", b"wanted")?;
    db.backend().delete(&wanted_key)?;
    let bogus_key = db.keyer().need_key("default", b"fine")?;
    db.backend().put(&bogus_key, b"")?;

    assert!(db.check_repair("default")? >= 2);

    let mut needed = vec![];
    files.with_need(&LOCAL_DEVICE, |f| {
        needed.push(f.name.clone());
        true
    })?;
    assert_eq!(vec!["wanted"], needed);

    assert_eq!(0, db.check_repair("default")?);

    Ok(())
}

#[test]
fn malformed_version_lists_are_deleted() -> file_index::Result<()> {
    let db = open_db();
    let _files = FileSet::new("default", Arc::clone(&db))?;

    let key = db.keyer().global_key("default", b"junk")?;
    db.backend().put(&key, &[0xde, 0xad, 0xbe, 0xef])?;

    assert!(db.check_repair("default")? >= 1);
    assert_eq!(None, db.backend().get(&key)?);

    Ok(())
}
