// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

//! Reconciles the derived indices against the authoritative device
//! records: global version lists against records, the local need index
//! against the globals, and the sequence index against the local records.

use crate::{
    coding::{Decode, Encode},
    db::Db,
    device::LOCAL_DEVICE,
    events::EventKind,
    fileinfo::FileInfo,
    txn::{ReadContext, WriteTxn},
    vector::Vector,
    versionlist::{need, FileVersion, VersionList},
};

/// Runs all repair passes for one folder and returns the total number of
/// repaired entries.
pub(crate) fn check_repair(db: &Db, folder: &str) -> crate::Result<usize> {
    let mut total = check_globals(db, folder)?;
    total += check_local_need(db, folder)?;
    total += repair_sequence(db, folder)?;

    if total > 0 {
        db.events().log(
            EventKind::DbRepair,
            &format!("repaired {total} entries in folder {folder:?}"),
        );
    }

    Ok(total)
}

/// Removes version-list entries whose device record is gone and deletes
/// version lists that end up empty.
pub(crate) fn check_globals(db: &Db, folder: &str) -> crate::Result<usize> {
    let mut txn = WriteTxn::new(db, vec![])?;

    let Some(prefix) = db.keyer().global_key_ro(folder, b"") else {
        return Ok(0);
    };

    let entries: Vec<(Vec<u8>, Vec<u8>)> = {
        let mut entries = vec![];
        for kv in txn.iter_prefix(&prefix) {
            entries.push(kv?);
        }
        entries
    };

    let mut fixed = 0;

    for (key, value) in entries {
        let Some(name) = db.keyer().name_from_global_key(&key).map(<[u8]>::to_vec) else {
            continue;
        };

        let list = match VersionList::decode_from_slice(&value) {
            Ok(list) => list,
            Err(e) => {
                db.events().log(
                    EventKind::Failure,
                    &format!("dropping malformed version list for {name:?}: {e}"),
                );
                txn.delete(&key)?;
                fixed += 1;
                continue;
            }
        };

        if list.versions.is_empty() {
            db.events().log(
                EventKind::Failure,
                &format!("dropping empty version list for {name:?}"),
            );
            txn.delete(&key)?;
            fixed += 1;
            continue;
        }

        let mut changed = false;
        let mut repaired = VersionList::default();

        for fv in list.versions {
            if fv.is_empty() {
                db.events().log(
                    EventKind::Failure,
                    &format!("dropping version group without devices for {name:?}"),
                );
                changed = true;
                continue;
            }

            let mut kept = FileVersion {
                version: fv.version,
                deleted: fv.deleted,
                devices: vec![],
                invalid_devices: vec![],
            };

            for device in fv.devices {
                if has_record(&txn, db, folder, &device, &name)? {
                    kept.devices.push(device);
                } else {
                    changed = true;
                }
            }
            for device in fv.invalid_devices {
                if has_record(&txn, db, folder, &device, &name)? {
                    kept.invalid_devices.push(device);
                } else {
                    changed = true;
                }
            }

            if kept.is_empty() {
                // A group without devices carries no information
                changed = true;
            } else {
                repaired.versions.push(kept);
            }
        }

        if repaired.is_empty() {
            txn.delete(&key)?;
            fixed += 1;
        } else if changed {
            txn.put(&key, &repaired.encode_into_vec())?;
            fixed += 1;
        }
    }

    // Pruning entries can change global winners, which the folder counts
    // aggregate; force a recalculation at the next open
    if fixed > 0 {
        txn.invalidate_folder_meta(folder)?;
    }

    txn.commit()?;
    Ok(fixed)
}

fn has_record(
    txn: &WriteTxn<'_>,
    db: &Db,
    folder: &str,
    device: &crate::device::DeviceId,
    name: &[u8],
) -> crate::Result<bool> {
    let Some(key) = db.keyer().device_key_ro(folder, device, name) else {
        return Ok(false);
    };
    Ok(txn.tx().get(&key)?.is_some())
}

/// Recomputes the local need set from the global lists and reconciles the
/// need index with it, adding missing entries and deleting stale ones.
pub(crate) fn check_local_need(db: &Db, folder: &str) -> crate::Result<usize> {
    let mut txn = WriteTxn::new(db, vec![])?;

    // Expected: names whose global the local device needs, in name order
    let mut expected: Vec<Vec<u8>> = vec![];
    if let Some(prefix) = db.keyer().global_key_ro(folder, b"") {
        for kv in txn.iter_prefix(&prefix) {
            let (key, value) = kv?;

            let Some(name) = db.keyer().name_from_global_key(&key) else {
                continue;
            };
            let list = match VersionList::decode_from_slice(&value) {
                Ok(list) => list,
                Err(_) => continue,
            };
            let Some(global) = list.get_global() else {
                continue;
            };

            let (have, version) = match list.version_of(&LOCAL_DEVICE) {
                Some(fv) => (true, fv.version.clone()),
                None => (false, Vector::new()),
            };

            if need(global, have, &version) {
                expected.push(name.to_vec());
            }
        }
    }

    // Stored: the need index, also in name order
    let mut stored: Vec<Vec<u8>> = vec![];
    if let Some(prefix) = db.keyer().need_key_ro(folder, b"") {
        for kv in txn.iter_prefix(&prefix) {
            let (key, _) = kv?;
            if let Some(name) = db.keyer().name_from_global_key(&key) {
                stored.push(name.to_vec());
            }
        }
    }

    let mut fixed = 0;
    let mut expected_iter = expected.into_iter().peekable();
    let mut stored_iter = stored.into_iter().peekable();

    loop {
        let action = match (expected_iter.peek(), stored_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(e), Some(s)) => e.cmp(s),
        };

        match action {
            std::cmp::Ordering::Less => {
                // Needed but not in the index
                if let Some(name) = expected_iter.next() {
                    let key = db.keyer().need_key(folder, &name)?;
                    txn.put(&key, b"")?;
                    fixed += 1;
                }
            }
            std::cmp::Ordering::Greater => {
                // In the index but not needed
                if let Some(name) = stored_iter.next() {
                    if let Some(key) = db.keyer().need_key_ro(folder, &name) {
                        txn.delete(&key)?;
                        fixed += 1;
                    }
                }
            }
            std::cmp::Ordering::Equal => {
                expected_iter.next();
                stored_iter.next();
            }
        }
    }

    // Need counts live in the folder counts blob too
    if fixed > 0 {
        txn.invalidate_folder_meta(folder)?;
    }

    txn.commit()?;
    Ok(fixed)
}

/// Makes the sequence index and the local records agree: every local
/// record gets exactly one sequence entry pointing back at it, and
/// entries pointing at nothing (or at a record with another sequence)
/// are deleted.
pub(crate) fn repair_sequence(db: &Db, folder: &str) -> crate::Result<usize> {
    let mut txn = WriteTxn::new(db, vec![])?;
    let mut fixed = 0;

    // Forward: record -> sequence entry
    if let Some(prefix) = db.keyer().device_prefix_ro(folder, Some(&LOCAL_DEVICE)) {
        let records: Vec<(Vec<u8>, i64)> = {
            let mut records = vec![];
            for kv in txn.iter_prefix(&prefix) {
                let (key, value) = kv?;
                match FileInfo::decode_from_slice(&value) {
                    Ok(file) => records.push((key, file.sequence)),
                    Err(e) => log::warn!("undecodable record during sequence repair: {e}"),
                }
            }
            records
        };

        for (device_key, sequence) in records {
            if sequence <= 0 {
                continue;
            }

            let sequence_key = db.keyer().sequence_key(folder, sequence)?;
            match txn.tx().get(&sequence_key)? {
                Some(value) if value == device_key => {}
                _ => {
                    txn.put(&sequence_key, &device_key)?;
                    fixed += 1;
                }
            }
        }
    }

    // Backward: sequence entry -> record
    if let Some(prefix) = db.keyer().sequence_prefix_ro(folder) {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let mut entries = vec![];
            for kv in txn.iter_prefix(&prefix) {
                entries.push(kv?);
            }
            entries
        };

        for (key, device_key) in entries {
            let sequence = db.keyer().sequence_from_sequence_key(&key).unwrap_or(0);

            let intact = match txn.tx().get(&device_key)? {
                Some(raw) => FileInfo::decode_from_slice(&raw)
                    .map(|file| file.sequence == sequence)
                    .unwrap_or(false),
                None => false,
            };

            if !intact {
                txn.delete(&key)?;
                fixed += 1;
            }
        }
    }

    txn.commit()?;
    Ok(fixed)
}
