// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

//! Ordered, idempotent schema migrations.
//!
//! The schema version lives under the misc key space. Opening a database
//! written by a newer version fails with a downgrade error naming the
//! minimum software version able to read it; opening an older database
//! runs every missing step in order, committing each before the next
//! begins. Steps are idempotent relative to their predecessor, so a crash
//! between step and version bump is safe.

use crate::{
    coding::{Decode, Encode},
    db::Db,
    device::LOCAL_DEVICE,
    error::Error,
    events::EventKind,
    fileinfo::{valid_name, FileInfo, FileItem, FileType, FLAG_LOCAL_IGNORED},
    keyer::KEY_TYPE_DEVICE,
    meta::MetadataTracker,
    repair,
    txn::{ReadContext, WriteTxn},
    vector::Vector,
    versionlist::{decode_deprecated, VersionList, VERSION_LIST_FORMAT_DEPRECATED},
};
use std::sync::Mutex;

/// The schema version this build reads and writes.
pub const SCHEMA_VERSION: u64 = 8;

/// The oldest software version able to read the current schema; stored
/// alongside the schema version and reported in downgrade errors.
pub const MIN_COMPAT_VERSION: &str = "0.1.0";

/// Misc key name the schema version is stored under.
#[doc(hidden)]
pub const MISC_SCHEMA_VERSION: &str = "schema-version";

/// Misc key name the minimum compatible software version is stored under.
#[doc(hidden)]
pub const MISC_MIN_COMPAT: &str = "min-compat-version";

type Step = fn(&Db) -> crate::Result<()>;

const STEPS: [(u64, Step); 8] = [
    (1, drop_unusable_names),
    (2, populate_sequence_index),
    (3, populate_need_index),
    (4, reset_need_index),
    (5, legacy_invalid_to_ignored),
    (6, introduce_indirection),
    (7, populate_block_list_map),
    (8, regroup_version_lists),
];

pub(crate) fn run(db: &Db) -> crate::Result<()> {
    let stored = db.misc_u64(MISC_SCHEMA_VERSION)?.unwrap_or(0);

    if stored == SCHEMA_VERSION {
        return Ok(());
    }

    if stored > SCHEMA_VERSION {
        let min_version = db
            .misc_string(MISC_MIN_COMPAT)?
            .unwrap_or_else(|| "a newer version".to_owned());
        return Err(Error::Downgrade { min_version });
    }

    for (to, step) in STEPS {
        if stored < to {
            log::info!("migrating database schema to version {to}");
            step(db)?;
            db.put_misc_u64(MISC_SCHEMA_VERSION, to)?;
        }
    }

    db.put_misc_string(MISC_MIN_COMPAT, MIN_COMPAT_VERSION)?;

    Ok(())
}

/// 0→1: drop records with absolute or dot names, rewrite the legacy
/// symlink subtypes, and make sure invalid records appear in the global
/// version lists (older schemas left them out).
fn drop_unusable_names(db: &Db) -> crate::Result<()> {
    let mut txn = WriteTxn::new(db, vec![])?;
    let meta = Mutex::new(MetadataTracker::new());

    let records: Vec<Vec<u8>> = {
        let mut keys = vec![];
        for kv in txn.iter_prefix(&[KEY_TYPE_DEVICE]) {
            let (key, _) = kv?;
            keys.push(key);
        }
        keys
    };

    for key in records {
        let (Some(folder), Some(device)) = (
            db.keyer().folder_from_key(&key),
            db.keyer().device_from_device_key(&key),
        ) else {
            continue;
        };

        let mut file = match txn.get_file_by_key(&key) {
            Ok(Some(file)) => file,
            Ok(None) => continue,
            Err(Error::Decode(e)) => {
                log::warn!("dropping undecodable record during migration: {e}");
                txn.delete(&key)?;
                continue;
            }
            Err(e) => return Err(e),
        };

        if !valid_name(&file.name) {
            log::debug!("dropping record with unusable name {:?}", file.name);
            txn.remove_from_global(&folder, &device, file.name.as_bytes(), &meta)?;
            txn.delete(&key)?;
            continue;
        }

        if matches!(
            file.file_type,
            FileType::DeprecatedSymlinkFile | FileType::DeprecatedSymlinkDirectory
        ) {
            file.file_type = FileType::Symlink;
            txn.put_file(&key, &file)?;
        }

        if file.is_invalid() {
            txn.update_global(&folder, &device, &file, &meta)?;
        }

        txn.checkpoint()?;
    }

    for folder in db.folders() {
        txn.invalidate_folder_meta(&folder)?;
    }
    txn.commit()
}

/// 1→2: build the sequence index from the existing local records,
/// assigning sequence numbers to records that predate them.
fn populate_sequence_index(db: &Db) -> crate::Result<()> {
    for folder in db.folders() {
        let mut txn = WriteTxn::new(db, vec![])?;

        let Some(prefix) = db.keyer().device_prefix_ro(&folder, Some(&LOCAL_DEVICE)) else {
            continue;
        };

        let keys: Vec<Vec<u8>> = {
            let mut keys = vec![];
            for kv in txn.iter_prefix(&prefix) {
                let (key, _) = kv?;
                keys.push(key);
            }
            keys
        };

        let mut highest = 0;
        let mut unsequenced = vec![];

        for key in &keys {
            let Some(file) = txn.get_file_by_key_unfilled(key)? else {
                continue;
            };

            if file.sequence > 0 {
                highest = highest.max(file.sequence);
                let sequence_key = db.keyer().sequence_key(&folder, file.sequence)?;
                txn.put(&sequence_key, key)?;
            } else {
                unsequenced.push(key.clone());
            }
        }

        for key in unsequenced {
            let Some(mut file) = txn.get_file_by_key(&key)? else {
                continue;
            };

            highest += 1;
            file.sequence = highest;
            txn.put_file(&key, &file)?;

            let sequence_key = db.keyer().sequence_key(&folder, file.sequence)?;
            txn.put(&sequence_key, &key)?;
        }

        txn.invalidate_folder_meta(&folder)?;
        txn.commit()?;
    }

    Ok(())
}

/// 2→3: derive the local need index from the global version lists.
fn populate_need_index(db: &Db) -> crate::Result<()> {
    for folder in db.folders() {
        repair::check_local_need(db, &folder)?;
    }
    Ok(())
}

/// 3→4: a historical defect left stale need entries behind; wipe the
/// index and rebuild it from the globals.
fn reset_need_index(db: &Db) -> crate::Result<()> {
    for folder in db.folders() {
        let mut txn = WriteTxn::new(db, vec![])?;
        if let Some(prefix) = db.keyer().need_key_ro(&folder, b"") {
            txn.delete_prefix(&prefix)?;
        }
        txn.commit()?;
    }
    populate_need_index(db)
}

/// 4→5: local records that used the wire-level invalid bit become
/// ignored via local flags; the bit is reserved for remote records.
fn legacy_invalid_to_ignored(db: &Db) -> crate::Result<()> {
    for folder in db.folders() {
        let mut txn = WriteTxn::new(db, vec![])?;

        let Some(prefix) = db.keyer().device_prefix_ro(&folder, Some(&LOCAL_DEVICE)) else {
            continue;
        };

        let keys: Vec<Vec<u8>> = {
            let mut keys = vec![];
            for kv in txn.iter_prefix(&prefix) {
                let (key, _) = kv?;
                keys.push(key);
            }
            keys
        };

        for key in keys {
            let Some(mut file) = txn.get_file_by_key(&key)? else {
                continue;
            };

            if file.raw_invalid {
                file.raw_invalid = false;
                file.local_flags |= FLAG_LOCAL_IGNORED;
                txn.put_file(&key, &file)?;
                txn.checkpoint()?;
            }
        }

        txn.invalidate_folder_meta(&folder)?;
        txn.commit()?;
    }

    Ok(())
}

/// 5→6: split large block lists and wide version vectors out into the
/// content-addressed key spaces.
fn introduce_indirection(db: &Db) -> crate::Result<()> {
    let mut txn = WriteTxn::new(db, vec![])?;

    let records: Vec<Vec<u8>> = {
        let mut keys = vec![];
        for kv in txn.iter_prefix(&[KEY_TYPE_DEVICE]) {
            let (key, _) = kv?;
            keys.push(key);
        }
        keys
    };

    for key in records {
        let Some(stored) = txn.get_file_by_key_unfilled(&key)? else {
            continue;
        };

        let needs_rewrite = stored.blocks.len() > db.config().blocks_indirection_cutoff
            || (stored.version_hash.is_empty()
                && stored.version.counters().len() > db.config().version_indirection_cutoff);

        if needs_rewrite {
            let Some(file) = txn.get_file_by_key(&key)? else {
                continue;
            };
            txn.put_file(&key, &file)?;
            txn.checkpoint()?;
        }
    }

    txn.commit()
}

/// 6→7: build the block-list-map key space from the local records.
fn populate_block_list_map(db: &Db) -> crate::Result<()> {
    for folder in db.folders() {
        let mut txn = WriteTxn::new(db, vec![])?;

        if let Some(prefix) = db.keyer().block_list_map_prefix_ro(&folder, b"") {
            txn.delete_prefix(&prefix)?;
        }

        let Some(prefix) = db.keyer().device_prefix_ro(&folder, Some(&LOCAL_DEVICE)) else {
            txn.commit()?;
            continue;
        };

        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let mut entries = vec![];
            for kv in txn.iter_prefix(&prefix) {
                let (key, value) = kv?;
                entries.push((key, value));
            }
            entries
        };

        for (key, value) in entries {
            let file = match FileInfo::decode_from_slice(&value) {
                Ok(file) => file,
                Err(e) => {
                    log::warn!("undecodable record during migration, skipping: {e}");
                    continue;
                }
            };

            let eligible = file.file_type == FileType::Regular
                && !file.deleted
                && !file.is_invalid()
                && !file.blocks_hash.is_empty();

            if eligible {
                let Some(name) = db.keyer().name_from_device_key(&key) else {
                    continue;
                };
                let map_key = db
                    .keyer()
                    .block_list_map_key(&folder, &file.blocks_hash, name)?;
                txn.put(&map_key, b"")?;
                txn.checkpoint()?;
            }
        }

        txn.commit()?;
    }

    Ok(())
}

/// A deprecated version-list entry viewed through the capability trait,
/// so the regular list update can re-insert it.
struct LegacyEntry {
    version: Vector,
    deleted: bool,
    invalid: bool,
}

impl crate::fileinfo::FileItem for LegacyEntry {
    fn file_name(&self) -> &str {
        ""
    }

    fn file_version(&self) -> &Vector {
        &self.version
    }

    fn file_type(&self) -> FileType {
        FileType::Regular
    }

    fn file_size(&self) -> i64 {
        0
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn is_invalid(&self) -> bool {
        self.invalid
    }

    fn sequence_no(&self) -> i64 {
        0
    }

    fn blocks_hash(&self) -> &[u8] {
        &[]
    }

    fn local_flags(&self) -> u32 {
        0
    }
}

/// 7→8: rewrite version lists from the retired one-device-per-entry
/// layout into the grouped layout, then rebuild the need index, whose
/// semantics piggyback on the grouping.
fn regroup_version_lists(db: &Db) -> crate::Result<()> {
    for folder in db.folders() {
        let mut txn = WriteTxn::new(db, vec![])?;

        let Some(prefix) = db.keyer().global_key_ro(&folder, b"") else {
            continue;
        };

        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let mut entries = vec![];
            for kv in txn.iter_prefix(&prefix) {
                entries.push(kv?);
            }
            entries
        };

        for (key, value) in entries {
            if value.first() != Some(&VERSION_LIST_FORMAT_DEPRECATED) {
                // Already grouped (or empty, which repair handles)
                continue;
            }

            let legacy = match decode_deprecated(&value) {
                Ok(entries) => entries,
                Err(e) => {
                    db.events().log(
                        EventKind::Failure,
                        &format!("dropping unreadable version list during migration: {e}"),
                    );
                    txn.delete(&key)?;
                    continue;
                }
            };

            let mut list = VersionList::default();
            for entry in legacy {
                list.update(
                    entry.device,
                    &LegacyEntry {
                        version: entry.version,
                        deleted: entry.deleted,
                        invalid: entry.invalid,
                    },
                );
            }

            if list.is_empty() {
                txn.delete(&key)?;
            } else {
                txn.put(&key, &list.encode_into_vec())?;
            }

            txn.checkpoint()?;
        }

        txn.invalidate_folder_meta(&folder)?;
        txn.commit()?;

        repair::check_local_need(db, &folder)?;
    }

    Ok(())
}
