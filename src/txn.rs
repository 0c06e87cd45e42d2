// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

//! Read and write transactions over the backend, with the record-level
//! helpers everything else is built from: loading records with their
//! indirections restored, storing records with large block lists and wide
//! version vectors split out, and the version-list update that keeps the
//! global, need and count indices in step.

use crate::{
    backend::{CommitHook, KvIterator, ReadTransaction, WriteTransaction},
    coding::{Decode, Encode},
    db::Db,
    device::{DeviceId, GLOBAL_DEVICE, LOCAL_DEVICE},
    error::{Error, IndirectionError, IndirectionKind},
    fileinfo::{hash_blocks, BlockList, FileInfo, FileInfoTruncated},
    meta::MetadataTracker,
    vector::Vector,
    versionlist::{need, FileVersion, VersionList},
};
use sha2::{Digest, Sha256};
use std::sync::{Mutex, RwLockReadGuard};

/// Read helpers shared between read-only and read-write transactions.
pub(crate) trait ReadContext {
    fn db(&self) -> &Db;
    fn tx(&self) -> &dyn ReadTransaction;

    /// Loads one device record with all indirections restored.
    fn get_file(
        &self,
        folder: &str,
        device: &DeviceId,
        name: &[u8],
    ) -> crate::Result<Option<FileInfo>> {
        let Some(key) = self.db().keyer().device_key_ro(folder, device, name) else {
            return Ok(None);
        };
        self.get_file_by_key(&key)
    }

    /// Loads and fully restores the record stored under a device key.
    fn get_file_by_key(&self, key: &[u8]) -> crate::Result<Option<FileInfo>> {
        let Some(mut file) = self.get_file_by_key_unfilled(key)? else {
            return Ok(None);
        };
        self.fill_file_info(&mut file)?;
        Ok(Some(file))
    }

    /// Loads the record as stored, without following indirections.
    fn get_file_by_key_unfilled(&self, key: &[u8]) -> crate::Result<Option<FileInfo>> {
        let Some(raw) = self.tx().get(key)? else {
            return Ok(None);
        };
        Ok(Some(FileInfo::decode_from_slice(&raw)?))
    }

    /// Loads the record under a device key as a truncated projection.
    ///
    /// The version vector is restored but the block list deliberately is
    /// not; that is the point of the projection.
    fn get_file_truncated_by_key(&self, key: &[u8]) -> crate::Result<Option<FileInfoTruncated>> {
        let Some(mut file) = self.get_file_by_key_unfilled(key)? else {
            return Ok(None);
        };
        self.fill_version(&mut file)?;
        Ok(Some(file.into()))
    }

    /// Restores out-of-line parts of a stored record.
    fn fill_file_info(&self, file: &mut FileInfo) -> crate::Result<()> {
        self.fill_version(file)?;

        if file.blocks.is_empty() && !file.blocks_hash.is_empty() {
            let list = self.load_block_list(&file.blocks_hash)?;
            file.blocks = list.blocks;
        }

        Ok(())
    }

    /// Restores the version vector if it is stored out-of-line.
    fn fill_version(&self, file: &mut FileInfo) -> crate::Result<()> {
        if file.version_hash.is_empty() {
            return Ok(());
        }

        let key = self.db().keyer().version_key(&file.version_hash);
        match self.tx().get(&key)? {
            None => Err(Error::Indirection(IndirectionError {
                kind: IndirectionKind::VersionVector,
                hash: file.version_hash.clone(),
                source: None,
            })),
            Some(raw) => {
                file.version = Vector::decode_from_slice(&raw).map_err(|e| {
                    Error::Indirection(IndirectionError {
                        kind: IndirectionKind::VersionVector,
                        hash: file.version_hash.clone(),
                        source: Some(Box::new(e.into())),
                    })
                })?;
                Ok(())
            }
        }
    }

    /// Loads a content-addressed block list.
    fn load_block_list(&self, hash: &[u8]) -> crate::Result<BlockList> {
        let key = self.db().keyer().block_list_key(hash);
        match self.tx().get(&key)? {
            None => Err(Error::Indirection(IndirectionError {
                kind: IndirectionKind::BlockList,
                hash: hash.to_vec(),
                source: None,
            })),
            Some(raw) => BlockList::decode_from_slice(&raw).map_err(|e| {
                Error::Indirection(IndirectionError {
                    kind: IndirectionKind::BlockList,
                    hash: hash.to_vec(),
                    source: Some(Box::new(e.into())),
                })
            }),
        }
    }

    /// Loads the version list for one name.
    fn get_version_list(&self, folder: &str, name: &[u8]) -> crate::Result<Option<VersionList>> {
        let Some(key) = self.db().keyer().global_key_ro(folder, name) else {
            return Ok(None);
        };
        self.get_version_list_by_key(&key)
    }

    /// Loads the version list stored under a global key.
    fn get_version_list_by_key(&self, key: &[u8]) -> crate::Result<Option<VersionList>> {
        let Some(raw) = self.tx().get(key)? else {
            return Ok(None);
        };
        Ok(Some(VersionList::decode_from_slice(&raw)?))
    }

    /// Loads the full record backing one version-list group.
    ///
    /// The group's representative device must have a record, otherwise
    /// the database is inconsistent and repair is called for.
    fn file_from_version(
        &self,
        folder: &str,
        fv: &FileVersion,
        name: &[u8],
    ) -> crate::Result<FileInfo> {
        let Some(device) = fv.first_device() else {
            return Err(Error::GlobalEntryMissing);
        };
        let Some(key) = self.db().keyer().device_key_ro(folder, device, name) else {
            return Err(Error::GlobalEntryMissing);
        };
        self.get_file_by_key(&key)?.ok_or(Error::GlobalEntryMissing)
    }

    /// Truncated variant of [`Self::file_from_version`].
    fn file_from_version_truncated(
        &self,
        folder: &str,
        fv: &FileVersion,
        name: &[u8],
    ) -> crate::Result<FileInfoTruncated> {
        let Some(device) = fv.first_device() else {
            return Err(Error::GlobalEntryMissing);
        };
        let Some(key) = self.db().keyer().device_key_ro(folder, device, name) else {
            return Err(Error::GlobalEntryMissing);
        };
        self.get_file_truncated_by_key(&key)?
            .ok_or(Error::GlobalEntryMissing)
    }

    /// Loads the global (winner) record for one name.
    fn get_global_file(&self, folder: &str, name: &[u8]) -> crate::Result<Option<FileInfo>> {
        let Some(vl) = self.get_version_list(folder, name)? else {
            return Ok(None);
        };
        let Some(fv) = vl.get_global() else {
            return Ok(None);
        };
        self.file_from_version(folder, fv, name).map(Some)
    }

    /// Truncated variant of [`Self::get_global_file`].
    fn get_global_file_truncated(
        &self,
        folder: &str,
        name: &[u8],
    ) -> crate::Result<Option<FileInfoTruncated>> {
        let Some(vl) = self.get_version_list(folder, name)? else {
            return Ok(None);
        };
        let Some(fv) = vl.get_global() else {
            return Ok(None);
        };
        self.file_from_version_truncated(folder, fv, name).map(Some)
    }
}

/// A read-only transaction: a backend snapshot plus a shared hold on the
/// GC lock for its lifetime.
pub(crate) struct ReadTxn<'a> {
    db: &'a Db,
    _gc: RwLockReadGuard<'a, ()>,
    tx: Box<dyn ReadTransaction + 'a>,
}

impl<'a> ReadTxn<'a> {
    pub(crate) fn new(db: &'a Db) -> crate::Result<Self> {
        #[allow(clippy::expect_used)]
        let gc = db.gc_lock().read().expect("lock poisoned");
        let tx = db.backend().new_read_transaction()?;
        Ok(Self { db, _gc: gc, tx })
    }

    pub(crate) fn iter_prefix(&self, prefix: &[u8]) -> KvIterator<'_> {
        self.tx.iter_prefix(prefix)
    }

    pub(crate) fn iter_range(&self, first: &[u8], last: &[u8]) -> KvIterator<'_> {
        self.tx.iter_range(first, last)
    }
}

impl ReadContext for ReadTxn<'_> {
    fn db(&self) -> &Db {
        self.db
    }

    fn tx(&self) -> &dyn ReadTransaction {
        &*self.tx
    }
}

/// A read-write transaction: exclusive write access plus a shared hold on
/// the GC lock for its lifetime.
pub(crate) struct WriteTxn<'a> {
    db: &'a Db,
    _gc: RwLockReadGuard<'a, ()>,
    tx: Box<dyn WriteTransaction + 'a>,
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn new(db: &'a Db, hooks: Vec<CommitHook>) -> crate::Result<Self> {
        #[allow(clippy::expect_used)]
        let gc = db.gc_lock().read().expect("lock poisoned");
        let tx = db.backend().new_write_transaction(hooks)?;
        Ok(Self { db, _gc: gc, tx })
    }

    pub(crate) fn commit(self) -> crate::Result<()> {
        self.tx.commit()
    }

    pub(crate) fn checkpoint(&mut self) -> crate::Result<()> {
        self.tx.checkpoint()
    }

    pub(crate) fn put(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        self.tx.put(key, value)
    }

    pub(crate) fn delete(&mut self, key: &[u8]) -> crate::Result<()> {
        self.tx.delete(key)
    }

    pub(crate) fn iter_prefix(&self, prefix: &[u8]) -> KvIterator<'_> {
        self.tx.iter_prefix(prefix)
    }

    /// Drops the folder's persisted counts blob so the next open
    /// recalculates it from the records. Required after any structural
    /// change to the Device/Global key spaces that bypasses the
    /// metadata tracker (migrations, repair).
    pub(crate) fn invalidate_folder_meta(&mut self, folder: &str) -> crate::Result<()> {
        if let Some(key) = self.db.keyer().folder_meta_key_ro(folder) {
            self.tx.delete(&key)?;
        }
        Ok(())
    }

    /// Deletes every key under a prefix, returning how many went away.
    pub(crate) fn delete_prefix(&mut self, prefix: &[u8]) -> crate::Result<usize> {
        let keys = {
            let mut keys = vec![];
            for kv in self.tx.iter_prefix(prefix) {
                let (key, _) = kv?;
                keys.push(key);
            }
            keys
        };

        for key in &keys {
            self.tx.delete(key)?;
        }

        Ok(keys.len())
    }

    /// Stores a device record, splitting out the block list and version
    /// vector per the configured cutoffs.
    ///
    /// Returns the content address of the block list if one was recorded.
    pub(crate) fn put_file(&mut self, key: &[u8], file: &FileInfo) -> crate::Result<Option<Vec<u8>>> {
        let mut stored = file.clone();
        stored.version_hash.clear();

        let mut blocks_hash = None;

        if stored.blocks.len() > self.db.config().blocks_indirection_cutoff {
            let hash = hash_blocks(&stored.blocks);
            stored.blocks_hash = hash.to_vec();

            let block_list_key = self.db.keyer().block_list_key(&hash);
            if self.tx.get(&block_list_key)?.is_none() {
                let list = BlockList {
                    blocks: std::mem::take(&mut stored.blocks),
                };
                self.tx.put(&block_list_key, &list.encode_into_vec())?;
            } else {
                stored.blocks.clear();
            }

            blocks_hash = Some(stored.blocks_hash.clone());
        } else {
            stored.blocks_hash.clear();
        }

        if stored.version.counters().len() > self.db.config().version_indirection_cutoff {
            let raw = stored.version.encode_into_vec();
            let hash: [u8; 32] = Sha256::digest(&raw).into();

            let version_key = self.db.keyer().version_key(&hash);
            if self.tx.get(&version_key)?.is_none() {
                self.tx.put(&version_key, &raw)?;
            }

            stored.version_hash = hash.to_vec();
            stored.version = Vector::new();
        }

        self.tx.put(key, &stored.encode_into_vec())?;

        Ok(blocks_hash)
    }

    /// Folds one device's new record into the global version list,
    /// maintaining the global counts, the per-device need counts and the
    /// local need index. The caller stores the record itself afterwards.
    pub(crate) fn update_global(
        &mut self,
        folder: &str,
        device: &DeviceId,
        file: &FileInfo,
        meta: &Mutex<MetadataTracker>,
    ) -> crate::Result<()> {
        let name = file.name.as_bytes();
        let global_key = self.db.keyer().global_key(folder, name)?;

        let mut list = self.get_version_list_by_key(&global_key)?.unwrap_or_default();
        let outcome = list.update(*device, file);

        log::trace!(
            "update global; folder={folder:?} device={device} file={:?} changed={}",
            file.name,
            outcome.global_changed,
        );

        if outcome.global_changed {
            // Swap the old winner for the new one in the global counts.
            // The updated device's own record, if it backs either side, is
            // still unchanged in the backend at this point.
            if let Some(old_global) = &outcome.old_global {
                let old_file = self.file_from_version_truncated(folder, old_global, name)?;
                lock_meta(meta).remove_file(&GLOBAL_DEVICE, &old_file);
            }

            if outcome.new_global.first_device() == Some(device) {
                lock_meta(meta).add_file(&GLOBAL_DEVICE, file);
            } else {
                let new_file =
                    self.file_from_version_truncated(folder, &outcome.new_global, name)?;
                lock_meta(meta).add_file(&GLOBAL_DEVICE, &new_file);
            }
        }

        // Recompute need for every device the change can affect: the
        // updated device, the local device, everyone listed for this name,
        // and, when the winner changed, every device known to the folder.
        let mut candidates: Vec<DeviceId> = vec![LOCAL_DEVICE, *device];
        candidates.extend(list.devices().copied());
        if outcome.global_changed {
            candidates.extend(lock_meta(meta).devices());
        }
        candidates.sort_unstable();
        candidates.dedup();
        candidates.retain(|d| *d != GLOBAL_DEVICE);

        for candidate in candidates {
            let (have_before, version_before) = if candidate == *device {
                match &outcome.removed {
                    Some(fv) => (true, fv.version.clone()),
                    None => (false, Vector::new()),
                }
            } else {
                state_of(&list, &candidate)
            };

            let (have_now, version_now) = if candidate == *device {
                (true, file.version.clone())
            } else {
                (have_before, version_before.clone())
            };

            // A device making its first appearance for this name has no
            // tracked need to transition away from
            let needed_before = if candidate == *device && outcome.removed.is_none() {
                false
            } else {
                outcome
                    .old_global
                    .as_ref()
                    .is_some_and(|g| need(g, have_before, &version_before))
            };
            let needed_now = need(&outcome.new_global, have_now, &version_now);

            if needed_before == needed_now {
                continue;
            }

            lock_meta(meta).add_needed(&candidate, if needed_now { 1 } else { -1 });

            if candidate == LOCAL_DEVICE {
                let need_key = self.db.keyer().need_key(folder, name)?;
                if needed_now {
                    self.tx.put(&need_key, b"")?;
                } else {
                    self.tx.delete(&need_key)?;
                }
            }
        }

        self.tx.put(&global_key, &list.encode_into_vec())
    }

    /// Removes one device from the global version list for a name,
    /// maintaining the same indices as [`Self::update_global`]. Need is
    /// not recomputed for the removed device itself; callers drop its
    /// counts wholesale.
    pub(crate) fn remove_from_global(
        &mut self,
        folder: &str,
        device: &DeviceId,
        name: &[u8],
        meta: &Mutex<MetadataTracker>,
    ) -> crate::Result<()> {
        let global_key = self.db.keyer().global_key(folder, name)?;

        let Some(mut list) = self.get_version_list_by_key(&global_key)? else {
            return Ok(());
        };

        let old_global = list.get_global().cloned();
        if list.pop(device).is_none() {
            return Ok(());
        }
        let new_global = list.get_global().cloned();

        let global_changed = match (&old_global, &new_global) {
            (Some(old), Some(new)) => {
                !matches!(
                    old.version.compare(&new.version),
                    crate::vector::VectorOrdering::Equal
                ) || old.deleted != new.deleted
                    || old.is_invalid() != new.is_invalid()
            }
            _ => true,
        };

        if global_changed {
            if let Some(old) = &old_global {
                // The popped device's record is deleted only after this
                // call, so the old winner is still readable
                let old_file = self.file_from_version_truncated(folder, old, name)?;
                lock_meta(meta).remove_file(&GLOBAL_DEVICE, &old_file);
            }
            if let Some(new) = &new_global {
                let new_file = self.file_from_version_truncated(folder, new, name)?;
                lock_meta(meta).add_file(&GLOBAL_DEVICE, &new_file);
            }
        }

        let mut candidates: Vec<DeviceId> = vec![LOCAL_DEVICE];
        candidates.extend(list.devices().copied());
        if global_changed {
            candidates.extend(lock_meta(meta).devices());
        }
        candidates.sort_unstable();
        candidates.dedup();
        candidates.retain(|d| d != device && *d != GLOBAL_DEVICE);

        for candidate in candidates {
            let (have, version) = state_of(&list, &candidate);

            let needed_before = old_global
                .as_ref()
                .is_some_and(|g| need(g, have, &version));
            let needed_now = new_global
                .as_ref()
                .is_some_and(|g| need(g, have, &version));

            if needed_before == needed_now {
                continue;
            }

            lock_meta(meta).add_needed(&candidate, if needed_now { 1 } else { -1 });

            if candidate == LOCAL_DEVICE {
                let need_key = self.db.keyer().need_key(folder, name)?;
                if needed_now {
                    self.tx.put(&need_key, b"")?;
                } else {
                    self.tx.delete(&need_key)?;
                }
            }
        }

        if list.is_empty() {
            self.tx.delete(&global_key)
        } else {
            self.tx.put(&global_key, &list.encode_into_vec())
        }
    }
}

impl ReadContext for WriteTxn<'_> {
    fn db(&self) -> &Db {
        self.db
    }

    fn tx(&self) -> &dyn ReadTransaction {
        &*self.tx
    }
}

// Free-function loaders for the FileSet iterator drivers; fn items keep
// all their lifetimes late-bound, which the drivers' higher-ranked bounds
// require.

pub(crate) fn load_file_by_key(txn: &ReadTxn<'_>, key: &[u8]) -> crate::Result<Option<FileInfo>> {
    txn.get_file_by_key(key)
}

pub(crate) fn load_truncated_by_key(
    txn: &ReadTxn<'_>,
    key: &[u8],
) -> crate::Result<Option<FileInfoTruncated>> {
    txn.get_file_truncated_by_key(key)
}

pub(crate) fn load_global_file(
    txn: &ReadTxn<'_>,
    folder: &str,
    fv: &FileVersion,
    name: &[u8],
) -> crate::Result<FileInfo> {
    txn.file_from_version(folder, fv, name)
}

pub(crate) fn load_global_truncated(
    txn: &ReadTxn<'_>,
    folder: &str,
    fv: &FileVersion,
    name: &[u8],
) -> crate::Result<FileInfoTruncated> {
    txn.file_from_version_truncated(folder, fv, name)
}

fn state_of(list: &VersionList, device: &DeviceId) -> (bool, Vector) {
    match list.version_of(device) {
        Some(fv) => (true, fv.version.clone()),
        None => (false, Vector::new()),
    }
}

#[allow(clippy::expect_used)]
fn lock_meta(meta: &Mutex<MetadataTracker>) -> std::sync::MutexGuard<'_, MetadataTracker> {
    meta.lock().expect("lock poisoned")
}
