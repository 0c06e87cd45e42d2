// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

//! The per-folder public API.
//!
//! A [`FileSet`] maintains, for one folder, every device's record of every
//! name, the per-name global winner, the local need set, the sequence
//! index and the local block map, all updated atomically by
//! [`FileSet::update`] and served by cooperative prefix-scan iterators.

use crate::{
    backend::{prefix_upper_bound, CommitHook},
    coding::{Decode, Encode},
    db::Db,
    device::{DeviceId, GLOBAL_DEVICE, LOCAL_DEVICE},
    error::Error,
    fileinfo::{
        valid_name, FileInfo, FileInfoTruncated, FileItem, FileType, FLAG_LOCAL_ALL,
        FLAG_LOCAL_RECEIVE_ONLY,
    },
    meta::{Counts, MetadataTracker},
    txn::{
        load_file_by_key, load_global_file, load_global_truncated, load_truncated_by_key,
        ReadContext, ReadTxn, WriteTxn,
    },
    versionlist::{need, FileVersion, VersionList},
};
use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifies one device's view of one folder; announcing a new index ID
/// tells peers that previously transferred index data is void.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexId(pub u64);

impl IndexId {
    /// A fresh random, non-zero index ID.
    #[must_use]
    pub fn random() -> Self {
        loop {
            let id = rand::random::<u64>();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Whether no index ID has been announced.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for IndexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The authoritative view of one synchronized folder.
pub struct FileSet {
    folder: String,
    db: Arc<Db>,
    meta: Arc<Mutex<MetadataTracker>>,
    update_lock: Mutex<()>,
}

impl FileSet {
    /// Opens the folder's file set, loading its metadata or, when the
    /// stored blob is missing or damaged, recalculating it from the
    /// records.
    pub fn new(folder: &str, db: Arc<Db>) -> crate::Result<Self> {
        // Intern the folder up front; key building inside write
        // transactions must never have to allocate an identifier
        db.keyer().folder_idx().id(folder.as_bytes())?;

        let meta = Self::load_or_recalc_meta(&db, folder)?;

        Ok(Self {
            folder: folder.to_owned(),
            db,
            meta: Arc::new(Mutex::new(meta)),
            update_lock: Mutex::new(()),
        })
    }

    /// The folder this set belongs to.
    #[must_use]
    pub fn folder(&self) -> &str {
        &self.folder
    }

    fn load_or_recalc_meta(db: &Db, folder: &str) -> crate::Result<MetadataTracker> {
        let key = db.keyer().folder_meta_key(folder)?;

        if let Some(raw) = db.backend().get(&key)? {
            match MetadataTracker::decode_from_slice(&raw) {
                Ok(meta) => return Ok(meta),
                Err(e) => {
                    log::warn!("folder {folder:?}: cannot decode metadata ({e}), recalculating");
                }
            }
        }

        let meta = Self::recalc_meta(db, folder)?;
        db.backend().put(&key, &meta.encode_into_vec())?;
        Ok(meta)
    }

    /// Rebuilds the folder's counts from scratch, per device, for the
    /// global pseudo-device and for the per-device need counters.
    fn recalc_meta(db: &Db, folder: &str) -> crate::Result<MetadataTracker> {
        log::debug!("recalculating metadata for folder {folder:?}");

        let mut meta = MetadataTracker::new();
        let txn = ReadTxn::new(db)?;

        if let Some(prefix) = db.keyer().device_prefix_ro(folder, None) {
            for kv in txn.iter_prefix(&prefix) {
                let (key, _) = kv?;

                let Some(device) = db.keyer().device_from_device_key(&key) else {
                    log::warn!("record under unknown device index, skipping: {key:?}");
                    continue;
                };

                match txn.get_file_truncated_by_key(&key) {
                    Ok(Some(file)) => meta.add_file(&device, &file),
                    Ok(None) => {}
                    Err(Error::Decode(e)) => {
                        log::warn!("undecodable record during recalc, skipping: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mut devices = meta.devices();
        devices.push(LOCAL_DEVICE);
        devices.sort_unstable();
        devices.dedup();
        devices.retain(|d| *d != GLOBAL_DEVICE);

        if let Some(prefix) = db.keyer().global_key_ro(folder, b"") {
            for kv in txn.iter_prefix(&prefix) {
                let (key, value) = kv?;

                let list = match VersionList::decode_from_slice(&value) {
                    Ok(list) => list,
                    Err(e) => {
                        log::warn!("undecodable version list during recalc, skipping: {e}");
                        continue;
                    }
                };
                let Some(global) = list.get_global() else {
                    continue;
                };
                let Some(name) = db.keyer().name_from_global_key(&key) else {
                    continue;
                };

                match txn.file_from_version_truncated(folder, global, name) {
                    Ok(file) => meta.add_file(&GLOBAL_DEVICE, &file),
                    Err(Error::GlobalEntryMissing) => {
                        log::warn!("global winner without record during recalc, skipping");
                    }
                    Err(e) => return Err(e),
                }

                for device in &devices {
                    let (have, version) = match list.version_of(device) {
                        Some(fv) => (true, fv.version.clone()),
                        None => (false, crate::vector::Vector::new()),
                    };
                    if need(global, have, &version) {
                        meta.add_needed(device, 1);
                    }
                }
            }
        }

        Ok(meta)
    }

    fn lock_meta(&self) -> MutexGuard<'_, MetadataTracker> {
        #[allow(clippy::expect_used)]
        self.meta.lock().expect("lock poisoned")
    }

    fn meta_commit_hook(&self) -> crate::Result<CommitHook> {
        let meta = Arc::clone(&self.meta);
        let key = self.db.keyer().folder_meta_key(&self.folder)?;

        Ok(Box::new(move |w| {
            #[allow(clippy::expect_used)]
            let mut meta = meta.lock().expect("lock poisoned");
            if meta.is_dirty() {
                w.put(&key, &meta.encode_into_vec())?;
                meta.mark_clean();
            }
            Ok(())
        }))
    }

    // --- updates ---

    /// Replaces the device's records for the given files.
    ///
    /// Names are normalized and invalid ones dropped; duplicate names
    /// within the batch resolve to the last occurrence. Everything runs in
    /// one write transaction: records, the global version lists, the
    /// sequence, need and block indices, and the folder counts move
    /// together.
    pub fn update(&self, device: &DeviceId, files: Vec<FileInfo>) -> crate::Result<()> {
        assert!(
            *device != GLOBAL_DEVICE,
            "cannot store records for the global pseudo-device"
        );

        #[allow(clippy::expect_used)]
        let _guard = self.update_lock.lock().expect("lock poisoned");

        // Intern the device before the transaction starts
        self.db.keyer().device_idx().id(device.as_bytes())?;

        let batch = self.prepare_batch(files);

        log::debug!(
            "update folder={:?} device={device} files={}",
            self.folder,
            batch.len()
        );

        let hook = self.meta_commit_hook()?;
        let mut txn = WriteTxn::new(&self.db, vec![hook])?;
        let local = *device == LOCAL_DEVICE;

        for mut file in batch {
            if local {
                file.local_flags &= FLAG_LOCAL_ALL;
            } else {
                // Local flags are ours alone; remote records carry only
                // the wire-level invalid bit
                file.local_flags = 0;
            }

            let device_key = self
                .db
                .keyer()
                .device_key(&self.folder, device, file.name.as_bytes())?;

            if local {
                self.update_local_file(&mut txn, &device_key, file)?;
            } else {
                self.update_remote_file(&mut txn, &device_key, device, file)?;
            }

            txn.checkpoint()?;
        }

        txn.commit()
    }

    /// Normalizes, validates and dedups an incoming batch. The last
    /// occurrence of a name wins, at its original position.
    fn prepare_batch(&self, files: Vec<FileInfo>) -> Vec<FileInfo> {
        let mut seen = FxHashSet::default();
        let mut batch: Vec<FileInfo> = Vec::with_capacity(files.len());

        for mut file in files.into_iter().rev() {
            let name = self
                .db
                .config()
                .normalizer
                .normalize(&file.name)
                .into_owned();

            if !valid_name(&name) {
                log::warn!("dropping record with unusable name {:?}", file.name);
                continue;
            }
            file.name = name;

            if !seen.insert(file.name.clone()) {
                continue;
            }
            batch.push(file);
        }

        batch.reverse();
        batch
    }

    fn unchanged<A: FileItem + ?Sized, B: FileItem + ?Sized>(existing: &A, new: &B) -> bool {
        existing.file_version() == new.file_version()
            && existing.is_invalid() == new.is_invalid()
            && existing.local_flags() == new.local_flags()
    }

    fn update_local_file(
        &self,
        txn: &mut WriteTxn<'_>,
        device_key: &[u8],
        mut file: FileInfo,
    ) -> crate::Result<()> {
        let existing = txn.get_file_by_key(device_key)?;

        if let Some(existing) = &existing {
            if Self::unchanged(existing, &file) {
                return Ok(());
            }

            self.remove_local_content_entries(txn, existing)?;
            self.lock_meta().remove_file(&LOCAL_DEVICE, existing);
        }

        file.sequence = self.lock_meta().next_local_sequence();
        self.lock_meta().add_file(&LOCAL_DEVICE, &file);

        txn.update_global(&self.folder, &LOCAL_DEVICE, &file, &self.meta)?;

        let blocks_hash = txn.put_file(device_key, &file)?;

        let sequence_key = self.db.keyer().sequence_key(&self.folder, file.sequence)?;
        txn.put(&sequence_key, device_key)?;

        if Self::has_content_entries(&file) {
            for (index, block) in file.blocks.iter().enumerate() {
                let block_key =
                    self.db
                        .keyer()
                        .block_key(&self.folder, &block.hash, file.name.as_bytes())?;
                let mut raw = [0; 4];
                #[allow(clippy::cast_possible_truncation)]
                BigEndian::write_u32(&mut raw, index as u32);
                txn.put(&block_key, &raw)?;
            }

            if let Some(hash) = blocks_hash {
                let map_key =
                    self.db
                        .keyer()
                        .block_list_map_key(&self.folder, &hash, file.name.as_bytes())?;
                txn.put(&map_key, b"")?;
            }
        }

        Ok(())
    }

    fn update_remote_file(
        &self,
        txn: &mut WriteTxn<'_>,
        device_key: &[u8],
        device: &DeviceId,
        file: FileInfo,
    ) -> crate::Result<()> {
        let existing = txn.get_file_truncated_by_key(device_key)?;

        if let Some(existing) = &existing {
            if Self::unchanged(existing, &file) {
                return Ok(());
            }

            self.lock_meta().remove_file(device, existing);
        }

        self.lock_meta().add_file(device, &file);

        txn.update_global(&self.folder, device, &file, &self.meta)?;
        txn.put_file(device_key, &file)?;

        Ok(())
    }

    fn has_content_entries<F: FileItem + ?Sized>(file: &F) -> bool {
        file.file_type() == FileType::Regular && !file.is_deleted() && !file.is_invalid()
    }

    fn remove_local_content_entries(
        &self,
        txn: &mut WriteTxn<'_>,
        existing: &FileInfo,
    ) -> crate::Result<()> {
        if existing.sequence > 0 {
            if let Some(key) = self
                .db
                .keyer()
                .sequence_key_ro(&self.folder, existing.sequence)
            {
                txn.delete(&key)?;
            }
        }

        if !Self::has_content_entries(existing) {
            return Ok(());
        }

        for block in &existing.blocks {
            if let Some(key) = self
                .db
                .keyer()
                .block_prefix_ro(&self.folder, &block.hash)
                .map(|mut prefix| {
                    prefix.extend_from_slice(existing.name.as_bytes());
                    prefix
                })
            {
                txn.delete(&key)?;
            }
        }

        if !existing.blocks_hash.is_empty() {
            if let Some(key) = self
                .db
                .keyer()
                .block_list_map_prefix_ro(&self.folder, &existing.blocks_hash)
                .map(|mut prefix| {
                    prefix.extend_from_slice(existing.name.as_bytes());
                    prefix
                })
            {
                txn.delete(&key)?;
            }
        }

        Ok(())
    }

    /// Removes every record of one device, rewriting the affected global
    /// version lists and the need and count state, and, for the local
    /// device, clearing the block, block-list-map, sequence and need
    /// indices.
    pub fn drop_device(&self, device: &DeviceId) -> crate::Result<()> {
        assert!(
            *device != GLOBAL_DEVICE,
            "cannot drop the global pseudo-device"
        );

        #[allow(clippy::expect_used)]
        let _guard = self.update_lock.lock().expect("lock poisoned");

        log::debug!("drop device folder={:?} device={device}", self.folder);

        let hook = self.meta_commit_hook()?;
        let mut txn = WriteTxn::new(&self.db, vec![hook])?;
        let local = *device == LOCAL_DEVICE;

        if let Some(prefix) = self.db.keyer().device_prefix_ro(&self.folder, Some(device)) {
            let entries: Vec<(Vec<u8>, Vec<u8>)> = {
                let mut entries = vec![];
                for kv in txn.iter_prefix(&prefix) {
                    let (key, _) = kv?;
                    let Some(name) = self.db.keyer().name_from_device_key(&key) else {
                        continue;
                    };
                    let name = name.to_vec();
                    entries.push((key, name));
                }
                entries
            };

            for (key, name) in entries {
                txn.remove_from_global(&self.folder, device, &name, &self.meta)?;
                txn.delete(&key)?;
                txn.checkpoint()?;
            }
        }

        if local {
            for prefix in [
                self.db.keyer().block_prefix_ro(&self.folder, b""),
                self.db.keyer().block_list_map_prefix_ro(&self.folder, b""),
                self.db.keyer().sequence_prefix_ro(&self.folder),
                self.db.keyer().need_key_ro(&self.folder, b""),
            ]
            .into_iter()
            .flatten()
            {
                txn.delete_prefix(&prefix)?;
            }
        }

        {
            let mut meta = self.lock_meta();
            let local_sequence = meta.sequence(&LOCAL_DEVICE);
            meta.remove_device(device);
            if local {
                // Sequences stay monotonic across a local drop
                meta.restore_local_sequence(local_sequence);
            }
        }

        txn.commit()
    }

    // --- point reads ---

    /// The device's record for one name.
    pub fn get(&self, device: &DeviceId, name: &str) -> crate::Result<Option<FileInfo>> {
        let name = self.db.config().normalizer.normalize(name).into_owned();
        let txn = ReadTxn::new(&self.db)?;
        txn.get_file(&self.folder, device, name.as_bytes())
    }

    /// The global (winner) record for one name.
    pub fn get_global(&self, name: &str) -> crate::Result<Option<FileInfo>> {
        let name = self.db.config().normalizer.normalize(name).into_owned();
        let txn = ReadTxn::new(&self.db)?;
        txn.get_global_file(&self.folder, name.as_bytes())
    }

    /// Truncated variant of [`Self::get_global`].
    pub fn get_global_truncated(&self, name: &str) -> crate::Result<Option<FileInfoTruncated>> {
        let name = self.db.config().normalizer.normalize(name).into_owned();
        let txn = ReadTxn::new(&self.db)?;
        txn.get_global_file_truncated(&self.folder, name.as_bytes())
    }

    /// The devices holding a usable copy of the current global version of
    /// a name.
    pub fn availability(&self, name: &str) -> crate::Result<Vec<DeviceId>> {
        let name = self.db.config().normalizer.normalize(name).into_owned();
        let txn = ReadTxn::new(&self.db)?;

        Ok(txn
            .get_version_list(&self.folder, name.as_bytes())?
            .as_ref()
            .and_then(VersionList::get_global)
            .map(|fv| fv.devices.clone())
            .unwrap_or_default())
    }

    // --- iterators ---

    /// Calls `f` for every record the device has, in name order,
    /// restricted to `prefix` when non-empty. Returning `false` stops the
    /// iteration.
    ///
    /// A non-empty prefix first delivers the record at exactly `prefix`,
    /// then everything under `prefix/`.
    pub fn with_have<F>(&self, device: &DeviceId, prefix: &str, f: F) -> crate::Result<()>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        self.with_have_inner(device, prefix, load_file_by_key, f)
    }

    /// Truncated variant of [`Self::with_have`].
    pub fn with_have_truncated<F>(&self, device: &DeviceId, prefix: &str, f: F) -> crate::Result<()>
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        self.with_have_inner(device, prefix, load_truncated_by_key, f)
    }

    fn with_have_inner<T, L, F>(
        &self,
        device: &DeviceId,
        prefix: &str,
        load: L,
        mut f: F,
    ) -> crate::Result<()>
    where
        L: Fn(&ReadTxn<'_>, &[u8]) -> crate::Result<Option<T>>,
        F: FnMut(&T) -> bool,
    {
        let txn = ReadTxn::new(&self.db)?;

        let Some(base) = self.db.keyer().device_prefix_ro(&self.folder, Some(device)) else {
            return Ok(());
        };

        let prefix = self.db.config().normalizer.normalize(prefix);

        let scan_prefix = if prefix.is_empty() {
            base
        } else {
            // Deliver the unslashed exact match first, then descend
            let mut exact = base.clone();
            exact.extend_from_slice(prefix.as_bytes());

            match load(&txn, &exact) {
                Ok(Some(file)) => {
                    if !f(&file) {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(Error::Decode(e)) => {
                    log::warn!("undecodable record at prefix, skipping: {e}");
                }
                Err(e) => return Err(e),
            }

            exact.push(b'/');
            exact
        };

        for kv in txn.iter_prefix(&scan_prefix) {
            let (key, _) = kv?;

            match load(&txn, &key) {
                Ok(Some(file)) => {
                    if !f(&file) {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(Error::Decode(e)) => {
                    log::warn!("undecodable record during scan, skipping: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Calls `f` for the global (winner) record of every name, in name
    /// order, restricted to `prefix` when non-empty. Returning `false`
    /// stops the iteration.
    pub fn with_global<F>(&self, prefix: &str, f: F) -> crate::Result<()>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        self.with_global_inner(prefix, load_global_file, f)
    }

    /// Truncated variant of [`Self::with_global`].
    pub fn with_global_truncated<F>(&self, prefix: &str, f: F) -> crate::Result<()>
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        self.with_global_inner(prefix, load_global_truncated, f)
    }

    fn with_global_inner<T, L, F>(&self, prefix: &str, load: L, mut f: F) -> crate::Result<()>
    where
        L: Fn(&ReadTxn<'_>, &str, &FileVersion, &[u8]) -> crate::Result<T>,
        F: FnMut(&T) -> bool,
    {
        let txn = ReadTxn::new(&self.db)?;

        let Some(base) = self.db.keyer().global_key_ro(&self.folder, b"") else {
            return Ok(());
        };

        let prefix = self.db.config().normalizer.normalize(prefix);

        let scan_prefix = if prefix.is_empty() {
            base
        } else {
            let mut exact = base.clone();
            exact.extend_from_slice(prefix.as_bytes());

            if let Some(raw) = txn.tx().get(&exact)? {
                if let Some(file) =
                    self.global_from_raw(&txn, &load, prefix.as_bytes(), &raw)?
                {
                    if !f(&file) {
                        return Ok(());
                    }
                }
            }

            exact.push(b'/');
            exact
        };

        for kv in txn.iter_prefix(&scan_prefix) {
            let (key, value) = kv?;

            let Some(name) = self.db.keyer().name_from_global_key(&key) else {
                continue;
            };

            if let Some(file) = self.global_from_raw(&txn, &load, name, &value)? {
                if !f(&file) {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn global_from_raw<T, L>(
        &self,
        txn: &ReadTxn<'_>,
        load: &L,
        name: &[u8],
        raw: &[u8],
    ) -> crate::Result<Option<T>>
    where
        L: Fn(&ReadTxn<'_>, &str, &FileVersion, &[u8]) -> crate::Result<T>,
    {
        let list = match VersionList::decode_from_slice(raw) {
            Ok(list) => list,
            Err(e) => {
                log::warn!("undecodable version list during scan, skipping: {e}");
                return Ok(None);
            }
        };

        let Some(global) = list.get_global() else {
            return Ok(None);
        };

        load(txn, &self.folder, global, name).map(Some)
    }

    /// Calls `f` for every file the device needs to match the global
    /// state, in name order. Returning `false` stops the iteration.
    ///
    /// For the local device this walks the materialized need index; for
    /// remote devices it evaluates the need predicate over the global
    /// lists.
    pub fn with_need<F>(&self, device: &DeviceId, f: F) -> crate::Result<()>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        self.with_need_inner(device, load_global_file, f)
    }

    /// Truncated variant of [`Self::with_need`].
    pub fn with_need_truncated<F>(&self, device: &DeviceId, f: F) -> crate::Result<()>
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        self.with_need_inner(device, load_global_truncated, f)
    }

    fn with_need_inner<T, L, F>(&self, device: &DeviceId, load: L, mut f: F) -> crate::Result<()>
    where
        L: Fn(&ReadTxn<'_>, &str, &FileVersion, &[u8]) -> crate::Result<T>,
        F: FnMut(&T) -> bool,
    {
        let txn = ReadTxn::new(&self.db)?;

        if *device == LOCAL_DEVICE {
            let Some(prefix) = self.db.keyer().need_key_ro(&self.folder, b"") else {
                return Ok(());
            };

            for kv in txn.iter_prefix(&prefix) {
                let (key, _) = kv?;

                let Some(name) = self.db.keyer().name_from_global_key(&key) else {
                    continue;
                };

                let Some(list) = txn.get_version_list(&self.folder, name)? else {
                    log::warn!("need entry without version list, skipping");
                    continue;
                };
                let Some(global) = list.get_global() else {
                    continue;
                };

                if !f(&load(&txn, &self.folder, global, name)?) {
                    return Ok(());
                }
            }

            return Ok(());
        }

        let Some(prefix) = self.db.keyer().global_key_ro(&self.folder, b"") else {
            return Ok(());
        };

        for kv in txn.iter_prefix(&prefix) {
            let (key, value) = kv?;

            let Some(name) = self.db.keyer().name_from_global_key(&key) else {
                continue;
            };

            let list = match VersionList::decode_from_slice(&value) {
                Ok(list) => list,
                Err(e) => {
                    log::warn!("undecodable version list during scan, skipping: {e}");
                    continue;
                }
            };
            let Some(global) = list.get_global() else {
                continue;
            };

            let (have, version) = match list.version_of(device) {
                Some(fv) => (true, fv.version.clone()),
                None => (false, crate::vector::Vector::new()),
            };

            if !need(global, have, &version) {
                continue;
            }

            if !f(&load(&txn, &self.folder, global, name)?) {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Calls `f` for every local record with sequence at or above
    /// `start`, in sequence order. Returning `false` stops the iteration.
    pub fn with_have_sequence<F>(&self, start: i64, f: F) -> crate::Result<()>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        let mut f = f;
        let txn = ReadTxn::new(&self.db)?;

        let (Some(first), Some(prefix)) = (
            self.db.keyer().sequence_key_ro(&self.folder, start.max(0)),
            self.db.keyer().sequence_prefix_ro(&self.folder),
        ) else {
            return Ok(());
        };

        let Some(last) = prefix_upper_bound(&prefix) else {
            return Ok(());
        };

        for kv in txn.iter_range(&first, &last) {
            let (key, device_key) = kv?;

            match txn.get_file_by_key(&device_key) {
                Ok(Some(file)) => {
                    if file.sequence != self.db.keyer().sequence_from_sequence_key(&key).unwrap_or(0)
                    {
                        log::warn!(
                            "sequence entry out of step with record {:?}, skipping",
                            file.name
                        );
                        continue;
                    }
                    if !f(&file) {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    log::warn!("dangling sequence entry, skipping");
                }
                Err(Error::Decode(e)) => {
                    log::warn!("undecodable record during sequence scan, skipping: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Calls `f` for every usable local file whose block list has the
    /// given content address. Returning `false` stops the iteration.
    pub fn with_blocks_hash<F>(&self, hash: &[u8], f: F) -> crate::Result<()>
    where
        F: FnMut(&FileInfoTruncated) -> bool,
    {
        let mut f = f;
        let txn = ReadTxn::new(&self.db)?;

        let Some(prefix) = self.db.keyer().block_list_map_prefix_ro(&self.folder, hash) else {
            return Ok(());
        };

        for kv in txn.iter_prefix(&prefix) {
            let (key, _) = kv?;

            let Some(name) = self.db.keyer().name_from_block_key(&key) else {
                continue;
            };

            let Some(device_key) = self
                .db
                .keyer()
                .device_key_ro(&self.folder, &LOCAL_DEVICE, name)
            else {
                continue;
            };

            match txn.get_file_truncated_by_key(&device_key) {
                Ok(Some(file)) => {
                    if file.blocks_hash != hash {
                        continue;
                    }
                    if !f(&file) {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    log::warn!("dangling block list map entry, skipping");
                }
                Err(Error::Decode(e)) => {
                    log::warn!("undecodable record during block map scan, skipping: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    // --- metadata accessors ---

    /// Counts of the local device's unflagged records.
    #[must_use]
    pub fn local_size(&self) -> Counts {
        self.lock_meta().counts(&LOCAL_DEVICE, 0)
    }

    /// Counts over the global winners.
    #[must_use]
    pub fn global_size(&self) -> Counts {
        self.lock_meta().counts(&GLOBAL_DEVICE, 0)
    }

    /// Counts of locally changed records in a receive-only folder.
    #[must_use]
    pub fn receive_only_changed_size(&self) -> Counts {
        self.lock_meta().counts(&LOCAL_DEVICE, FLAG_LOCAL_RECEIVE_ONLY)
    }

    /// How many files the device needs to match the global state.
    #[must_use]
    pub fn need_size(&self, device: &DeviceId) -> i64 {
        self.lock_meta().need_count(device)
    }

    /// The highest sequence number known for the device.
    #[must_use]
    pub fn sequence(&self, device: &DeviceId) -> i64 {
        self.lock_meta().sequence(device)
    }

    // --- index IDs ---

    /// The index ID for one device's view of this folder.
    ///
    /// For the local device a fresh random ID is generated and stored on
    /// first use; for remote devices an unannounced ID reads as zero.
    pub fn index_id(&self, device: &DeviceId) -> crate::Result<IndexId> {
        let key = self.db.keyer().index_id_key(device, &self.folder)?;

        if let Some(raw) = self.db.backend().get(&key)? {
            if raw.len() == 8 {
                return Ok(IndexId(BigEndian::read_u64(&raw)));
            }
            log::warn!("malformed index ID for {device}, regenerating");
        }

        if *device != LOCAL_DEVICE {
            return Ok(IndexId(0));
        }

        let id = IndexId::random();
        self.set_index_id(device, id)?;
        Ok(id)
    }

    /// Stores an index ID for one device's view of this folder.
    pub fn set_index_id(&self, device: &DeviceId, id: IndexId) -> crate::Result<()> {
        let key = self.db.keyer().index_id_key(device, &self.folder)?;
        let mut raw = [0; 8];
        BigEndian::write_u64(&mut raw, id.0);
        self.db.backend().put(&key, &raw)
    }
}
