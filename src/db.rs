// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use crate::{
    backend::Backend,
    coding::{Decode, DecodeError, Encode, EncodeError},
    config::Config,
    events::EventLogger,
    gc::{self, GcStats, StopSignal},
    keyer::{
        Keyer, KEY_TYPE_BLOCK, KEY_TYPE_BLOCK_LIST_MAP, KEY_TYPE_DEVICE, KEY_TYPE_DEVICE_IDX,
        KEY_TYPE_FOLDER_IDX, KEY_TYPE_GLOBAL, KEY_TYPE_INDEX_ID, KEY_TYPE_NEED, KEY_TYPE_SEQUENCE,
        KEY_TYPE_VIRTUAL_MTIME,
    },
    migrations, repair,
    smallindex::SmallIndex,
    txn::WriteTxn,
};
use byteorder::{BigEndian, ByteOrder};
use std::{
    io::Read,
    sync::{Arc, RwLock},
};
use varint_rs::{VarintReader, VarintWriter};

/// The file-index database: one backend, shared by any number of
/// per-folder [`crate::FileSet`]s.
///
/// Owns the interning indices, the key codec and the GC lock. All normal
/// operations take the GC lock shared; the indirection GC takes it
/// exclusive so no writer can introduce a reference between its mark and
/// sweep phases.
pub struct Db {
    backend: Arc<dyn Backend>,
    keyer: Keyer,
    gc_lock: RwLock<()>,
    config: Config,
}

impl Db {
    pub(crate) fn open(backend: Arc<dyn Backend>, config: Config) -> crate::Result<Arc<Self>> {
        let folder_idx = Arc::new(SmallIndex::load(Arc::clone(&backend), KEY_TYPE_FOLDER_IDX)?);
        let device_idx = Arc::new(SmallIndex::load(Arc::clone(&backend), KEY_TYPE_DEVICE_IDX)?);

        let db = Self {
            backend,
            keyer: Keyer::new(folder_idx, device_idx),
            gc_lock: RwLock::new(()),
            config,
        };

        migrations::run(&db)?;

        Ok(Arc::new(db))
    }

    /// The backend this database runs on.
    #[doc(hidden)]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// The key codec.
    #[doc(hidden)]
    #[must_use]
    pub fn keyer(&self) -> &Keyer {
        &self.keyer
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn events(&self) -> &dyn EventLogger {
        self.config.events.as_ref()
    }

    pub(crate) fn gc_lock(&self) -> &RwLock<()> {
        &self.gc_lock
    }

    /// Every folder label ever seen, in allocation order.
    #[must_use]
    pub fn folders(&self) -> Vec<String> {
        self.keyer
            .folder_idx()
            .entries()
            .into_iter()
            .filter_map(|(_, val)| String::from_utf8(val).ok())
            .collect()
    }

    /// Closes the underlying backend; all subsequent operations fail with
    /// [`crate::Error::Closed`].
    pub fn close(&self) -> crate::Result<()> {
        self.backend.close()
    }

    // --- misc singletons (schema version and friends) ---

    pub(crate) fn misc_bytes(&self, name: &str) -> crate::Result<Option<Vec<u8>>> {
        self.backend.get(&self.keyer.misc_key(name))
    }

    pub(crate) fn put_misc_bytes(&self, name: &str, value: &[u8]) -> crate::Result<()> {
        self.backend.put(&self.keyer.misc_key(name), value)
    }

    pub(crate) fn misc_u64(&self, name: &str) -> crate::Result<Option<u64>> {
        Ok(self
            .misc_bytes(name)?
            .filter(|raw| raw.len() == 8)
            .map(|raw| BigEndian::read_u64(&raw)))
    }

    pub(crate) fn put_misc_u64(&self, name: &str, value: u64) -> crate::Result<()> {
        let mut raw = [0; 8];
        BigEndian::write_u64(&mut raw, value);
        self.put_misc_bytes(name, &raw)
    }

    pub(crate) fn misc_string(&self, name: &str) -> crate::Result<Option<String>> {
        Ok(self
            .misc_bytes(name)?
            .and_then(|raw| String::from_utf8(raw).ok()))
    }

    pub(crate) fn put_misc_string(&self, name: &str, value: &str) -> crate::Result<()> {
        self.put_misc_bytes(name, value.as_bytes())
    }

    // --- folder-level operations ---

    /// Deletes every key belonging to the folder: records, globals,
    /// sequence and need indices, block maps, virtual mtimes, metadata
    /// and index IDs. Content-addressed blobs are left to the GC.
    pub fn drop_folder(&self, folder: &str) -> crate::Result<()> {
        let Some(folder_id) = self.keyer.folder_idx().id_ro(folder.as_bytes()) else {
            return Ok(());
        };

        log::debug!("dropping folder {folder:?}");

        let mut folder_id_raw = [0; 4];
        BigEndian::write_u32(&mut folder_id_raw, folder_id);

        let mut txn = WriteTxn::new(self, vec![])?;

        for key_type in [
            KEY_TYPE_DEVICE,
            KEY_TYPE_GLOBAL,
            KEY_TYPE_BLOCK,
            KEY_TYPE_VIRTUAL_MTIME,
            KEY_TYPE_SEQUENCE,
            KEY_TYPE_NEED,
            KEY_TYPE_BLOCK_LIST_MAP,
        ] {
            let mut prefix = Vec::with_capacity(5);
            prefix.push(key_type);
            prefix.extend_from_slice(&folder_id_raw);
            txn.delete_prefix(&prefix)?;
        }

        if let Some(meta_key) = self.keyer.folder_meta_key_ro(folder) {
            txn.delete(&meta_key)?;
        }

        // Index IDs key on (device, folder), so filter a full scan
        let index_id_keys: Vec<Vec<u8>> = {
            let mut keys = vec![];
            for kv in txn.iter_prefix(&[KEY_TYPE_INDEX_ID]) {
                let (key, _) = kv?;
                if self.keyer.folder_idx_from_index_id_key(&key) == Some(folder_id) {
                    keys.push(key);
                }
            }
            keys
        };
        for key in index_id_keys {
            txn.delete(&key)?;
        }

        txn.commit()
    }

    /// Forgets every stored index ID, across all folders and devices.
    ///
    /// The local IDs regenerate on next use and peers treat previously
    /// transferred index data as void; remote IDs read as zero until
    /// announced again.
    pub fn drop_index_ids(&self) -> crate::Result<()> {
        log::debug!("dropping all index IDs");

        let mut txn = WriteTxn::new(self, vec![])?;
        txn.delete_prefix(&[KEY_TYPE_INDEX_ID])?;
        txn.commit()
    }

    /// Runs the repair passes for one folder and returns the total number
    /// of fixed records. See the repair module for what gets checked.
    pub fn check_repair(&self, folder: &str) -> crate::Result<usize> {
        repair::check_repair(self, folder)
    }

    /// Runs the mark-and-sweep pass over the content-addressed block
    /// lists and version vectors, deleting everything no device record
    /// references anymore.
    ///
    /// Takes the GC lock exclusively; `signal` can abort between phases
    /// and between individual deletes, leaving a safe partial result.
    pub fn gc_indirect(&self, signal: &StopSignal) -> crate::Result<GcStats> {
        gc::gc_indirect(self, signal)
    }

    /// The virtual mtime store for one folder.
    #[must_use]
    pub fn mtimes(self: &Arc<Self>, folder: &str) -> MtimeStore {
        MtimeStore {
            db: Arc::clone(self),
            folder: folder.to_owned(),
        }
    }
}

/// A stored pair of timestamps for one name: what the filesystem reports
/// and what the index pretends, for filesystems that cannot persist
/// modification times faithfully.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MtimeMapping {
    /// Modification time on disk, seconds and nanoseconds
    pub real: (i64, i32),

    /// Modification time the rest of the system should see
    pub virtual_mtime: (i64, i32),
}

impl Encode for MtimeMapping {
    fn encode_into<W: std::io::Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_i64_varint(self.real.0)?;
        writer.write_i32_varint(self.real.1)?;
        writer.write_i64_varint(self.virtual_mtime.0)?;
        writer.write_i32_varint(self.virtual_mtime.1)?;
        Ok(())
    }
}

impl Decode for MtimeMapping {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            real: (reader.read_i64_varint()?, reader.read_i32_varint()?),
            virtual_mtime: (reader.read_i64_varint()?, reader.read_i32_varint()?),
        })
    }
}

/// Per-folder view over the virtual mtime key space.
pub struct MtimeStore {
    db: Arc<Db>,
    folder: String,
}

impl MtimeStore {
    /// Returns the stored mapping for a name.
    pub fn get(&self, name: &str) -> crate::Result<Option<MtimeMapping>> {
        let Some(key) = self.db.keyer.mtime_key_ro(&self.folder, name.as_bytes()) else {
            return Ok(None);
        };

        let Some(raw) = self.db.backend.get(&key)? else {
            return Ok(None);
        };

        Ok(Some(MtimeMapping::decode_from_slice(&raw)?))
    }

    /// Stores a mapping for a name.
    pub fn insert(&self, name: &str, mapping: &MtimeMapping) -> crate::Result<()> {
        let key = self.db.keyer.mtime_key(&self.folder, name.as_bytes())?;
        self.db.backend.put(&key, &mapping.encode_into_vec())
    }

    /// Removes the mapping for a name, if present.
    pub fn remove(&self, name: &str) -> crate::Result<()> {
        let Some(key) = self.db.keyer.mtime_key_ro(&self.folder, name.as_bytes()) else {
            return Ok(());
        };
        self.db.backend.delete(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use test_log::test;

    fn open() -> Arc<Db> {
        Config::new().open(Arc::new(MemoryBackend::new())).unwrap()
    }

    #[test]
    fn misc_roundtrip() -> crate::Result<()> {
        let db = open();

        assert_eq!(None, db.misc_u64("x")?);
        db.put_misc_u64("x", 42)?;
        assert_eq!(Some(42), db.misc_u64("x")?);

        db.put_misc_string("s", "hello")?;
        assert_eq!(Some("hello".into()), db.misc_string("s")?);

        Ok(())
    }

    #[test]
    fn mtime_store() -> crate::Result<()> {
        let db = open();
        let mtimes = db.mtimes("default");

        assert_eq!(None, mtimes.get("a")?);

        let mapping = MtimeMapping {
            real: (100, 1),
            virtual_mtime: (200, 2),
        };
        mtimes.insert("a", &mapping)?;
        assert_eq!(Some(mapping), mtimes.get("a")?);

        mtimes.remove("a")?;
        assert_eq!(None, mtimes.get("a")?);

        Ok(())
    }
}
