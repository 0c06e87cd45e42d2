// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use crate::backend::Backend;
use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};

/// A persisted, bidirectional `bytes ↔ u32` mapping with monotonic
/// allocation, used to intern folder labels and device identifiers into
/// the compact indices that key layouts are built from.
///
/// Identifiers are never reused; a deleted mapping leaves a gap. The
/// next free identifier is recovered by a prefix scan at load time.
pub struct SmallIndex {
    backend: Arc<dyn Backend>,
    prefix: u8,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    id_to_val: FxHashMap<u32, Vec<u8>>,
    val_to_id: FxHashMap<Vec<u8>, u32>,
    next_id: u32,
}

impl SmallIndex {
    /// Loads the index stored under the given key-type prefix.
    pub fn load(backend: Arc<dyn Backend>, prefix: u8) -> crate::Result<Self> {
        let mut inner = Inner::default();

        {
            let tx = backend.new_read_transaction()?;
            for kv in tx.iter_prefix(&[prefix]) {
                let (key, val) = kv?;

                let Some(raw) = key.get(1..5) else {
                    log::warn!("smallIndex: malformed key {key:?}, ignoring");
                    continue;
                };
                let id = BigEndian::read_u32(raw);

                inner.val_to_id.insert(val.clone(), id);
                inner.id_to_val.insert(id, val);

                if id >= inner.next_id {
                    inner.next_id = id + 1;
                }
            }
        }

        Ok(Self {
            backend,
            prefix,
            inner: Mutex::new(inner),
        })
    }

    /// Returns the identifier for `val`, allocating and persisting a new
    /// one if it has not been seen before.
    ///
    /// Allocation writes through the backend directly, so this must not be
    /// called while a write transaction is open; callers intern everything
    /// they need up front.
    pub fn id(&self, val: &[u8]) -> crate::Result<u32> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock poisoned");

        if let Some(id) = inner.val_to_id.get(val) {
            return Ok(*id);
        }

        let id = inner.next_id;

        let mut key = [0; 5];
        key[0] = self.prefix;
        BigEndian::write_u32(&mut key[1..], id);
        self.backend.put(&key, val)?;

        inner.next_id += 1;
        inner.val_to_id.insert(val.to_vec(), id);
        inner.id_to_val.insert(id, val.to_vec());

        Ok(id)
    }

    /// Returns the identifier for `val` if one has been allocated.
    ///
    /// Read paths use this so that looking up something never seen does
    /// not allocate an identifier for it.
    #[must_use]
    pub fn id_ro(&self, val: &[u8]) -> Option<u32> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock poisoned");
        inner.val_to_id.get(val).copied()
    }

    /// Reverse lookup; total over allocated identifiers.
    #[must_use]
    pub fn val(&self, id: u32) -> Option<Vec<u8>> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock poisoned");
        inner.id_to_val.get(&id).cloned()
    }

    /// All allocated `(id, value)` pairs, in allocation order.
    #[must_use]
    pub fn entries(&self) -> Vec<(u32, Vec<u8>)> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("lock poisoned");

        let mut entries: Vec<_> = inner
            .id_to_val
            .iter()
            .map(|(id, val)| (*id, val.clone()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use test_log::test;

    #[test]
    fn allocates_monotonically_and_persists() -> crate::Result<()> {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

        let idx = SmallIndex::load(Arc::clone(&backend), 6)?;
        assert_eq!(0, idx.id(b"alpha")?);
        assert_eq!(1, idx.id(b"beta")?);
        assert_eq!(0, idx.id(b"alpha")?);
        assert_eq!(Some(b"beta".to_vec()), idx.val(1));
        assert_eq!(None, idx.val(2));

        // Reload from the backend
        let idx = SmallIndex::load(Arc::clone(&backend), 6)?;
        assert_eq!(Some(0), idx.id_ro(b"alpha"));
        assert_eq!(None, idx.id_ro(b"gamma"));
        assert_eq!(2, idx.id(b"gamma")?);

        Ok(())
    }

    #[test]
    fn separate_prefixes_do_not_collide() -> crate::Result<()> {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

        let folders = SmallIndex::load(Arc::clone(&backend), 6)?;
        let devices = SmallIndex::load(Arc::clone(&backend), 7)?;

        assert_eq!(0, folders.id(b"f")?);
        assert_eq!(0, devices.id(b"d")?);

        let folders = SmallIndex::load(Arc::clone(&backend), 6)?;
        assert_eq!(vec![(0, b"f".to_vec())], folders.entries());

        Ok(())
    }
}
