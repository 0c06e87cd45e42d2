// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

//! Binary key layouts for all key spaces.
//!
//! Every read pattern in the index is a lexicographic prefix or range scan
//! over one of these layouts, so the byte order here is load-bearing: all
//! integers are big-endian, and folder/device identifiers are interned
//! 32-bit indices so keys stay short and uniform.

use crate::{device::DeviceId, smallindex::SmallIndex};
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;

/// Per-device file records: `folderID ‖ deviceID ‖ name` → `FileInfo`
pub const KEY_TYPE_DEVICE: u8 = 0;

/// Global version lists: `folderID ‖ name` → `VersionList`
pub const KEY_TYPE_GLOBAL: u8 = 1;

/// Local block index: `folderID ‖ hash ‖ name` → block index (u32)
pub const KEY_TYPE_BLOCK: u8 = 2;

// 3 and 4 were retired key spaces of earlier schema generations.

/// Virtual mtime mappings: `folderID ‖ name` → `MtimeMapping`
pub const KEY_TYPE_VIRTUAL_MTIME: u8 = 5;

/// Folder index: `folderID` → folder label
pub const KEY_TYPE_FOLDER_IDX: u8 = 6;

/// Device index: `deviceID` → device identifier bytes
pub const KEY_TYPE_DEVICE_IDX: u8 = 7;

/// Index IDs: `deviceID ‖ folderID` → `IndexId`
pub const KEY_TYPE_INDEX_ID: u8 = 8;

/// Folder metadata: `folderID` → `CountsSet`
pub const KEY_TYPE_FOLDER_META: u8 = 9;

/// Miscellaneous singletons, keyed by name (schema version and friends)
pub const KEY_TYPE_MISC_DATA: u8 = 10;

/// Sequence index: `folderID ‖ sequence` → device key of the record
pub const KEY_TYPE_SEQUENCE: u8 = 11;

/// Local need set: `folderID ‖ name` → empty
pub const KEY_TYPE_NEED: u8 = 12;

/// Content-addressed block lists: `hash` → `BlockList`
pub const KEY_TYPE_BLOCK_LIST: u8 = 13;

/// Which local files use a block list: `folderID ‖ hash ‖ name` → empty
pub const KEY_TYPE_BLOCK_LIST_MAP: u8 = 14;

/// Content-addressed version vectors: `hash` → `Vector`
pub const KEY_TYPE_VERSION: u8 = 15;

const FOLDER_IDX_LEN: usize = 4;
const DEVICE_IDX_LEN: usize = 4;
const HASH_LEN: usize = 32;

/// Header length of a device key: type, folder index, device index.
pub const DEVICE_KEY_HEADER_LEN: usize = 1 + FOLDER_IDX_LEN + DEVICE_IDX_LEN;

/// Header length of the keys that embed a 32-byte hash after the folder.
pub const HASHED_KEY_HEADER_LEN: usize = 1 + FOLDER_IDX_LEN + HASH_LEN;

/// Encodes and decodes keys, translating folder labels and device
/// identifiers through the two interning indices.
///
/// The `*_ro` variants refuse to allocate: they return `None` when the
/// folder or device has never been seen, which read paths translate to
/// "no such record".
pub struct Keyer {
    folder_idx: Arc<SmallIndex>,
    device_idx: Arc<SmallIndex>,
}

impl Keyer {
    pub(crate) fn new(folder_idx: Arc<SmallIndex>, device_idx: Arc<SmallIndex>) -> Self {
        Self {
            folder_idx,
            device_idx,
        }
    }

    pub(crate) fn folder_idx(&self) -> &SmallIndex {
        &self.folder_idx
    }

    pub(crate) fn device_idx(&self) -> &SmallIndex {
        &self.device_idx
    }

    fn build(parts: &[&[u8]]) -> Vec<u8> {
        let mut key = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            key.extend_from_slice(part);
        }
        key
    }

    fn idx_bytes(id: u32) -> [u8; 4] {
        let mut buf = [0; 4];
        BigEndian::write_u32(&mut buf, id);
        buf
    }

    /// Key of one device's record for one name.
    pub fn device_key(
        &self,
        folder: &str,
        device: &DeviceId,
        name: &[u8],
    ) -> crate::Result<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id(folder.as_bytes())?);
        let device_id = Self::idx_bytes(self.device_idx.id(device.as_bytes())?);
        Ok(Self::build(&[
            &[KEY_TYPE_DEVICE],
            &folder_id,
            &device_id,
            name,
        ]))
    }

    /// Read-only variant of [`Self::device_key`].
    #[must_use]
    pub fn device_key_ro(&self, folder: &str, device: &DeviceId, name: &[u8]) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        let device_id = Self::idx_bytes(self.device_idx.id_ro(device.as_bytes())?);
        Some(Self::build(&[
            &[KEY_TYPE_DEVICE],
            &folder_id,
            &device_id,
            name,
        ]))
    }

    /// Scan prefix over one device's records, or over all devices of the
    /// folder when `device` is `None`.
    #[must_use]
    pub fn device_prefix_ro(&self, folder: &str, device: Option<&DeviceId>) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        match device {
            Some(device) => {
                let device_id = Self::idx_bytes(self.device_idx.id_ro(device.as_bytes())?);
                Some(Self::build(&[&[KEY_TYPE_DEVICE], &folder_id, &device_id]))
            }
            None => Some(Self::build(&[&[KEY_TYPE_DEVICE], &folder_id])),
        }
    }

    /// Name portion of a device key.
    #[must_use]
    pub fn name_from_device_key<'k>(&self, key: &'k [u8]) -> Option<&'k [u8]> {
        key.get(DEVICE_KEY_HEADER_LEN..)
    }

    /// Folder label of any key that carries the folder index right after
    /// the type byte (device, global, block, sequence, need, mtime).
    #[must_use]
    pub fn folder_from_key(&self, key: &[u8]) -> Option<String> {
        let raw = key.get(1..1 + FOLDER_IDX_LEN)?;
        let val = self.folder_idx.val(BigEndian::read_u32(raw))?;
        String::from_utf8(val).ok()
    }

    /// Device identifier a device key belongs to.
    #[must_use]
    pub fn device_from_device_key(&self, key: &[u8]) -> Option<DeviceId> {
        let raw = key.get(1 + FOLDER_IDX_LEN..DEVICE_KEY_HEADER_LEN)?;
        let val = self.device_idx.val(BigEndian::read_u32(raw))?;
        DeviceId::from_bytes(&val)
    }

    /// Key of the global version list for one name.
    pub fn global_key(&self, folder: &str, name: &[u8]) -> crate::Result<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id(folder.as_bytes())?);
        Ok(Self::build(&[&[KEY_TYPE_GLOBAL], &folder_id, name]))
    }

    /// Read-only variant of [`Self::global_key`]; doubles as the scan
    /// prefix when `name` is empty.
    #[must_use]
    pub fn global_key_ro(&self, folder: &str, name: &[u8]) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        Some(Self::build(&[&[KEY_TYPE_GLOBAL], &folder_id, name]))
    }

    /// Name portion of a global (or need, or mtime) key.
    #[must_use]
    pub fn name_from_global_key<'k>(&self, key: &'k [u8]) -> Option<&'k [u8]> {
        key.get(1 + FOLDER_IDX_LEN..)
    }

    /// Key of one block-hash occurrence in one local file.
    pub fn block_key(&self, folder: &str, hash: &[u8], name: &[u8]) -> crate::Result<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id(folder.as_bytes())?);
        Ok(Self::build(&[&[KEY_TYPE_BLOCK], &folder_id, hash, name]))
    }

    /// Scan prefix over block keys; `hash` may be empty to cover the
    /// whole folder.
    #[must_use]
    pub fn block_prefix_ro(&self, folder: &str, hash: &[u8]) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        Some(Self::build(&[&[KEY_TYPE_BLOCK], &folder_id, hash]))
    }

    /// Name portion of a block (or block-list-map) key.
    #[must_use]
    pub fn name_from_block_key<'k>(&self, key: &'k [u8]) -> Option<&'k [u8]> {
        key.get(HASHED_KEY_HEADER_LEN..)
    }

    /// Key of the sequence index entry for one local sequence number.
    pub fn sequence_key(&self, folder: &str, sequence: i64) -> crate::Result<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id(folder.as_bytes())?);
        let mut seq = [0; 8];
        #[allow(clippy::cast_sign_loss)]
        BigEndian::write_u64(&mut seq, sequence as u64);
        Ok(Self::build(&[&[KEY_TYPE_SEQUENCE], &folder_id, &seq]))
    }

    /// Read-only variant of [`Self::sequence_key`].
    #[must_use]
    pub fn sequence_key_ro(&self, folder: &str, sequence: i64) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        let mut seq = [0; 8];
        #[allow(clippy::cast_sign_loss)]
        BigEndian::write_u64(&mut seq, sequence as u64);
        Some(Self::build(&[&[KEY_TYPE_SEQUENCE], &folder_id, &seq]))
    }

    /// Scan prefix over the folder's sequence index.
    #[must_use]
    pub fn sequence_prefix_ro(&self, folder: &str) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        Some(Self::build(&[&[KEY_TYPE_SEQUENCE], &folder_id]))
    }

    /// Sequence number stored in a sequence key.
    #[must_use]
    pub fn sequence_from_sequence_key(&self, key: &[u8]) -> Option<i64> {
        let raw = key.get(1 + FOLDER_IDX_LEN..1 + FOLDER_IDX_LEN + 8)?;
        #[allow(clippy::cast_possible_wrap)]
        Some(BigEndian::read_u64(raw) as i64)
    }

    /// Key of the local need entry for one name.
    pub fn need_key(&self, folder: &str, name: &[u8]) -> crate::Result<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id(folder.as_bytes())?);
        Ok(Self::build(&[&[KEY_TYPE_NEED], &folder_id, name]))
    }

    /// Read-only variant of [`Self::need_key`]; doubles as the scan
    /// prefix when `name` is empty.
    #[must_use]
    pub fn need_key_ro(&self, folder: &str, name: &[u8]) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        Some(Self::build(&[&[KEY_TYPE_NEED], &folder_id, name]))
    }

    /// Key of the folder's metadata blob.
    pub fn folder_meta_key(&self, folder: &str) -> crate::Result<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id(folder.as_bytes())?);
        Ok(Self::build(&[&[KEY_TYPE_FOLDER_META], &folder_id]))
    }

    /// Read-only variant of [`Self::folder_meta_key`].
    #[must_use]
    pub fn folder_meta_key_ro(&self, folder: &str) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        Some(Self::build(&[&[KEY_TYPE_FOLDER_META], &folder_id]))
    }

    /// Key of the index ID for one (device, folder) pair.
    pub fn index_id_key(&self, device: &DeviceId, folder: &str) -> crate::Result<Vec<u8>> {
        let device_id = Self::idx_bytes(self.device_idx.id(device.as_bytes())?);
        let folder_id = Self::idx_bytes(self.folder_idx.id(folder.as_bytes())?);
        Ok(Self::build(&[&[KEY_TYPE_INDEX_ID], &device_id, &folder_id]))
    }

    /// Folder index embedded in an index-ID key.
    #[must_use]
    pub fn folder_idx_from_index_id_key(&self, key: &[u8]) -> Option<u32> {
        let raw = key.get(1 + DEVICE_IDX_LEN..1 + DEVICE_IDX_LEN + FOLDER_IDX_LEN)?;
        Some(BigEndian::read_u32(raw))
    }

    /// Key of the virtual mtime mapping for one name.
    pub fn mtime_key(&self, folder: &str, name: &[u8]) -> crate::Result<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id(folder.as_bytes())?);
        Ok(Self::build(&[&[KEY_TYPE_VIRTUAL_MTIME], &folder_id, name]))
    }

    /// Read-only variant of [`Self::mtime_key`]; doubles as the scan
    /// prefix when `name` is empty.
    #[must_use]
    pub fn mtime_key_ro(&self, folder: &str, name: &[u8]) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        Some(Self::build(&[&[KEY_TYPE_VIRTUAL_MTIME], &folder_id, name]))
    }

    /// Key of a content-addressed block list.
    #[must_use]
    pub fn block_list_key(&self, hash: &[u8]) -> Vec<u8> {
        Self::build(&[&[KEY_TYPE_BLOCK_LIST], hash])
    }

    /// Key of a content-addressed version vector.
    #[must_use]
    pub fn version_key(&self, hash: &[u8]) -> Vec<u8> {
        Self::build(&[&[KEY_TYPE_VERSION], hash])
    }

    /// Hash portion of a block-list or version key.
    #[must_use]
    pub fn hash_from_blob_key<'k>(&self, key: &'k [u8]) -> Option<&'k [u8]> {
        key.get(1..)
    }

    /// Key marking that a local file uses a block list.
    pub fn block_list_map_key(
        &self,
        folder: &str,
        hash: &[u8],
        name: &[u8],
    ) -> crate::Result<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id(folder.as_bytes())?);
        Ok(Self::build(&[
            &[KEY_TYPE_BLOCK_LIST_MAP],
            &folder_id,
            hash,
            name,
        ]))
    }

    /// Scan prefix over block-list-map keys; `hash` may be empty to cover
    /// the whole folder.
    #[must_use]
    pub fn block_list_map_prefix_ro(&self, folder: &str, hash: &[u8]) -> Option<Vec<u8>> {
        let folder_id = Self::idx_bytes(self.folder_idx.id_ro(folder.as_bytes())?);
        Some(Self::build(&[&[KEY_TYPE_BLOCK_LIST_MAP], &folder_id, hash]))
    }

    /// Key of a miscellaneous singleton value.
    #[must_use]
    pub fn misc_key(&self, name: &str) -> Vec<u8> {
        Self::build(&[&[KEY_TYPE_MISC_DATA], name.as_bytes()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::MemoryBackend, device::LOCAL_DEVICE};
    use test_log::test;

    fn keyer() -> Keyer {
        let backend: Arc<dyn crate::backend::Backend> = Arc::new(MemoryBackend::new());
        let folders = SmallIndex::load(Arc::clone(&backend), KEY_TYPE_FOLDER_IDX).unwrap();
        let devices = SmallIndex::load(Arc::clone(&backend), KEY_TYPE_DEVICE_IDX).unwrap();
        Keyer::new(Arc::new(folders), Arc::new(devices))
    }

    #[test]
    fn device_key_layout() -> crate::Result<()> {
        let keyer = keyer();

        let key = keyer.device_key("default", &LOCAL_DEVICE, b"some/file")?;
        assert_eq!(KEY_TYPE_DEVICE, key[0]);
        assert_eq!(DEVICE_KEY_HEADER_LEN + b"some/file".len(), key.len());
        assert_eq!(b"some/file", keyer.name_from_device_key(&key).unwrap());
        assert_eq!(
            Some(LOCAL_DEVICE),
            keyer.device_from_device_key(&key)
        );

        // Same inputs, same key
        assert_eq!(key, keyer.device_key("default", &LOCAL_DEVICE, b"some/file")?);

        Ok(())
    }

    #[test]
    fn ro_variants_do_not_allocate() -> crate::Result<()> {
        let keyer = keyer();

        assert!(keyer.global_key_ro("unseen", b"x").is_none());
        keyer.global_key("unseen", b"x")?;
        assert!(keyer.global_key_ro("unseen", b"x").is_some());

        Ok(())
    }

    #[test]
    fn sequence_keys_sort_numerically() -> crate::Result<()> {
        let keyer = keyer();

        let low = keyer.sequence_key("f", 1)?;
        let mid = keyer.sequence_key("f", 255)?;
        let high = keyer.sequence_key("f", 256)?;

        assert!(low < mid && mid < high);
        assert_eq!(Some(255), keyer.sequence_from_sequence_key(&mid));

        Ok(())
    }
}
