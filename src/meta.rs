// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    device::{DeviceId, DEVICE_ID_LEN, LOCAL_DEVICE},
    fileinfo::{FileItem, FileType, FLAG_LOCAL_ALL},
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Aggregate counts for one (device, local-flag) bucket.
///
/// Bucket zero holds a device's unflagged (valid) records; each local
/// flag bit gets its own bucket so flagged records can be sized without
/// a scan.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Counts {
    /// Regular files
    pub files: i64,

    /// Directories
    pub directories: i64,

    /// Symlinks
    pub symlinks: i64,

    /// Deletion records
    pub deleted: i64,

    /// Total bytes of the counted regular files and symlinks
    pub bytes: i64,

    /// Files this device needs to match the global state
    pub needed: i64,

    /// Highest sequence number seen for this device
    pub sequence: i64,
}

impl Counts {
    /// Total number of counted records.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.files + self.directories + self.symlinks + self.deleted
    }
}

const META_FORMAT: u8 = 1;

/// Per-folder running counts and the next-local-sequence counter.
///
/// Kept in memory, persisted as one blob per folder through the write
/// transaction's commit hook so that every flushed batch carries matching
/// counts. A missing or undecodable blob is rebuilt by full recalculation.
#[derive(Debug, Default)]
pub(crate) struct MetadataTracker {
    counts: FxHashMap<(DeviceId, u32), Counts>,
    dirty: bool,
}

impl MetadataTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether the in-memory state is ahead of the persisted blob.
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn bucket(&mut self, device: DeviceId, flag: u32) -> &mut Counts {
        self.counts.entry((device, flag)).or_default()
    }

    /// The counts in one bucket; zero if the bucket does not exist.
    pub(crate) fn counts(&self, device: &DeviceId, flag: u32) -> Counts {
        self.counts.get(&(*device, flag)).copied().unwrap_or_default()
    }

    /// Every device with any bucket, in unspecified order.
    pub(crate) fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<_> = self.counts.keys().map(|(d, _)| *d).collect();
        devices.sort_unstable();
        devices.dedup();
        devices
    }

    /// Adds a record to the device's buckets.
    pub(crate) fn add_file<F: FileItem + ?Sized>(&mut self, device: &DeviceId, file: &F) {
        self.dirty = true;

        let flags = file.local_flags() & FLAG_LOCAL_ALL;
        if flags == 0 {
            Self::count(self.bucket(*device, 0), file, 1);
        } else {
            let mut rest = flags;
            while rest != 0 {
                let bit = rest & rest.wrapping_neg();
                Self::count(self.bucket(*device, bit), file, 1);
                rest ^= bit;
            }
        }

        let sequence = file.sequence_no();
        let bucket = self.bucket(*device, 0);
        if sequence > bucket.sequence {
            bucket.sequence = sequence;
        }
    }

    /// Removes a record from the device's buckets.
    pub(crate) fn remove_file<F: FileItem + ?Sized>(&mut self, device: &DeviceId, file: &F) {
        self.dirty = true;

        let flags = file.local_flags() & FLAG_LOCAL_ALL;
        if flags == 0 {
            Self::count(self.bucket(*device, 0), file, -1);
        } else {
            let mut rest = flags;
            while rest != 0 {
                let bit = rest & rest.wrapping_neg();
                Self::count(self.bucket(*device, bit), file, -1);
                rest ^= bit;
            }
        }
    }

    fn count<F: FileItem + ?Sized>(bucket: &mut Counts, file: &F, delta: i64) {
        if file.is_deleted() {
            bucket.deleted += delta;
            return;
        }

        match file.file_type() {
            FileType::Regular => {
                bucket.files += delta;
                bucket.bytes += delta * file.file_size();
            }
            FileType::Directory => bucket.directories += delta,
            FileType::Symlink
            | FileType::DeprecatedSymlinkFile
            | FileType::DeprecatedSymlinkDirectory => {
                bucket.symlinks += delta;
                bucket.bytes += delta * file.file_size();
            }
        }
    }

    /// Adjusts the device's needed-file count.
    pub(crate) fn add_needed(&mut self, device: &DeviceId, delta: i64) {
        self.dirty = true;

        let bucket = self.bucket(*device, 0);
        bucket.needed += delta;
        if bucket.needed < 0 {
            log::warn!("needed count for {device} went negative, clamping");
            bucket.needed = 0;
        }
    }

    /// The device's needed-file count.
    pub(crate) fn need_count(&self, device: &DeviceId) -> i64 {
        self.counts(device, 0).needed
    }

    /// Allocates the next local sequence number.
    pub(crate) fn next_local_sequence(&mut self) -> i64 {
        self.dirty = true;

        let bucket = self.bucket(LOCAL_DEVICE, 0);
        bucket.sequence += 1;
        bucket.sequence
    }

    /// The highest sequence number seen for the device.
    pub(crate) fn sequence(&self, device: &DeviceId) -> i64 {
        self.counts(device, 0).sequence
    }

    /// Forgets everything about one device.
    pub(crate) fn remove_device(&mut self, device: &DeviceId) {
        self.dirty = true;
        self.counts.retain(|(d, _), _| d != device);
    }

    /// Reinstates the local sequence watermark after a local drop;
    /// sequence numbers stay monotonic across it.
    pub(crate) fn restore_local_sequence(&mut self, sequence: i64) {
        self.dirty = true;
        self.bucket(LOCAL_DEVICE, 0).sequence = sequence;
    }
}

impl Encode for MetadataTracker {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(META_FORMAT)?;

        // Canonical bucket order so the blob is deterministic
        let mut keys: Vec<_> = self.counts.keys().copied().collect();
        keys.sort_unstable();

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(keys.len() as u32)?;

        for key in keys {
            let Some(counts) = self.counts.get(&key) else {
                continue;
            };
            let (device, flag) = key;

            writer.write_all(device.as_bytes())?;
            writer.write_u32_varint(flag)?;
            writer.write_i64_varint(counts.files)?;
            writer.write_i64_varint(counts.directories)?;
            writer.write_i64_varint(counts.symlinks)?;
            writer.write_i64_varint(counts.deleted)?;
            writer.write_i64_varint(counts.bytes)?;
            writer.write_i64_varint(counts.needed)?;
            writer.write_i64_varint(counts.sequence)?;
        }

        Ok(())
    }
}

impl Decode for MetadataTracker {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let format = reader.read_u8()?;
        if format != META_FORMAT {
            return Err(DecodeError::InvalidTag(("CountsSet", format)));
        }

        let len = reader.read_u32_varint()? as usize;

        let mut counts = FxHashMap::default();
        for _ in 0..len {
            let mut raw = [0; DEVICE_ID_LEN];
            reader.read_exact(&mut raw)?;
            let flag = reader.read_u32_varint()?;

            counts.insert(
                (DeviceId(raw), flag),
                Counts {
                    files: reader.read_i64_varint()?,
                    directories: reader.read_i64_varint()?,
                    symlinks: reader.read_i64_varint()?,
                    deleted: reader.read_i64_varint()?,
                    bytes: reader.read_i64_varint()?,
                    needed: reader.read_i64_varint()?,
                    sequence: reader.read_i64_varint()?,
                },
            );
        }

        Ok(Self {
            counts,
            dirty: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileinfo::{FileInfo, FLAG_LOCAL_IGNORED, FLAG_LOCAL_RECEIVE_ONLY};
    use test_log::test;

    fn file(size: i64, file_type: FileType, deleted: bool, local_flags: u32) -> FileInfo {
        FileInfo {
            name: "x".into(),
            size,
            file_type,
            deleted,
            local_flags,
            ..FileInfo::default()
        }
    }

    #[test]
    fn counting_by_type_and_flag() {
        let mut meta = MetadataTracker::new();

        meta.add_file(&LOCAL_DEVICE, &file(100, FileType::Regular, false, 0));
        meta.add_file(&LOCAL_DEVICE, &file(0, FileType::Directory, false, 0));
        meta.add_file(&LOCAL_DEVICE, &file(0, FileType::Regular, true, 0));
        meta.add_file(
            &LOCAL_DEVICE,
            &file(7, FileType::Regular, false, FLAG_LOCAL_IGNORED),
        );

        let c = meta.counts(&LOCAL_DEVICE, 0);
        assert_eq!(1, c.files);
        assert_eq!(1, c.directories);
        assert_eq!(1, c.deleted);
        assert_eq!(100, c.bytes);

        let c = meta.counts(&LOCAL_DEVICE, FLAG_LOCAL_IGNORED);
        assert_eq!(1, c.files);
        assert_eq!(7, c.bytes);

        meta.remove_file(&LOCAL_DEVICE, &file(100, FileType::Regular, false, 0));
        assert_eq!(0, meta.counts(&LOCAL_DEVICE, 0).files);
        assert_eq!(0, meta.counts(&LOCAL_DEVICE, 0).bytes);
    }

    #[test]
    fn multi_flag_records_count_in_each_bucket() {
        let mut meta = MetadataTracker::new();
        let flags = FLAG_LOCAL_IGNORED | FLAG_LOCAL_RECEIVE_ONLY;

        meta.add_file(&LOCAL_DEVICE, &file(1, FileType::Regular, false, flags));
        assert_eq!(1, meta.counts(&LOCAL_DEVICE, FLAG_LOCAL_IGNORED).files);
        assert_eq!(1, meta.counts(&LOCAL_DEVICE, FLAG_LOCAL_RECEIVE_ONLY).files);
        assert_eq!(0, meta.counts(&LOCAL_DEVICE, 0).files);
    }

    #[test]
    fn sequences_are_watermarks() {
        let mut meta = MetadataTracker::new();

        assert_eq!(1, meta.next_local_sequence());
        assert_eq!(2, meta.next_local_sequence());
        assert_eq!(2, meta.sequence(&LOCAL_DEVICE));

        let dev = DeviceId([9; DEVICE_ID_LEN]);
        let mut f = file(1, FileType::Regular, false, 0);
        f.sequence = 42;
        meta.add_file(&dev, &f);
        assert_eq!(42, meta.sequence(&dev));

        f.sequence = 7;
        meta.add_file(&dev, &f);
        assert_eq!(42, meta.sequence(&dev));
    }

    #[test]
    fn blob_roundtrip() {
        let mut meta = MetadataTracker::new();
        meta.add_file(&LOCAL_DEVICE, &file(100, FileType::Regular, false, 0));
        meta.add_needed(&DeviceId([1; DEVICE_ID_LEN]), 1);
        meta.next_local_sequence();

        let bytes = meta.encode_into_vec();
        let decoded = MetadataTracker::decode_from_slice(&bytes).unwrap();

        assert!(!decoded.is_dirty());
        assert_eq!(
            meta.counts(&LOCAL_DEVICE, 0),
            decoded.counts(&LOCAL_DEVICE, 0)
        );
        assert_eq!(1, decoded.need_count(&DeviceId([1; DEVICE_ID_LEN])));
    }
}
