// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

//! Per-name global version lists.
//!
//! A version list orders everything every device knows about one name,
//! winner first. Devices with equal version vectors share one group; the
//! head group is the global version of the name.

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    device::{DeviceId, DEVICE_ID_LEN},
    fileinfo::FileItem,
    vector::{Vector, VectorOrdering},
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// One version group: a version vector and the devices that hold it.
///
/// Devices that hold the version but cannot use it (ignored, must-rescan,
/// platform problems) are listed separately; a group with only invalid
/// devices is itself invalid.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileVersion {
    /// The version vector shared by all listed devices
    pub version: Vector,

    /// Whether this version is a deletion
    pub deleted: bool,

    /// Devices holding a usable copy, ascending
    pub devices: Vec<DeviceId>,

    /// Devices holding an unusable copy, ascending
    pub invalid_devices: Vec<DeviceId>,
}

impl FileVersion {
    /// Whether no device at all is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.invalid_devices.is_empty()
    }

    /// Whether only invalid devices hold this version.
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.devices.is_empty()
    }

    /// The representative device: the first valid one, or the first
    /// invalid one when no valid copy exists.
    #[must_use]
    pub fn first_device(&self) -> Option<&DeviceId> {
        self.devices.first().or_else(|| self.invalid_devices.first())
    }

    /// Whether the device is listed, valid or not.
    #[must_use]
    pub fn contains(&self, device: &DeviceId) -> bool {
        self.devices.contains(device) || self.invalid_devices.contains(device)
    }

    fn insert_device(&mut self, device: DeviceId, invalid: bool) {
        let list = if invalid {
            &mut self.invalid_devices
        } else {
            &mut self.devices
        };

        if let Err(pos) = list.binary_search(&device) {
            list.insert(pos, device);
        }
    }

    fn remove_device(&mut self, device: &DeviceId) -> bool {
        if let Some(pos) = self.devices.iter().position(|d| d == device) {
            self.devices.remove(pos);
            return true;
        }
        if let Some(pos) = self.invalid_devices.iter().position(|d| d == device) {
            self.invalid_devices.remove(pos);
            return true;
        }
        false
    }

    /// The device deciding ties between concurrent groups.
    fn tie_break_device(&self) -> Option<&DeviceId> {
        self.first_device()
    }
}

/// Whether `new` orders before `existing` when their versions are
/// concurrent: non-deleted beats deleted, valid beats invalid, then the
/// lower representative device identifier wins.
fn wins_concurrent(new: &FileVersion, existing: &FileVersion) -> bool {
    if new.deleted != existing.deleted {
        return !new.deleted;
    }
    if new.is_invalid() != existing.is_invalid() {
        return !new.is_invalid();
    }
    match (new.tie_break_device(), existing.tie_break_device()) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        _ => false,
    }
}

/// What a [`VersionList::update`] did to the list.
#[derive(Clone, Debug)]
pub struct UpdateOutcome {
    /// The head group after the update
    pub new_global: FileVersion,

    /// The head group before the update, if the list was non-empty
    pub old_global: Option<FileVersion>,

    /// The group the device was listed in before the update, pre-removal
    pub removed: Option<FileVersion>,

    /// Whether the global version, deletedness or validity changed
    pub global_changed: bool,
}

/// The ordered version groups for one name, winner first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VersionList {
    /// The groups, winner first
    pub versions: Vec<FileVersion>,
}

impl VersionList {
    /// The global winner, if any version is known at all.
    #[must_use]
    pub fn get_global(&self) -> Option<&FileVersion> {
        self.versions.first()
    }

    /// Whether no version is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// The group the device is listed in, if any.
    #[must_use]
    pub fn version_of(&self, device: &DeviceId) -> Option<&FileVersion> {
        self.versions.iter().find(|fv| fv.contains(device))
    }

    /// Every device listed anywhere, valid or not.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.versions
            .iter()
            .flat_map(|fv| fv.devices.iter().chain(fv.invalid_devices.iter()))
    }

    /// Replaces the device's entry with `file`'s version, keeping the list
    /// ordered winner first and merging equal vectors into one group.
    pub fn update<F: FileItem + ?Sized>(&mut self, device: DeviceId, file: &F) -> UpdateOutcome {
        let old_global = self.get_global().cloned();
        let removed = self.pop(&device);

        // If an equal-version group exists, take it out and re-insert it
        // with the device added; validity may have changed its ordering.
        let mut group = match self
            .versions
            .iter()
            .position(|fv| fv.version.compare(file.file_version()) == VectorOrdering::Equal)
        {
            Some(pos) => self.versions.remove(pos),
            None => FileVersion {
                version: file.file_version().clone(),
                deleted: file.is_deleted(),
                devices: vec![],
                invalid_devices: vec![],
            },
        };
        group.insert_device(device, file.is_invalid());

        let pos = self.insert_position(&group);
        self.versions.insert(pos, group);

        let new_global = self.get_global().cloned().unwrap_or_default();

        let global_changed = match &old_global {
            None => true,
            Some(old) => {
                old.version.compare(&new_global.version) != VectorOrdering::Equal
                    || old.deleted != new_global.deleted
                    || old.is_invalid() != new_global.is_invalid()
            }
        };

        UpdateOutcome {
            new_global,
            old_global,
            removed,
            global_changed,
        }
    }

    /// Removes the device from the list, dropping its group if that
    /// empties it. Returns the group as it was before the removal.
    pub fn pop(&mut self, device: &DeviceId) -> Option<FileVersion> {
        for pos in 0..self.versions.len() {
            let Some(fv) = self.versions.get_mut(pos) else {
                break;
            };

            if fv.contains(device) {
                let before = fv.clone();
                fv.remove_device(device);
                if fv.is_empty() {
                    self.versions.remove(pos);
                }
                return Some(before);
            }
        }
        None
    }

    fn insert_position(&self, new: &FileVersion) -> usize {
        for (pos, existing) in self.versions.iter().enumerate() {
            match new.version.compare(&existing.version) {
                VectorOrdering::Greater => return pos,
                VectorOrdering::Lesser | VectorOrdering::Equal => {}
                VectorOrdering::ConcurrentGreater | VectorOrdering::ConcurrentLesser => {
                    if wins_concurrent(new, existing) {
                        return pos;
                    }
                }
            }
        }
        self.versions.len()
    }
}

/// Whether a device that may or may not hold `local_version` needs the
/// global version.
///
/// A concurrent local version still needs the global; only an equal or
/// dominating local copy does not.
#[must_use]
pub fn need(global: &FileVersion, have_local: bool, local_version: &Vector) -> bool {
    // We never need an invalid version, nor a version nobody modified
    if global.is_invalid() || global.version.is_empty() {
        return false;
    }
    // We don't need to delete files we don't have
    if global.deleted && !have_local {
        return false;
    }
    if have_local && local_version.greater_equal(&global.version) {
        return false;
    }
    true
}

const VERSION_LIST_FORMAT_GROUPED: u8 = 2;

/// Format tag of the retired one-device-per-entry layout; only the schema
/// migration still reads it.
pub const VERSION_LIST_FORMAT_DEPRECATED: u8 = 1;

fn write_device_list<W: Write>(writer: &mut W, list: &[DeviceId]) -> Result<(), EncodeError> {
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(list.len() as u32)?;
    for device in list {
        writer.write_all(device.as_bytes())?;
    }
    Ok(())
}

fn read_device_list<R: Read>(reader: &mut R) -> Result<Vec<DeviceId>, DecodeError> {
    let len = reader.read_u32_varint()? as usize;

    let mut list = Vec::with_capacity(len.min(1_024));
    for _ in 0..len {
        let mut raw = [0; DEVICE_ID_LEN];
        reader.read_exact(&mut raw)?;
        list.push(DeviceId(raw));
    }
    Ok(list)
}

impl Encode for VersionList {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(VERSION_LIST_FORMAT_GROUPED)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.versions.len() as u32)?;
        for fv in &self.versions {
            fv.version.encode_into(writer)?;
            writer.write_u8(u8::from(fv.deleted))?;
            write_device_list(writer, &fv.devices)?;
            write_device_list(writer, &fv.invalid_devices)?;
        }
        Ok(())
    }
}

impl Decode for VersionList {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let format = reader.read_u8()?;
        if format != VERSION_LIST_FORMAT_GROUPED {
            return Err(DecodeError::InvalidTag(("VersionList", format)));
        }

        let len = reader.read_u32_varint()? as usize;

        let mut versions = Vec::with_capacity(len.min(1_024));
        for _ in 0..len {
            let version = Vector::decode_from(reader)?;
            let deleted = reader.read_u8()? != 0;
            let devices = read_device_list(reader)?;
            let invalid_devices = read_device_list(reader)?;
            versions.push(FileVersion {
                version,
                deleted,
                devices,
                invalid_devices,
            });
        }

        Ok(Self { versions })
    }
}

/// One entry of the retired version list layout: a single device with its
/// version and flags.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeprecatedFileVersion {
    /// The device's version vector
    pub version: Vector,

    /// The device
    pub device: DeviceId,

    /// Whether the copy was invalid on that device
    pub invalid: bool,

    /// Whether the version is a deletion
    pub deleted: bool,
}

/// Decodes a version list in the retired layout. Only the regrouping
/// schema migration calls this.
pub fn decode_deprecated(bytes: &[u8]) -> Result<Vec<DeprecatedFileVersion>, DecodeError> {
    let mut reader = bytes;

    let format = reader.read_u8()?;
    if format != VERSION_LIST_FORMAT_DEPRECATED {
        return Err(DecodeError::InvalidTag(("DeprecatedVersionList", format)));
    }

    let len = reader.read_u32_varint()? as usize;

    let mut entries = Vec::with_capacity(len.min(1_024));
    for _ in 0..len {
        let version = Vector::decode_from(&mut reader)?;
        let mut raw = [0; DEVICE_ID_LEN];
        reader.read_exact(&mut raw)?;
        let flags = reader.read_u8()?;
        entries.push(DeprecatedFileVersion {
            version,
            device: DeviceId(raw),
            invalid: flags & 1 != 0,
            deleted: flags & 2 != 0,
        });
    }

    Ok(entries)
}

/// Encodes a version list in the retired layout, for constructing
/// migration fixtures.
#[must_use]
pub fn encode_deprecated(entries: &[DeprecatedFileVersion]) -> Vec<u8> {
    #[allow(clippy::expect_used)]
    fn inner(entries: &[DeprecatedFileVersion]) -> Result<Vec<u8>, EncodeError> {
        let mut buf = vec![];
        buf.write_u8(VERSION_LIST_FORMAT_DEPRECATED)?;
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u32_varint(entries.len() as u32)?;
        for entry in entries {
            entry.version.encode_into(&mut buf)?;
            buf.write_all(entry.device.as_bytes())?;
            let mut flags = 0;
            if entry.invalid {
                flags |= 1;
            }
            if entry.deleted {
                flags |= 2;
            }
            buf.write_u8(flags)?;
        }
        Ok(buf)
    }

    #[allow(clippy::expect_used)]
    inner(entries).expect("cannot fail")
}
