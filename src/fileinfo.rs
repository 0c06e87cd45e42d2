// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use crate::{
    coding::{read_bytes, read_str, write_bytes, write_str, Decode, DecodeError, Encode,
        EncodeError},
    vector::{ShortId, Vector},
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// The file is known to the device but unusable there because the platform
/// cannot represent it (reserved name, unsupported type).
pub const FLAG_LOCAL_UNSUPPORTED: u32 = 1 << 0;

/// The file matches an ignore pattern on the local device.
pub const FLAG_LOCAL_IGNORED: u32 = 1 << 1;

/// The local record is suspect and the file must be rescanned before use.
pub const FLAG_LOCAL_MUST_RESCAN: u32 = 1 << 2;

/// The file was changed locally in a receive-only folder.
pub const FLAG_LOCAL_RECEIVE_ONLY: u32 = 1 << 3;

/// All flags that may be persisted on a file record.
pub const FLAG_LOCAL_ALL: u32 =
    FLAG_LOCAL_UNSUPPORTED | FLAG_LOCAL_IGNORED | FLAG_LOCAL_MUST_RESCAN | FLAG_LOCAL_RECEIVE_ONLY;

/// Flags that make a record invalid for synchronization purposes.
pub const FLAG_LOCAL_INVALID: u32 =
    FLAG_LOCAL_UNSUPPORTED | FLAG_LOCAL_IGNORED | FLAG_LOCAL_MUST_RESCAN | FLAG_LOCAL_RECEIVE_ONLY;

/// What kind of filesystem object a record describes
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FileType {
    /// A regular file
    #[default]
    Regular,

    /// A directory
    Directory,

    /// Legacy encoding of a symlink to a file; rewritten to [`Self::Symlink`]
    /// by the schema migrations
    DeprecatedSymlinkFile,

    /// Legacy encoding of a symlink to a directory; rewritten to
    /// [`Self::Symlink`] by the schema migrations
    DeprecatedSymlinkDirectory,

    /// A symlink
    Symlink,
}

impl From<FileType> for u8 {
    fn from(value: FileType) -> Self {
        match value {
            FileType::Regular => 0,
            FileType::Directory => 1,
            FileType::DeprecatedSymlinkFile => 2,
            FileType::DeprecatedSymlinkDirectory => 3,
            FileType::Symlink => 4,
        }
    }
}

impl TryFrom<u8> for FileType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Regular),
            1 => Ok(Self::Directory),
            2 => Ok(Self::DeprecatedSymlinkFile),
            3 => Ok(Self::DeprecatedSymlinkDirectory),
            4 => Ok(Self::Symlink),
            _ => Err(()),
        }
    }
}

impl FileType {
    /// Whether this is any of the symlink encodings.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        matches!(
            self,
            Self::Symlink | Self::DeprecatedSymlinkFile | Self::DeprecatedSymlinkDirectory
        )
    }
}

/// One content block of a regular file
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Block {
    /// Byte offset within the file
    pub offset: i64,

    /// Block length in bytes
    pub size: i32,

    /// Content hash of the block
    pub hash: Vec<u8>,
}

impl Encode for Block {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_i64_varint(self.offset)?;
        writer.write_i32_varint(self.size)?;
        write_bytes(writer, &self.hash)
    }
}

impl Decode for Block {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            offset: reader.read_i64_varint()?,
            size: reader.read_i32_varint()?,
            hash: read_bytes(reader, "block hash")?,
        })
    }
}

/// A deduplicated, content-addressed collection of the blocks of one file,
/// stored out-of-line when the file exceeds the indirection cutoff.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockList {
    /// The blocks, ordered by offset
    pub blocks: Vec<Block>,
}

impl BlockList {
    /// The content address: SHA-256 over the concatenated block hashes.
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        hash_blocks(&self.blocks)
    }
}

/// Content address of a slice of blocks; see [`BlockList::hash`].
#[must_use]
pub fn hash_blocks(blocks: &[Block]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for block in blocks {
        hasher.update(&block.hash);
    }
    hasher.finalize().into()
}

impl Encode for BlockList {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.blocks.len() as u32)?;
        for block in &self.blocks {
            block.encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for BlockList {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let len = reader.read_u32_varint()? as usize;

        let mut blocks = Vec::with_capacity(len.min(4_096));
        for _ in 0..len {
            blocks.push(Block::decode_from(reader)?);
        }

        Ok(Self { blocks })
    }
}

/// The capability set iterators operate on: everything needed to judge a
/// record without necessarily carrying its block list.
///
/// Implemented by exactly [`FileInfo`] and [`FileInfoTruncated`].
pub trait FileItem {
    /// The file name, in canonical form.
    fn file_name(&self) -> &str;

    /// The version vector.
    fn file_version(&self) -> &Vector;

    /// What kind of filesystem object this is.
    fn file_type(&self) -> FileType;

    /// The file size in bytes.
    fn file_size(&self) -> i64;

    /// Whether the record describes a deletion.
    fn is_deleted(&self) -> bool;

    /// Whether the record is unusable on the owning device.
    fn is_invalid(&self) -> bool;

    /// The folder-monotonic sequence number, if assigned.
    fn sequence_no(&self) -> i64;

    /// Content address of the block list, if stored out-of-line.
    fn blocks_hash(&self) -> &[u8];

    /// The persisted local flags.
    fn local_flags(&self) -> u32;
}

macro_rules! impl_file_item {
    ($t:ty) => {
        impl FileItem for $t {
            fn file_name(&self) -> &str {
                &self.name
            }

            fn file_version(&self) -> &Vector {
                &self.version
            }

            fn file_type(&self) -> FileType {
                self.file_type
            }

            fn file_size(&self) -> i64 {
                self.size
            }

            fn is_deleted(&self) -> bool {
                self.deleted
            }

            fn is_invalid(&self) -> bool {
                self.raw_invalid || self.local_flags & FLAG_LOCAL_INVALID != 0
            }

            fn sequence_no(&self) -> i64 {
                self.sequence
            }

            fn blocks_hash(&self) -> &[u8] {
                &self.blocks_hash
            }

            fn local_flags(&self) -> u32 {
                self.local_flags
            }
        }
    };
}

/// The canonical per-device record for one name within one folder.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileInfo {
    /// Name, with forward slashes, relative to the folder root
    pub name: String,

    /// What kind of filesystem object this is
    pub file_type: FileType,

    /// Size in bytes; zero for directories and deletions
    pub size: i64,

    /// Unix permission bits
    pub permissions: u32,

    /// Modification time, seconds part
    pub modified_s: i64,

    /// Modification time, nanoseconds part
    pub modified_ns: i32,

    /// Short identifier of the device that made the last change
    pub modified_by: ShortId,

    /// The version vector
    pub version: Vector,

    /// Folder-monotonic sequence number; assigned by the database for
    /// local records, carried through for remote ones
    pub sequence: i64,

    /// Whether this records a deletion
    pub deleted: bool,

    /// Invalid on the announcing device, as transmitted on the wire
    pub raw_invalid: bool,

    /// Whether permission bits are meaningless on the owning device
    pub no_permissions: bool,

    /// Local flags; see the `FLAG_LOCAL_*` constants
    pub local_flags: u32,

    /// Symlink target, for symlinks
    pub symlink_target: String,

    /// The block list; may be empty on records read without block
    /// restoration
    pub blocks: Vec<Block>,

    /// Content address of the block list when stored out-of-line
    pub blocks_hash: Vec<u8>,

    /// Content address of the version vector when stored out-of-line;
    /// only ever set on the stored form
    pub version_hash: Vec<u8>,
}

impl_file_item!(FileInfo);

/// A size-reduced projection of [`FileInfo`] without the block list,
/// for iteration that does not touch file content.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileInfoTruncated {
    /// See [`FileInfo::name`]
    pub name: String,

    /// See [`FileInfo::file_type`]
    pub file_type: FileType,

    /// See [`FileInfo::size`]
    pub size: i64,

    /// See [`FileInfo::permissions`]
    pub permissions: u32,

    /// See [`FileInfo::modified_s`]
    pub modified_s: i64,

    /// See [`FileInfo::modified_ns`]
    pub modified_ns: i32,

    /// See [`FileInfo::modified_by`]
    pub modified_by: ShortId,

    /// See [`FileInfo::version`]
    pub version: Vector,

    /// See [`FileInfo::sequence`]
    pub sequence: i64,

    /// See [`FileInfo::deleted`]
    pub deleted: bool,

    /// See [`FileInfo::raw_invalid`]
    pub raw_invalid: bool,

    /// See [`FileInfo::no_permissions`]
    pub no_permissions: bool,

    /// See [`FileInfo::local_flags`]
    pub local_flags: u32,

    /// See [`FileInfo::symlink_target`]
    pub symlink_target: String,

    /// See [`FileInfo::blocks_hash`]
    pub blocks_hash: Vec<u8>,
}

impl_file_item!(FileInfoTruncated);

impl From<FileInfo> for FileInfoTruncated {
    fn from(f: FileInfo) -> Self {
        Self {
            name: f.name,
            file_type: f.file_type,
            size: f.size,
            permissions: f.permissions,
            modified_s: f.modified_s,
            modified_ns: f.modified_ns,
            modified_by: f.modified_by,
            version: f.version,
            sequence: f.sequence,
            deleted: f.deleted,
            raw_invalid: f.raw_invalid,
            no_permissions: f.no_permissions,
            local_flags: f.local_flags,
            symlink_target: f.symlink_target,
            blocks_hash: f.blocks_hash,
        }
    }
}

/// Whether a name is storable: non-empty, relative, and not a dot path.
#[must_use]
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.starts_with('/')
}

const FILE_INFO_FORMAT: u8 = 1;

const FLAG_DELETED: u32 = 1 << 0;
const FLAG_INVALID: u32 = 1 << 1;
const FLAG_NO_PERMISSIONS: u32 = 1 << 2;

impl Encode for FileInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(FILE_INFO_FORMAT)?;

        write_str(writer, &self.name)?;
        writer.write_u8(self.file_type.into())?;
        writer.write_i64_varint(self.size)?;
        writer.write_u32_varint(self.permissions)?;
        writer.write_i64_varint(self.modified_s)?;
        writer.write_i32_varint(self.modified_ns)?;
        writer.write_u64_varint(self.modified_by)?;

        let mut flags = 0;
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        if self.raw_invalid {
            flags |= FLAG_INVALID;
        }
        if self.no_permissions {
            flags |= FLAG_NO_PERMISSIONS;
        }
        writer.write_u32_varint(flags)?;
        writer.write_u32_varint(self.local_flags)?;

        writer.write_i64_varint(self.sequence)?;

        self.version.encode_into(writer)?;
        write_bytes(writer, &self.version_hash)?;

        write_str(writer, &self.symlink_target)?;
        write_bytes(writer, &self.blocks_hash)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.blocks.len() as u32)?;
        for block in &self.blocks {
            block.encode_into(writer)?;
        }

        Ok(())
    }
}

impl Decode for FileInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let format = reader.read_u8()?;
        if format != FILE_INFO_FORMAT {
            return Err(DecodeError::InvalidTag(("FileInfo", format)));
        }

        let name = read_str(reader, "file name")?;

        let file_type = reader.read_u8()?;
        let file_type = FileType::try_from(file_type)
            .map_err(|()| DecodeError::InvalidTag(("FileType", file_type)))?;

        let size = reader.read_i64_varint()?;
        let permissions = reader.read_u32_varint()?;
        let modified_s = reader.read_i64_varint()?;
        let modified_ns = reader.read_i32_varint()?;
        let modified_by = reader.read_u64_varint()?;

        let flags = reader.read_u32_varint()?;
        let local_flags = reader.read_u32_varint()?;

        let sequence = reader.read_i64_varint()?;

        let version = Vector::decode_from(reader)?;
        let version_hash = read_bytes(reader, "version hash")?;

        let symlink_target = read_str(reader, "symlink target")?;
        let blocks_hash = read_bytes(reader, "blocks hash")?;

        let block_count = reader.read_u32_varint()? as usize;
        let mut blocks = Vec::with_capacity(block_count.min(4_096));
        for _ in 0..block_count {
            blocks.push(Block::decode_from(reader)?);
        }

        Ok(Self {
            name,
            file_type,
            size,
            permissions,
            modified_s,
            modified_ns,
            modified_by,
            version,
            sequence,
            deleted: flags & FLAG_DELETED != 0,
            raw_invalid: flags & FLAG_INVALID != 0,
            no_permissions: flags & FLAG_NO_PERMISSIONS != 0,
            local_flags,
            symlink_target,
            blocks,
            blocks_hash,
            version_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn block(seed: u8) -> Block {
        Block {
            offset: i64::from(seed) * 128 * 1_024,
            size: 128 * 1_024,
            hash: vec![seed; 32],
        }
    }

    #[test]
    fn file_info_roundtrip() {
        let file = FileInfo {
            name: "dir/näme".into(),
            file_type: FileType::Regular,
            size: 256 * 1_024,
            permissions: 0o644,
            modified_s: 1_600_000_000,
            modified_ns: -1,
            modified_by: 42,
            version: Vector::with(&[(1, 1), (2, 7)]),
            sequence: 1_234,
            deleted: false,
            raw_invalid: true,
            no_permissions: false,
            local_flags: FLAG_LOCAL_IGNORED,
            symlink_target: String::new(),
            blocks: vec![block(1), block(2)],
            blocks_hash: vec![],
            version_hash: vec![],
        };

        let bytes = file.encode_into_vec();
        let decoded = FileInfo::decode_from_slice(&bytes).unwrap();
        assert_eq!(file, decoded);
    }

    #[test]
    fn invalid_derives_from_flags() {
        let mut file = FileInfo {
            name: "a".into(),
            ..FileInfo::default()
        };
        assert!(!file.is_invalid());

        file.local_flags = FLAG_LOCAL_IGNORED;
        assert!(file.is_invalid());

        file.local_flags = 0;
        file.raw_invalid = true;
        assert!(file.is_invalid());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let file = FileInfo::default();
        let mut bytes = file.encode_into_vec();
        bytes[0] = 99;

        assert!(matches!(
            FileInfo::decode_from_slice(&bytes),
            Err(DecodeError::InvalidTag(("FileInfo", 99))),
        ));
    }

    #[test]
    fn block_list_hash_is_order_sensitive() {
        let a = BlockList {
            blocks: vec![block(1), block(2)],
        };
        let b = BlockList {
            blocks: vec![block(2), block(1)],
        };

        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.hash());
    }

    #[test]
    fn name_validity() {
        assert!(valid_name("a/b"));
        assert!(!valid_name(""));
        assert!(!valid_name("."));
        assert!(!valid_name(".."));
        assert!(!valid_name("/"));
        assert!(!valid_name("/etc/passwd"));
    }

    #[test]
    fn truncation_drops_blocks_only() {
        let file = FileInfo {
            name: "a".into(),
            size: 10,
            blocks: vec![block(1)],
            blocks_hash: vec![9; 32],
            ..FileInfo::default()
        };

        let truncated = FileInfoTruncated::from(file.clone());
        assert_eq!(file.name, truncated.name);
        assert_eq!(file.blocks_hash, truncated.blocks_hash);
        assert_eq!(file.file_size(), truncated.file_size());
    }
}
