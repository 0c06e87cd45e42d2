// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

//! The file-index database of a peer-to-peer file synchronizer.
//!
//! Per synchronized folder, a [`FileSet`] keeps the authoritative view of
//! every version of every file known by the local node and every remote
//! peer, derives the global (winner) version per name, maintains each
//! device's *need* set, and supports sequence-ordered enumeration for
//! index-transfer protocols.
//!
//! Everything is layered on an ordered byte-key/byte-value backend with
//! MVCC read snapshots and serialized, batched write transactions; the
//! in-memory [`MemoryBackend`] is complete, and a disk-backed store can
//! be slotted in behind the same [`Backend`] traits. On-disk layout is
//! versioned, with ordered idempotent migrations and a hard refusal to
//! open databases from the future.
//!
//! # Example usage
//!
//! ```
//! use file_index::{Config, FileInfo, FileSet, MemoryBackend, Vector, LOCAL_DEVICE};
//! use std::sync::Arc;
//!
//! let db = Config::new().open(Arc::new(MemoryBackend::new()))?;
//! let files = FileSet::new("default", Arc::clone(&db))?;
//!
//! files.update(
//!     &LOCAL_DEVICE,
//!     vec![FileInfo {
//!         name: "docs/readme.md".into(),
//!         size: 1_024,
//!         version: Vector::with(&[(1, 1)]),
//!         ..FileInfo::default()
//!     }],
//! )?;
//!
//! // The only copy wins globally and gets the first local sequence number
//! let file = files.get_global("docs/readme.md")?.expect("just stored");
//! assert_eq!(1, file.sequence);
//!
//! files.with_have_sequence(1, |f| {
//!     println!("changed: {}", f.name);
//!     true // keep iterating
//! })?;
//! #
//! # Ok::<(), file_index::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;

mod blockmap;
mod coding;
mod config;
mod db;
mod device;
mod error;
mod events;
mod fileinfo;
mod fileset;
mod gc;
mod keyer;
mod meta;
mod migrations;
mod repair;
mod smallindex;
mod txn;
mod vector;
mod versionlist;

pub use {
    backend::{Backend, MemoryBackend, ReadTransaction, WriteAccess, WriteTransaction},
    blockmap::BlockFinder,
    coding::{Decode, DecodeError, Encode, EncodeError},
    config::{Config, DefaultNormalizer, NameNormalizer, MAX_BATCH_SIZE_BYTES,
        MAX_BATCH_SIZE_FILES},
    db::{Db, MtimeMapping, MtimeStore},
    device::{DeviceId, DEVICE_ID_LEN, GLOBAL_DEVICE, LOCAL_DEVICE},
    error::{Error, IndirectionError, IndirectionKind, Result},
    events::{EventKind, EventLogger, NullEventLogger},
    fileinfo::{
        hash_blocks, valid_name, Block, BlockList, FileInfo, FileInfoTruncated, FileItem,
        FileType, FLAG_LOCAL_ALL, FLAG_LOCAL_IGNORED, FLAG_LOCAL_INVALID, FLAG_LOCAL_MUST_RESCAN,
        FLAG_LOCAL_RECEIVE_ONLY, FLAG_LOCAL_UNSUPPORTED,
    },
    fileset::{FileSet, IndexId},
    gc::{GcStats, StopSignal},
    meta::Counts,
    migrations::{MIN_COMPAT_VERSION, SCHEMA_VERSION},
    vector::{Counter, ShortId, Vector, VectorOrdering},
    versionlist::{
        decode_deprecated, encode_deprecated, need, DeprecatedFileVersion, FileVersion,
        VersionList,
    },
};

#[doc(hidden)]
pub use {
    keyer::{
        Keyer, KEY_TYPE_BLOCK, KEY_TYPE_BLOCK_LIST, KEY_TYPE_BLOCK_LIST_MAP, KEY_TYPE_DEVICE,
        KEY_TYPE_DEVICE_IDX, KEY_TYPE_FOLDER_IDX, KEY_TYPE_FOLDER_META, KEY_TYPE_GLOBAL,
        KEY_TYPE_INDEX_ID, KEY_TYPE_MISC_DATA, KEY_TYPE_NEED, KEY_TYPE_SEQUENCE,
        KEY_TYPE_VERSION, KEY_TYPE_VIRTUAL_MTIME,
    },
    migrations::{MISC_MIN_COMPAT, MISC_SCHEMA_VERSION},
};
