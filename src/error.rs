// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use crate::coding::{DecodeError, EncodeError};

/// Which kind of out-of-line record an indirection points at
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IndirectionKind {
    /// A content-addressed block list
    BlockList,

    /// A content-addressed version vector
    VersionVector,
}

/// A file record references an out-of-line block list or version vector
/// that could not be loaded
#[derive(Debug)]
pub struct IndirectionError {
    /// What the dangling hash was supposed to point at
    pub kind: IndirectionKind,

    /// The referenced hash
    pub hash: Vec<u8>,

    /// The inner cause; `None` means the target key is simply absent
    pub source: Option<Box<Error>>,
}

/// Represents errors that can occur in the file index
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Dangling blocks or version indirection
    Indirection(IndirectionError),

    /// A global version list names a winner without a device record;
    /// usually fixed by running the repair pass
    GlobalEntryMissing,

    /// The database was written by a newer version of this software;
    /// carries the minimum software version able to read it
    Downgrade {
        /// Minimum compatible software version, as recorded in the database
        min_version: String,
    },

    /// The backend has been closed
    Closed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Downgrade { min_version } => {
                write!(
                    f,
                    "database too new for this version; requires at least {min_version}"
                )
            }
            _ => write!(f, "FileIndexError: {self:?}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// File index result
pub type Result<T> = std::result::Result<T, Error>;
