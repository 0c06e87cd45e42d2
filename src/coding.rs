// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EncodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
            }
        )
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// Not valid UTF-8
    Utf8(std::string::FromUtf8Error),

    /// Invalid enum tag
    InvalidTag((&'static str, u8)),

    /// A length-prefixed field announced an implausible length
    InvalidLength((&'static str, usize)),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DecodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
                e => format!("{e:?}"),
            }
        )
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<std::string::FromUtf8Error> for DecodeError {
    fn from(value: std::string::FromUtf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl std::error::Error for DecodeError {}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    #[allow(clippy::expect_used)]
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v).expect("cannot fail");
        v
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;

    /// Deserializes from a byte slice.
    fn decode_from_slice(mut bytes: &[u8]) -> Result<Self, DecodeError>
    where
        Self: Sized,
    {
        Self::decode_from(&mut bytes)
    }
}

// Anything larger than this in a length prefix is assumed to be corruption,
// not data, and is rejected before we try to allocate it.
const MAX_FIELD_LEN: usize = 64 * 1_024 * 1_024;

pub(crate) fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), EncodeError> {
    // NOTE: Truncation is impossible, fields are bounded way below u32::MAX
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

pub(crate) fn read_bytes<R: Read>(
    reader: &mut R,
    what: &'static str,
) -> Result<Vec<u8>, DecodeError> {
    let len = reader.read_u32_varint()? as usize;

    if len > MAX_FIELD_LEN {
        return Err(DecodeError::InvalidLength((what, len)));
    }

    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn write_str<W: Write>(writer: &mut W, s: &str) -> Result<(), EncodeError> {
    write_bytes(writer, s.as_bytes())
}

pub(crate) fn read_str<R: Read>(
    reader: &mut R,
    what: &'static str,
) -> Result<String, DecodeError> {
    let buf = read_bytes(reader, what)?;
    String::from_utf8(buf).map_err(Into::into)
}
