// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

/// Length of a device identifier in bytes
pub const DEVICE_ID_LEN: usize = 32;

/// A participating node, identified by 32 opaque bytes
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceId(pub [u8; DEVICE_ID_LEN]);

/// The distinguished identifier of this node.
///
/// Never transmitted; device records stored under it describe the local state.
pub const LOCAL_DEVICE: DeviceId = DeviceId([0; DEVICE_ID_LEN]);

/// A distinguished pseudo-device whose metadata counts aggregate the
/// per-name global winners. Never persisted as a device record.
pub const GLOBAL_DEVICE: DeviceId = DeviceId([0xff; DEVICE_ID_LEN]);

impl DeviceId {
    /// Returns the raw identifier bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parses an identifier from raw bytes, requiring the exact length.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; DEVICE_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Whether this is the local device.
    #[must_use]
    pub fn is_local(&self) -> bool {
        *self == LOCAL_DEVICE
    }

    /// The short form used inside version vectors: the first eight
    /// identifier bytes as a big-endian integer.
    #[must_use]
    pub fn short_id(&self) -> u64 {
        let mut buf = [0; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }
}

impl std::fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_local() {
            return write!(f, "local");
        }
        if *self == GLOBAL_DEVICE {
            return write!(f, "global");
        }
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…")
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<[u8; DEVICE_ID_LEN]> for DeviceId {
    fn from(value: [u8; DEVICE_ID_LEN]) -> Self {
        Self(value)
    }
}
