#![allow(dead_code)]

use file_index::{
    Block, Config, Db, DeviceId, FileInfo, MemoryBackend, Vector, DEVICE_ID_LEN,
};
use std::sync::Arc;

pub fn open_backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new())
}

pub fn open_db() -> Arc<Db> {
    Config::new().open(open_backend()).unwrap()
}

pub fn open_db_on(backend: Arc<MemoryBackend>) -> file_index::Result<Arc<Db>> {
    Config::new().open(backend)
}

pub fn device(seed: u8) -> DeviceId {
    DeviceId([seed; DEVICE_ID_LEN])
}

pub fn block(seed: u8) -> Block {
    Block {
        offset: i64::from(seed) * 128 * 1_024,
        size: 128 * 1_024,
        hash: vec![seed; 32],
    }
}

/// `count` blocks with hashes unique within (`salt`, index).
pub fn blocks(count: usize, salt: u8) -> Vec<Block> {
    (0..count)
        .map(|i| {
            let mut hash = vec![0; 32];
            hash[0] = salt;
            hash[1] = (i >> 8) as u8;
            hash[2] = i as u8;
            Block {
                offset: i as i64 * 128 * 1_024,
                size: 128 * 1_024,
                hash,
            }
        })
        .collect()
}

pub fn file(name: &str, version: &[(u64, u64)], blocks: Vec<Block>) -> FileInfo {
    FileInfo {
        name: name.into(),
        size: blocks.iter().map(|b| i64::from(b.size)).sum(),
        version: Vector::with(version),
        blocks,
        ..FileInfo::default()
    }
}

pub fn deleted_file(name: &str, version: &[(u64, u64)]) -> FileInfo {
    FileInfo {
        name: name.into(),
        version: Vector::with(version),
        deleted: true,
        ..FileInfo::default()
    }
}
