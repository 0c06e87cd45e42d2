// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use crate::{db::Db, txn::ReadTxn};
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;

/// Looks up which local files contain a block with a given hash.
///
/// Owned by whoever needs it; there is deliberately no process-wide
/// instance. Lookups are plain prefix scans over the block key space, so
/// a finder is cheap and carries no state beyond the database handle.
pub struct BlockFinder {
    db: Arc<Db>,
}

impl BlockFinder {
    /// Creates a finder over the given database.
    #[must_use]
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Calls `f` with `(folder, file name, block index)` for every local
    /// occurrence of the block hash, searching the folders in the given
    /// order.
    ///
    /// Returns `Ok(true)` as soon as `f` returns `true` (found a usable
    /// source), `Ok(false)` when the scan is exhausted.
    pub fn iterate<F>(&self, folders: &[&str], hash: &[u8], mut f: F) -> crate::Result<bool>
    where
        F: FnMut(&str, &str, u32) -> bool,
    {
        for folder in folders {
            let txn = ReadTxn::new(&self.db)?;

            let Some(prefix) = self.db.keyer().block_prefix_ro(folder, hash) else {
                continue;
            };

            for kv in txn.iter_prefix(&prefix) {
                let (key, value) = kv?;

                let Some(name) = self.db.keyer().name_from_block_key(&key) else {
                    continue;
                };
                let Ok(name) = std::str::from_utf8(name) else {
                    continue;
                };

                if value.len() != 4 {
                    log::warn!("malformed block index entry for {name:?}, skipping");
                    continue;
                }

                if f(folder, name, BigEndian::read_u32(&value)) {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }
}
