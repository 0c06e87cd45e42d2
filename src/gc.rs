// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

//! Mark-and-sweep over the content-addressed block lists and version
//! vectors.
//!
//! Phase one walks every device record and collects the referenced
//! hashes; phase two deletes every stored blob whose hash was not seen.
//! The GC lock is held exclusively throughout, so no writer can introduce
//! a reference between the phases; an interrupted run deletes a subset of
//! the garbage and nothing else.

use crate::{
    backend::WriteTransaction,
    coding::Decode,
    db::Db,
    fileinfo::FileInfo,
    keyer::{KEY_TYPE_BLOCK_LIST, KEY_TYPE_DEVICE, KEY_TYPE_VERSION},
};
use rustc_hash::FxHashSet;
use std::sync::{Arc, OnceLock};

/// Cooperative cancellation for a GC run.
///
/// Sending carries the reason for the stop. The run checks between the
/// mark and sweep phases and between individual deletes, logs the reason,
/// and returns whatever partial progress it made; a partial sweep deletes
/// a subset of the garbage and nothing else.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<OnceLock<&'static str>>);

impl StopSignal {
    /// Requests a stop, recording why. The first reason sticks.
    pub fn send(&self, reason: &'static str) {
        let _ = self.0.set(reason);
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.get().is_some()
    }

    /// The reason given with the stop request, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&'static str> {
        self.0.get().copied()
    }
}

/// What one GC run did.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GcStats {
    /// Block lists still referenced by some record
    pub block_lists_kept: usize,

    /// Block lists deleted as unreferenced
    pub block_lists_removed: usize,

    /// Version vectors still referenced by some record
    pub versions_kept: usize,

    /// Version vectors deleted as unreferenced
    pub versions_removed: usize,

    /// Whether the run finished; `false` means it was cancelled and only
    /// part of the garbage is gone
    pub completed: bool,
}

pub(crate) fn gc_indirect(db: &Db, signal: &StopSignal) -> crate::Result<GcStats> {
    // NOTE: exclusive lock; everything below must use the backend
    // directly, the transaction wrappers would try to re-take it shared
    #[allow(clippy::expect_used)]
    let _guard = db.gc_lock().write().expect("lock poisoned");

    log::debug!("starting indirection GC");

    let mut stats = GcStats::default();

    let mut block_refs: FxHashSet<Vec<u8>> = FxHashSet::default();
    let mut version_refs: FxHashSet<Vec<u8>> = FxHashSet::default();

    {
        let tx = db.backend().new_read_transaction()?;
        for kv in tx.iter_prefix(&[KEY_TYPE_DEVICE]) {
            let (_, value) = kv?;

            match FileInfo::decode_from_slice(&value) {
                Ok(file) => {
                    if !file.blocks_hash.is_empty() {
                        block_refs.insert(file.blocks_hash);
                    }
                    if !file.version_hash.is_empty() {
                        version_refs.insert(file.version_hash);
                    }
                }
                Err(e) => log::warn!("undecodable record during GC mark, skipping: {e}"),
            }
        }
    }

    if signal.is_stopped() {
        log::debug!(
            "indirection GC stopped before sweep: {}",
            signal.reason().unwrap_or("unspecified")
        );
        return Ok(stats);
    }

    let mut tx = db.backend().new_write_transaction(vec![])?;

    let (kept, removed, done) = sweep(&mut tx, KEY_TYPE_BLOCK_LIST, &block_refs, signal)?;
    stats.block_lists_kept = kept;
    stats.block_lists_removed = removed;
    if !done {
        log::debug!(
            "indirection GC stopped mid-sweep: {}",
            signal.reason().unwrap_or("unspecified")
        );
        tx.commit()?;
        return Ok(stats);
    }

    let (kept, removed, done) = sweep(&mut tx, KEY_TYPE_VERSION, &version_refs, signal)?;
    stats.versions_kept = kept;
    stats.versions_removed = removed;
    if !done {
        log::debug!(
            "indirection GC stopped mid-sweep: {}",
            signal.reason().unwrap_or("unspecified")
        );
        tx.commit()?;
        return Ok(stats);
    }

    tx.commit()?;
    stats.completed = true;

    log::debug!(
        "indirection GC done; kept {}+{}, removed {}+{}",
        stats.block_lists_kept,
        stats.versions_kept,
        stats.block_lists_removed,
        stats.versions_removed,
    );

    Ok(stats)
}

/// Deletes unreferenced blobs under one key-type prefix. Returns how many
/// were kept and removed, and whether the sweep ran to completion.
fn sweep<'a>(
    tx: &mut Box<dyn WriteTransaction + 'a>,
    prefix: u8,
    refs: &FxHashSet<Vec<u8>>,
    signal: &StopSignal,
) -> crate::Result<(usize, usize, bool)> {
    let keys: Vec<Vec<u8>> = {
        let mut keys = vec![];
        for kv in tx.iter_prefix(&[prefix]) {
            let (key, _) = kv?;
            keys.push(key);
        }
        keys
    };

    let mut kept = 0;
    let mut removed = 0;

    for key in keys {
        if signal.is_stopped() {
            return Ok((kept, removed, false));
        }

        let Some(hash) = key.get(1..) else {
            continue;
        };

        if refs.contains(hash) {
            kept += 1;
        } else {
            tx.delete(&key)?;
            removed += 1;
        }
    }

    Ok((kept, removed, true))
}
