// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

//! The ordered key-value store the index is built on.
//!
//! The index only ever sees this façade: point reads, MVCC read snapshots,
//! serialized write transactions with batched commits, and lexicographic
//! prefix/range scans. The in-memory implementation in [`memory`] is
//! complete; a disk-backed LSM store can be slotted in behind the same
//! traits.

pub mod memory;

pub use memory::MemoryBackend;

/// Key-value tuple yielded by iterators
pub type KvPair = (Vec<u8>, Vec<u8>);

/// A fallible, borrowed iterator over key-value pairs
pub type KvIterator<'a> = Box<dyn Iterator<Item = crate::Result<KvPair>> + 'a>;

/// The write surface exposed to commit hooks while a flush is in progress.
///
/// Hook writes land in the same batch that triggered the flush; they never
/// trigger a recursive flush themselves.
pub trait WriteAccess {
    /// Stores a key-value pair.
    fn put(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()>;

    /// Removes a key and its value, if it exists.
    fn delete(&mut self, key: &[u8]) -> crate::Result<()>;
}

/// A hook invoked at the start of every batch flush, including the final
/// one at commit time.
pub type CommitHook = Box<dyn FnMut(&mut dyn WriteAccess) -> crate::Result<()> + Send>;

/// A consistent, read-only point-in-time view of the backend.
///
/// Snapshots are cheap and must be short-lived; they are released by being
/// dropped, on every exit path.
pub trait ReadTransaction {
    /// Point lookup. Absence is `Ok(None)`, never an error.
    fn get(&self, key: &[u8]) -> crate::Result<Option<Vec<u8>>>;

    /// Iterates over all keys starting with `prefix`, in key order.
    fn iter_prefix(&self, prefix: &[u8]) -> KvIterator<'_>;

    /// Iterates over keys in `[first, last)`, in key order.
    fn iter_range(&self, first: &[u8], last: &[u8]) -> KvIterator<'_>;
}

/// A read-write transaction.
///
/// Reads see the committed state at transaction start plus the
/// transaction's own pending writes. The pending batch auto-flushes once
/// it exceeds the backend's thresholds; every flush first runs the commit
/// hooks registered at transaction creation.
pub trait WriteTransaction: ReadTransaction + WriteAccess {
    /// Gives the backend an opportunity to flush the pending batch.
    ///
    /// Callers performing long batched updates invoke this between logical
    /// units of work so flushes happen at record boundaries.
    fn checkpoint(&mut self) -> crate::Result<()>;

    /// Flushes outstanding writes and commits.
    fn commit(self: Box<Self>) -> crate::Result<()>;
}

/// An ordered byte-key/byte-value store with snapshots and serialized,
/// batched write transactions.
pub trait Backend: Send + Sync {
    /// Opens a read-only snapshot transaction.
    fn new_read_transaction(&self) -> crate::Result<Box<dyn ReadTransaction + '_>>;

    /// Opens a write transaction, registering the given commit hooks.
    ///
    /// Writers are serialized; this blocks while another write transaction
    /// is open.
    fn new_write_transaction(
        &self,
        hooks: Vec<CommitHook>,
    ) -> crate::Result<Box<dyn WriteTransaction + '_>>;

    /// One-off point lookup against the committed state.
    fn get(&self, key: &[u8]) -> crate::Result<Option<Vec<u8>>>;

    /// One-off single-key write.
    fn put(&self, key: &[u8], value: &[u8]) -> crate::Result<()>;

    /// One-off single-key delete.
    fn delete(&self, key: &[u8]) -> crate::Result<()>;

    /// Closes the backend; all subsequent operations fail with
    /// [`crate::Error::Closed`].
    fn close(&self) -> crate::Result<()>;
}

/// Returns the smallest byte string strictly greater than every string
/// starting with `prefix`, or `None` if no such bound exists.
#[must_use]
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let end = prefix.iter().rposition(|&b| b < 0xff)?;

    let mut bound = prefix[..=end].to_vec();

    // NOTE: rposition guarantees the byte is < 0xff
    #[allow(clippy::indexing_slicing)]
    {
        bound[end] += 1;
    }

    Some(bound)
}
