// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use crate::backend::{
    prefix_upper_bound, Backend, CommitHook, KvIterator, KvPair, ReadTransaction, WriteAccess,
    WriteTransaction,
};
use crossbeam_skiplist::SkipMap;
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

/// Monotonically increasing commit counter.
///
/// All entries of one flushed batch share one seqno, which makes the batch
/// visible to readers atomically. A read snapshot is just a seqno
/// watermark; an entry is visible if its seqno is at or below it.
type SeqNo = u64;

#[derive(Clone, Eq, PartialEq)]
struct InternalKey {
    user_key: Vec<u8>,
    seqno: SeqNo,
}

// Order by user key, THEN by descending seqno.
// Newest visible version of a key is the first one a forward scan meets.
impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.user_key, Reverse(self.seqno)).cmp(&(&other.user_key, Reverse(other.seqno)))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

type Store = SkipMap<InternalKey, Option<Vec<u8>>>;
type StoreRange<'a> = crossbeam_skiplist::map::Range<
    'a,
    InternalKey,
    (Bound<InternalKey>, Bound<InternalKey>),
    InternalKey,
    Option<Vec<u8>>,
>;

const DEFAULT_FLUSH_BYTES: usize = 16 * 1_024 * 1_024;
const DEFAULT_FLUSH_ENTRIES: usize = 1_024;

/// In-memory MVCC implementation of the backend contract.
///
/// Values are versioned in a lock-free skiplist keyed by
/// `(user key, descending seqno)`, with `None` as the tombstone. Read
/// transactions capture the committed watermark and never block; write
/// transactions serialize on a mutex and buffer into an ordered pending
/// batch with read-your-own-writes semantics.
pub struct MemoryBackend {
    items: Store,
    visible_seqno: AtomicU64,
    write_lock: Mutex<()>,
    closed: AtomicBool,
    flush_bytes: usize,
    flush_entries: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty backend with default flush thresholds
    /// (16 MiB or 1024 entries, whichever is hit first).
    #[must_use]
    pub fn new() -> Self {
        Self::with_flush_thresholds(DEFAULT_FLUSH_BYTES, DEFAULT_FLUSH_ENTRIES)
    }

    /// Creates an empty backend with custom flush thresholds.
    #[must_use]
    pub fn with_flush_thresholds(bytes: usize, entries: usize) -> Self {
        Self {
            items: SkipMap::new(),
            visible_seqno: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            flush_bytes: bytes,
            flush_entries: entries,
        }
    }

    fn check_open(&self) -> crate::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(crate::Error::Closed)
        } else {
            Ok(())
        }
    }

    fn get_at(&self, key: &[u8], snapshot: SeqNo) -> Option<Vec<u8>> {
        let start = InternalKey {
            user_key: key.to_vec(),
            seqno: snapshot,
        };

        self.items
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|entry| entry.key().user_key == key)
            .next()
            .and_then(|entry| entry.value().clone())
    }

    fn scan(&self, start: Vec<u8>, end: Option<Vec<u8>>, snapshot: SeqNo) -> SnapshotIter<'_> {
        let lo = InternalKey {
            user_key: start,
            seqno: SeqNo::MAX,
        };

        SnapshotIter {
            inner: self.items.range((Bound::Included(lo), Bound::Unbounded)),
            snapshot,
            end,
            last_key: None,
        }
    }
}

impl Backend for MemoryBackend {
    fn new_read_transaction(&self) -> crate::Result<Box<dyn ReadTransaction + '_>> {
        self.check_open()?;
        Ok(Box::new(MemoryReadTransaction {
            backend: self,
            snapshot: self.visible_seqno.load(Ordering::Acquire),
        }))
    }

    fn new_write_transaction(
        &self,
        hooks: Vec<CommitHook>,
    ) -> crate::Result<Box<dyn WriteTransaction + '_>> {
        self.check_open()?;

        #[allow(clippy::expect_used)]
        let guard = self.write_lock.lock().expect("lock poisoned");

        Ok(Box::new(MemoryWriteTransaction {
            backend: self,
            _guard: guard,
            snapshot: self.visible_seqno.load(Ordering::Acquire),
            pending: BTreeMap::new(),
            pending_bytes: 0,
            hooks,
            in_flush: false,
        }))
    }

    fn get(&self, key: &[u8]) -> crate::Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.get_at(key, self.visible_seqno.load(Ordering::Acquire)))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        self.check_open()?;

        #[allow(clippy::expect_used)]
        let _guard = self.write_lock.lock().expect("lock poisoned");

        let seqno = self.visible_seqno.load(Ordering::Acquire) + 1;
        self.items.insert(
            InternalKey {
                user_key: key.to_vec(),
                seqno,
            },
            Some(value.to_vec()),
        );
        self.visible_seqno.store(seqno, Ordering::Release);

        Ok(())
    }

    fn delete(&self, key: &[u8]) -> crate::Result<()> {
        self.check_open()?;

        #[allow(clippy::expect_used)]
        let _guard = self.write_lock.lock().expect("lock poisoned");

        let seqno = self.visible_seqno.load(Ordering::Acquire) + 1;
        self.items.insert(
            InternalKey {
                user_key: key.to_vec(),
                seqno,
            },
            None,
        );
        self.visible_seqno.store(seqno, Ordering::Release);

        Ok(())
    }

    fn close(&self) -> crate::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Iterates the newest visible version of each key at a fixed snapshot,
/// skipping tombstones.
struct SnapshotIter<'a> {
    inner: StoreRange<'a>,
    snapshot: SeqNo,
    end: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl Iterator for SnapshotIter<'_> {
    type Item = KvPair;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.inner.by_ref() {
            let key = entry.key();

            if let Some(end) = &self.end {
                if key.user_key >= *end {
                    return None;
                }
            }

            // Older versions of a key we already yielded (or tombstoned)
            if self.last_key.as_deref() == Some(key.user_key.as_slice()) {
                continue;
            }

            // Not yet visible at this snapshot
            if key.seqno > self.snapshot {
                continue;
            }

            self.last_key = Some(key.user_key.clone());

            if let Some(value) = entry.value() {
                return Some((key.user_key.clone(), value.clone()));
            }
        }

        None
    }
}

struct MemoryReadTransaction<'a> {
    backend: &'a MemoryBackend,
    snapshot: SeqNo,
}

impl ReadTransaction for MemoryReadTransaction<'_> {
    fn get(&self, key: &[u8]) -> crate::Result<Option<Vec<u8>>> {
        self.backend.check_open()?;
        Ok(self.backend.get_at(key, self.snapshot))
    }

    fn iter_prefix(&self, prefix: &[u8]) -> KvIterator<'_> {
        if let Err(e) = self.backend.check_open() {
            return Box::new(std::iter::once(Err(e)));
        }

        let end = prefix_upper_bound(prefix);
        Box::new(
            self.backend
                .scan(prefix.to_vec(), end, self.snapshot)
                .map(Ok),
        )
    }

    fn iter_range(&self, first: &[u8], last: &[u8]) -> KvIterator<'_> {
        if let Err(e) = self.backend.check_open() {
            return Box::new(std::iter::once(Err(e)));
        }

        Box::new(
            self.backend
                .scan(first.to_vec(), Some(last.to_vec()), self.snapshot)
                .map(Ok),
        )
    }
}

struct MemoryWriteTransaction<'a> {
    backend: &'a MemoryBackend,
    _guard: MutexGuard<'a, ()>,
    snapshot: SeqNo,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pending_bytes: usize,
    hooks: Vec<CommitHook>,
    in_flush: bool,
}

impl MemoryWriteTransaction<'_> {
    fn maybe_flush(&mut self) -> crate::Result<()> {
        if self.in_flush {
            return Ok(());
        }

        if self.pending.len() >= self.backend.flush_entries
            || self.pending_bytes >= self.backend.flush_bytes
        {
            self.flush()?;
        }

        Ok(())
    }

    /// Runs the commit hooks, then moves the pending batch into the store
    /// under one new seqno so readers see it atomically.
    ///
    /// The in-flush flag keeps hook writes from re-entering here.
    fn flush(&mut self) -> crate::Result<()> {
        self.in_flush = true;

        let mut hooks = std::mem::take(&mut self.hooks);
        let mut result = Ok(());

        for hook in &mut hooks {
            if let Err(e) = hook(self) {
                result = Err(e);
                break;
            }
        }

        self.hooks = hooks;

        if result.is_ok() && !self.pending.is_empty() {
            let seqno = self.backend.visible_seqno.load(Ordering::Acquire) + 1;

            for (user_key, value) in std::mem::take(&mut self.pending) {
                self.backend
                    .items
                    .insert(InternalKey { user_key, seqno }, value);
            }

            self.backend.visible_seqno.store(seqno, Ordering::Release);

            // Our own flushed writes stay visible to us
            self.snapshot = seqno;
            self.pending_bytes = 0;
        }

        self.in_flush = false;

        result
    }

    fn merged_scan(&self, start: &[u8], end: Option<Vec<u8>>) -> MergedIter<'_> {
        let pending_range = self.pending.range((
            Bound::Included(start.to_vec()),
            match &end {
                Some(e) => Bound::Excluded(e.clone()),
                None => Bound::Unbounded,
            },
        ));

        MergedIter {
            pending: pending_range.peekable(),
            committed: self
                .backend
                .scan(start.to_vec(), end, self.snapshot)
                .peekable(),
        }
    }
}

impl ReadTransaction for MemoryWriteTransaction<'_> {
    fn get(&self, key: &[u8]) -> crate::Result<Option<Vec<u8>>> {
        self.backend.check_open()?;

        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.clone());
        }

        Ok(self.backend.get_at(key, self.snapshot))
    }

    fn iter_prefix(&self, prefix: &[u8]) -> KvIterator<'_> {
        if let Err(e) = self.backend.check_open() {
            return Box::new(std::iter::once(Err(e)));
        }

        Box::new(self.merged_scan(prefix, prefix_upper_bound(prefix)).map(Ok))
    }

    fn iter_range(&self, first: &[u8], last: &[u8]) -> KvIterator<'_> {
        if let Err(e) = self.backend.check_open() {
            return Box::new(std::iter::once(Err(e)));
        }

        Box::new(self.merged_scan(first, Some(last.to_vec())).map(Ok))
    }
}

impl WriteAccess for MemoryWriteTransaction<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        self.backend.check_open()?;

        self.pending_bytes += key.len() + value.len();
        self.pending.insert(key.to_vec(), Some(value.to_vec()));

        self.maybe_flush()
    }

    fn delete(&mut self, key: &[u8]) -> crate::Result<()> {
        self.backend.check_open()?;

        self.pending_bytes += key.len();
        self.pending.insert(key.to_vec(), None);

        self.maybe_flush()
    }
}

impl WriteTransaction for MemoryWriteTransaction<'_> {
    fn checkpoint(&mut self) -> crate::Result<()> {
        self.maybe_flush()
    }

    fn commit(mut self: Box<Self>) -> crate::Result<()> {
        self.backend.check_open()?;
        self.flush()
    }
}

/// Merges the pending batch with the committed snapshot; pending entries
/// win ties, and pending tombstones hide committed values.
struct MergedIter<'a> {
    pending: std::iter::Peekable<std::collections::btree_map::Range<'a, Vec<u8>, Option<Vec<u8>>>>,
    committed: std::iter::Peekable<SnapshotIter<'a>>,
}

impl Iterator for MergedIter<'_> {
    type Item = KvPair;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            #[derive(Clone, Copy)]
            enum Side {
                Pending,
                Committed,
                Both,
            }

            let side = match (self.pending.peek(), self.committed.peek()) {
                (None, None) => return None,
                (Some(_), None) => Side::Pending,
                (None, Some(_)) => Side::Committed,
                (Some((pk, _)), Some((ck, _))) => match pk.as_slice().cmp(ck.as_slice()) {
                    std::cmp::Ordering::Less => Side::Pending,
                    std::cmp::Ordering::Greater => Side::Committed,
                    std::cmp::Ordering::Equal => Side::Both,
                },
            };

            match side {
                Side::Committed => {
                    if let Some(kv) = self.committed.next() {
                        return Some(kv);
                    }
                }
                Side::Pending | Side::Both => {
                    if matches!(side, Side::Both) {
                        self.committed.next();
                    }
                    if let Some((k, v)) = self.pending.next() {
                        if let Some(v) = v {
                            return Some((k.clone(), v.clone()));
                        }
                        // Pending tombstone, key is gone
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn pairs(iter: KvIterator<'_>) -> Vec<KvPair> {
        iter.map(|kv| kv.unwrap()).collect()
    }

    #[test]
    fn get_put_delete() -> crate::Result<()> {
        let backend = MemoryBackend::new();

        assert_eq!(None, backend.get(b"a")?);
        backend.put(b"a", b"1")?;
        assert_eq!(Some(b"1".to_vec()), backend.get(b"a")?);
        backend.delete(b"a")?;
        assert_eq!(None, backend.get(b"a")?);

        Ok(())
    }

    #[test]
    fn snapshot_isolation() -> crate::Result<()> {
        let backend = MemoryBackend::new();
        backend.put(b"a", b"old")?;

        let snap = backend.new_read_transaction()?;

        {
            let mut tx = backend.new_write_transaction(vec![])?;
            tx.put(b"a", b"new")?;
            tx.put(b"b", b"2")?;

            // Uncommitted writes are visible inside the transaction only
            assert_eq!(Some(b"new".to_vec()), tx.get(b"a")?);
            assert_eq!(Some(b"old".to_vec()), snap.get(b"a")?);

            tx.commit()?;
        }

        // The old snapshot still sees the old state
        assert_eq!(Some(b"old".to_vec()), snap.get(b"a")?);
        assert_eq!(None, snap.get(b"b")?);

        let snap = backend.new_read_transaction()?;
        assert_eq!(Some(b"new".to_vec()), snap.get(b"a")?);
        assert_eq!(Some(b"2".to_vec()), snap.get(b"b")?);

        Ok(())
    }

    #[test]
    fn prefix_scan_merges_pending() -> crate::Result<()> {
        let backend = MemoryBackend::new();
        backend.put(b"k/a", b"1")?;
        backend.put(b"k/c", b"3")?;
        backend.put(b"x/z", b"9")?;

        let mut tx = backend.new_write_transaction(vec![])?;
        tx.put(b"k/b", b"2")?;
        tx.delete(b"k/c")?;

        let got = pairs(tx.iter_prefix(b"k/"));
        assert_eq!(
            vec![
                (b"k/a".to_vec(), b"1".to_vec()),
                (b"k/b".to_vec(), b"2".to_vec()),
            ],
            got
        );

        tx.commit()?;

        let snap = backend.new_read_transaction()?;
        let got = pairs(snap.iter_prefix(b"k/"));
        assert_eq!(2, got.len());

        Ok(())
    }

    #[test]
    fn range_scan_is_half_open() -> crate::Result<()> {
        let backend = MemoryBackend::new();
        for k in [b"a", b"b", b"c", b"d"] {
            backend.put(k, b"v")?;
        }

        let snap = backend.new_read_transaction()?;
        let got = pairs(snap.iter_range(b"b", b"d"));
        assert_eq!(
            vec![b"b".to_vec(), b"c".to_vec()],
            got.into_iter().map(|(k, _)| k).collect::<Vec<_>>()
        );

        Ok(())
    }

    #[test]
    fn commit_hooks_run_on_flush_without_recursion() -> crate::Result<()> {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let backend = MemoryBackend::with_flush_thresholds(usize::MAX, 4);
        let calls = Arc::new(AtomicUsize::new(0));

        let hook_calls = Arc::clone(&calls);
        let hook: CommitHook = Box::new(move |w| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
            // A hook may write to the same transaction without re-flushing
            w.put(b"meta", b"state")
        });

        let mut tx = backend.new_write_transaction(vec![hook])?;
        for i in 0..10u8 {
            tx.put(&[b'k', i], b"v")?;
        }
        tx.commit()?;

        // Two threshold flushes plus the commit flush
        assert_eq!(3, calls.load(Ordering::SeqCst));
        assert_eq!(Some(b"state".to_vec()), backend.get(b"meta")?);

        Ok(())
    }

    #[test]
    fn closed_backend_fails() -> crate::Result<()> {
        let backend = MemoryBackend::new();
        backend.put(b"a", b"1")?;
        backend.close()?;

        assert!(matches!(backend.get(b"a"), Err(crate::Error::Closed)));
        assert!(matches!(
            backend.new_write_transaction(vec![]),
            Err(crate::Error::Closed)
        ));

        Ok(())
    }
}
