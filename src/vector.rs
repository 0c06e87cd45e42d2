// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Short device identifier used inside version vectors
pub type ShortId = u64;

/// One modification counter of a version vector
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Counter {
    /// Short identifier of the modifying device
    pub id: ShortId,

    /// Number of modifications made by that device
    pub value: u64,
}

/// Outcome of comparing two version vectors under vector-clock rules
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VectorOrdering {
    /// Identical counters
    Equal,

    /// Every counter at least as high, at least one higher
    Greater,

    /// Every counter at most as high, at least one lower
    Lesser,

    /// Neither dominates; this vector has the higher counter for the
    /// lowest differing device
    ConcurrentGreater,

    /// Neither dominates; the other vector has the higher counter for the
    /// lowest differing device
    ConcurrentLesser,
}

impl VectorOrdering {
    /// Whether the comparison found concurrent modifications.
    #[must_use]
    pub fn is_concurrent(&self) -> bool {
        matches!(self, Self::ConcurrentGreater | Self::ConcurrentLesser)
    }
}

/// A version vector: per-device modification counters, kept sorted by
/// device for canonical comparison and serialization.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Vector {
    counters: Vec<Counter>,
}

impl Vector {
    /// An empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a vector from `(device, value)` pairs; zero-valued counters
    /// are dropped and the rest sorted.
    #[must_use]
    pub fn with(pairs: &[(ShortId, u64)]) -> Self {
        let mut counters: Vec<Counter> = pairs
            .iter()
            .filter(|(_, value)| *value > 0)
            .map(|&(id, value)| Counter { id, value })
            .collect();
        counters.sort_unstable_by_key(|c| c.id);
        Self { counters }
    }

    /// The counters, sorted by device.
    #[must_use]
    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    /// Whether the vector carries no modifications at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.iter().all(|c| c.value == 0)
    }

    /// Bumps the counter for `id` above every counter in the vector,
    /// recording a new modification by that device.
    pub fn update(&mut self, id: ShortId) {
        let next = self.counters.iter().map(|c| c.value).max().unwrap_or(0) + 1;

        match self.counters.binary_search_by_key(&id, |c| c.id) {
            Ok(i) => {
                if let Some(c) = self.counters.get_mut(i) {
                    c.value = next;
                }
            }
            Err(i) => self.counters.insert(i, Counter { id, value: next }),
        }
    }

    /// Compares two vectors under vector-clock rules.
    #[must_use]
    pub fn compare(&self, other: &Self) -> VectorOrdering {
        let mut self_bigger = false;
        let mut other_bigger = false;

        // The lowest differing device decides the concurrent flavor, so
        // remember the first counter that differs either way.
        let mut first_diff_self_bigger = None;

        let mut a = self.counters.iter().peekable();
        let mut b = other.counters.iter().peekable();

        loop {
            let (av, bv) = match (a.peek().copied(), b.peek().copied()) {
                (None, None) => break,
                (Some(ac), None) => {
                    a.next();
                    (ac.value, 0)
                }
                (None, Some(bc)) => {
                    b.next();
                    (0, bc.value)
                }
                (Some(ac), Some(bc)) => match ac.id.cmp(&bc.id) {
                    std::cmp::Ordering::Less => {
                        a.next();
                        (ac.value, 0)
                    }
                    std::cmp::Ordering::Greater => {
                        b.next();
                        (0, bc.value)
                    }
                    std::cmp::Ordering::Equal => {
                        a.next();
                        b.next();
                        (ac.value, bc.value)
                    }
                },
            };

            if av != bv && first_diff_self_bigger.is_none() {
                first_diff_self_bigger = Some(av > bv);
            }
            if av > bv {
                self_bigger = true;
            }
            if bv > av {
                other_bigger = true;
            }
        }

        match (self_bigger, other_bigger) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::Greater,
            (false, true) => VectorOrdering::Lesser,
            (true, true) => {
                if first_diff_self_bigger.unwrap_or(false) {
                    VectorOrdering::ConcurrentGreater
                } else {
                    VectorOrdering::ConcurrentLesser
                }
            }
        }
    }

    /// Whether `self` equals or dominates `other`.
    #[must_use]
    pub fn greater_equal(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            VectorOrdering::Equal | VectorOrdering::Greater
        )
    }

    /// Whether the vectors are in conflict.
    #[must_use]
    pub fn concurrent(&self, other: &Self) -> bool {
        self.compare(other).is_concurrent()
    }

    /// Merges the maximum of both vectors into `self`.
    pub fn merge(&mut self, other: &Self) {
        for c in &other.counters {
            match self.counters.binary_search_by_key(&c.id, |s| s.id) {
                Ok(i) => {
                    if let Some(s) = self.counters.get_mut(i) {
                        s.value = s.value.max(c.value);
                    }
                }
                Err(i) => self.counters.insert(i, *c),
            }
        }
    }
}

impl Encode for Vector {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.counters.len() as u32)?;
        for c in &self.counters {
            writer.write_u64_varint(c.id)?;
            writer.write_u64_varint(c.value)?;
        }
        Ok(())
    }
}

impl Decode for Vector {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let len = reader.read_u32_varint()? as usize;

        let mut counters = Vec::with_capacity(len.min(1_024));
        for _ in 0..len {
            counters.push(Counter {
                id: reader.read_u64_varint()?,
                value: reader.read_u64_varint()?,
            });
        }

        Ok(Self { counters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn empty_and_equal() {
        assert!(Vector::new().is_empty());
        assert!(Vector::with(&[(1, 0)]).is_empty());
        assert_eq!(
            VectorOrdering::Equal,
            Vector::with(&[(1, 2)]).compare(&Vector::with(&[(1, 2)]))
        );
    }

    #[test]
    fn domination() {
        let a = Vector::with(&[(1, 2), (2, 1)]);
        let b = Vector::with(&[(1, 1), (2, 1)]);

        assert_eq!(VectorOrdering::Greater, a.compare(&b));
        assert_eq!(VectorOrdering::Lesser, b.compare(&a));
        assert!(a.greater_equal(&b));
        assert!(!b.greater_equal(&a));

        // A counter the other side lacks entirely
        let c = Vector::with(&[(1, 1)]);
        assert_eq!(VectorOrdering::Greater, b.compare(&c));
    }

    #[test]
    fn concurrency_is_symmetric() {
        let a = Vector::with(&[(1, 2), (2, 1)]);
        let b = Vector::with(&[(1, 1), (2, 2)]);

        assert_eq!(VectorOrdering::ConcurrentGreater, a.compare(&b));
        assert_eq!(VectorOrdering::ConcurrentLesser, b.compare(&a));
        assert!(a.concurrent(&b));
    }

    #[test]
    fn update_rises_above_all() {
        let mut v = Vector::with(&[(1, 5), (2, 9)]);
        v.update(1);
        assert_eq!(
            &[Counter { id: 1, value: 10 }, Counter { id: 2, value: 9 }],
            v.counters()
        );

        v.update(3);
        assert_eq!(11, v.counters()[2].value);
    }

    #[test]
    fn merge_takes_maxima() {
        let mut a = Vector::with(&[(1, 2), (3, 1)]);
        a.merge(&Vector::with(&[(1, 1), (2, 4)]));
        assert_eq!(Vector::with(&[(1, 2), (2, 4), (3, 1)]), a);
    }

    #[test]
    fn codec_roundtrip() {
        let v = Vector::with(&[(1, 2), (u64::MAX, u64::MAX)]);
        let bytes = v.encode_into_vec();
        assert_eq!(v, Vector::decode_from_slice(&bytes).unwrap());
    }
}
