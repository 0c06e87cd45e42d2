// Copyright (c) 2024-present, file-index
// This source code is licensed under both the Apache 2.0 and MIT License

use crate::{
    backend::Backend,
    db::Db,
    events::{EventLogger, NullEventLogger},
};
use std::{borrow::Cow, sync::Arc};

/// Suggested upper bound on the byte size of one `update` batch.
///
/// Clients feeding index data into [`crate::FileSet::update`] should cut
/// their batches around this size; the database itself accepts any size.
pub const MAX_BATCH_SIZE_BYTES: usize = 1_024 * 1_024;

/// Suggested upper bound on the number of files in one `update` batch.
pub const MAX_BATCH_SIZE_FILES: usize = 1_000;

/// Normalizes file names to the repository's canonical form.
///
/// The database stores names exactly as returned from here. The default
/// converts backslashes to forward slashes and strips trailing slashes;
/// callers on platforms with decomposed Unicode file names can plug in an
/// NFC-normalizing implementation.
pub trait NameNormalizer: Send + Sync {
    /// Returns the canonical form of `name`.
    fn normalize<'a>(&self, name: &'a str) -> Cow<'a, str>;
}

/// Forward slashes, no trailing slash, nothing else.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultNormalizer;

impl NameNormalizer for DefaultNormalizer {
    fn normalize<'a>(&self, name: &'a str) -> Cow<'a, str> {
        let trimmed = name.trim_end_matches('/');

        if trimmed.contains('\\') {
            Cow::Owned(trimmed.replace('\\', "/"))
        } else if trimmed.len() == name.len() {
            Cow::Borrowed(name)
        } else {
            Cow::Borrowed(trimmed)
        }
    }
}

/// Database configuration builder
#[derive(Clone)]
pub struct Config {
    /// Files with more blocks than this get their block list stored
    /// out-of-line, content-addressed by hash
    pub blocks_indirection_cutoff: usize,

    /// Version vectors wider than this many counters get stored
    /// out-of-line, content-addressed by hash
    pub version_indirection_cutoff: usize,

    /// Name normalizer applied to every incoming file name
    pub normalizer: Arc<dyn NameNormalizer>,

    /// Sink for operator-visible anomalies
    pub events: Arc<dyn EventLogger>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blocks_indirection_cutoff: 40,
            version_indirection_cutoff: 2,
            normalizer: Arc::new(DefaultNormalizer),
            events: Arc::new(NullEventLogger),
        }
    }
}

impl Config {
    /// Initializes a new config with default tunables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block list indirection cutoff.
    ///
    /// Defaults to 40 blocks.
    #[must_use]
    pub fn blocks_indirection_cutoff(mut self, cutoff: usize) -> Self {
        self.blocks_indirection_cutoff = cutoff;
        self
    }

    /// Sets the version vector indirection cutoff.
    ///
    /// Defaults to 2 counters.
    #[must_use]
    pub fn version_indirection_cutoff(mut self, cutoff: usize) -> Self {
        self.version_indirection_cutoff = cutoff;
        self
    }

    /// Sets the name normalizer.
    #[must_use]
    pub fn normalizer(mut self, normalizer: Arc<dyn NameNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Sets the event logger.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventLogger>) -> Self {
        self.events = events;
        self
    }

    /// Opens a database on the given backend, running any pending schema
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Downgrade`] if the backend was written by a
    /// newer version of this software, or any backend error.
    pub fn open(self, backend: Arc<dyn Backend>) -> crate::Result<Arc<Db>> {
        Db::open(backend, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn normalizer_defaults() {
        let n = DefaultNormalizer;
        assert_eq!("a/b", n.normalize("a/b"));
        assert_eq!("a/b", n.normalize("a\\b"));
        assert_eq!("a/b", n.normalize("a/b/"));
        assert_eq!("", n.normalize("/").as_ref());
    }
}
