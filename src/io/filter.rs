//! Duplicate detection capability used by the buffered writer.
//!
//! The writer derives a key from each request's destination path and asks the
//! filter whether that key was already persisted. How the filter answers
//! (in-memory set, database index, content hash) is entirely its own business.

use dashmap::DashSet;

/// Answers whether content for a key has already been persisted.
///
/// Implementations must be shareable with the writer's background worker.
pub trait DuplicateFilter: Send + Sync {
    /// Returns true if the key was already persisted and the write should be skipped.
    fn exists(&self, key: &str) -> bool;

    /// Called by the worker after the payload for `key` was written to disk.
    fn mark_persisted(&self, _key: &str, _data: &[u8]) {}
}

/// Filter that never reports a duplicate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDuplicates;

impl DuplicateFilter for NoDuplicates {
    fn exists(&self, _key: &str) -> bool {
        false
    }
}

/// Process-local filter remembering every key written during this run.
#[derive(Debug, Default)]
pub struct MemoryFilter {
    seen: DashSet<String>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the filter with keys that should be treated as already persisted.
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let seen = DashSet::new();
        for key in keys {
            seen.insert(key.into());
        }
        Self { seen }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl DuplicateFilter for MemoryFilter {
    fn exists(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    fn mark_persisted(&self, key: &str, _data: &[u8]) {
        self.seen.insert(key.to_string());
    }
}
