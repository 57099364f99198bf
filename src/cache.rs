// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::row::Row;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Bounded, access-ordered cache of decoded rows, keyed by row id.
///
/// Capacity is taken from the schema's cache size; at capacity the least
/// recently touched row is evicted. Capacities below 2 yield a no-op
/// cache, so tiny configurations cost nothing.
// NOTE: rustc_hash performed best: https://fjall-rs.github.io/post/fjall-2-1
pub struct RowCache {
    inner: Option<LruCache<i64, Row, rustc_hash::FxBuildHasher>>,
}

impl RowCache {
    /// Creates a cache for up to `capacity` rows.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let inner = if capacity < 2 {
            None
        } else {
            NonZeroUsize::new(capacity)
                .map(|cap| LruCache::with_hasher(cap, rustc_hash::FxBuildHasher))
        };

        Self { inner }
    }

    /// Whether this cache actually stores anything.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Number of cached rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, LruCache::len)
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a row, promoting it to most recently used.
    pub fn get(&mut self, id: i64) -> Option<Row> {
        self.inner.as_mut()?.get(&id).cloned()
    }

    /// Caches a row, evicting the eldest at capacity.
    pub fn put(&mut self, id: i64, row: Row) {
        if let Some(cache) = &mut self.inner {
            cache.put(id, row);
        }
    }

    /// Drops one row from the cache.
    pub fn evict(&mut self, id: i64) {
        if let Some(cache) = &mut self.inner {
            cache.pop(&id);
        }
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        if let Some(cache) = &mut self.inner {
            cache.clear();
        }
    }
}
