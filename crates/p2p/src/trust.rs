//! Bounded recency set of canonical block hashes.

use lru::LruCache;
use opsync_types::Hash;
use std::num::NonZeroUsize;

/// Hashes that are, or have been, canonical at one point within the current
/// sync horizon.
///
/// Membership is what allows a quarantined block to be promoted to the
/// receiver. Bounded by recency: the set grows one entry per delivered block
/// plus two per range request, and only hashes still present in the much
/// smaller quarantine are ever looked up for promotion, so evicting old
/// entries is safe.
pub(crate) struct TrustSet {
    inner: LruCache<Hash, ()>,
}

impl TrustSet {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Mark a hash as trusted.
    pub(crate) fn add(&mut self, hash: Hash) {
        self.inner.push(hash, ());
    }

    /// Whether a hash is trusted. Does not refresh recency.
    pub(crate) fn contains(&self, hash: &Hash) -> bool {
        self.inner.contains(hash)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}
