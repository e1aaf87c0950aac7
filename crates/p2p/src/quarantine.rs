//! LRU buffer of fetched-but-unverified sync results.

use crate::client::SyncResult;
use lru::LruCache;
use opsync_types::Hash;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// A result that left quarantine without being promoted.
///
/// Surfaced to the coordinator, which owns the trust set and decides how to
/// log the drop.
pub(crate) struct Dropped {
    pub(crate) hash: Hash,
    pub(crate) result: SyncResult,
}

/// Fetched blocks that could not be verified yet, keyed by hash with a
/// secondary index by block number.
///
/// The index holds exactly one hash per number: the most recently inserted
/// candidate. An older conflicting entry stays in the LRU until it ages out
/// but is no longer reachable by number. The index entry for a number is
/// removed whenever the entry it points at leaves the LRU, so every indexed
/// hash is always present in the LRU.
pub(crate) struct Quarantine {
    entries: LruCache<Hash, SyncResult>,
    by_number: HashMap<u64, Hash>,
}

impl Quarantine {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            entries: LruCache::new(capacity),
            by_number: HashMap::new(),
        }
    }

    /// Buffer a result, indexing it by number. Returns the LRU victim, if
    /// inserting pushed one out.
    pub(crate) fn insert(&mut self, result: SyncResult) -> Option<Dropped> {
        let hash = result.payload.block_hash();
        let number = result.payload.block_number();

        let evicted = self.entries.push(hash, result);
        let dropped = match evicted {
            // Same-key replacement is an update, not an eviction.
            Some((old_hash, _)) if old_hash == hash => None,
            Some((old_hash, old)) => {
                self.unindex(&old_hash, &old);
                Some(Dropped {
                    hash: old_hash,
                    result: old,
                })
            }
            None => None,
        };

        self.by_number.insert(number, hash);
        dropped
    }

    /// Look a result up by hash, refreshing its recency.
    pub(crate) fn get(&mut self, hash: &Hash) -> Option<&SyncResult> {
        self.entries.get(hash)
    }

    /// Remove a result by hash.
    pub(crate) fn remove(&mut self, hash: &Hash) -> Option<Dropped> {
        let result = self.entries.pop(hash)?;
        self.unindex(hash, &result);
        Some(Dropped {
            hash: *hash,
            result,
        })
    }

    /// The hash indexed for a block number, if any. No recency effect.
    pub(crate) fn hash_for_number(&self, number: u64) -> Option<Hash> {
        self.by_number.get(&number).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains(hash)
    }

    fn unindex(&mut self, hash: &Hash, result: &SyncResult) {
        let number = result.payload.block_number();
        if self.by_number.get(&number) == Some(hash) {
            self.by_number.remove(&number);
        }
    }
}
