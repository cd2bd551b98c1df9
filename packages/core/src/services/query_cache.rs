//! Query Result Cache
//!
//! Per-tenant LRU cache over the three graph queries. Entries are bounded
//! both by capacity (default 1024) and by age (default 60 seconds).
//!
//! # Cache Invalidation
//!
//! Invalidation is wholesale per subject and per capability: any mutation
//! touching a node's edges drops every cached answer mentioning that node,
//! and any mutation touching a capability drops every answer for it. Entity
//! and schema mutations clear the cache outright.
//!
//! The cache is purely an optimization: it can be disabled wholesale and no
//! correctness property may depend on it.

use crate::models::edge::{Capability, EdgeId};
use crate::services::graph_index::AccessorEntry;
use lru::LruCache;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Key identifying one cached query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Can {
        subject: String,
        capability: Capability,
        object: String,
    },
    Accessible {
        subject: String,
        capability: Capability,
    },
    Accessors {
        object: String,
        capability: Capability,
    },
}

impl QueryKey {
    fn capability(&self) -> &Capability {
        match self {
            QueryKey::Can { capability, .. }
            | QueryKey::Accessible { capability, .. }
            | QueryKey::Accessors { capability, .. } => capability,
        }
    }

    fn mentions(&self, node: &str) -> bool {
        match self {
            QueryKey::Can {
                subject, object, ..
            } => subject == node || object == node,
            QueryKey::Accessible { subject, .. } => subject == node,
            QueryKey::Accessors { object, .. } => object == node,
        }
    }
}

/// Cached answer for one query
#[derive(Debug, Clone)]
pub enum CachedAnswer {
    /// Witness path for an allowed `can`, or `None` for a denial
    Can(Option<Vec<EdgeId>>),
    Accessible(BTreeSet<String>),
    Accessors(Vec<AccessorEntry>),
}

struct CacheSlot {
    answer: CachedAnswer,
    stored_at: Instant,
}

/// Counters for the stats endpoint
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub enabled: bool,
}

/// LRU + TTL cache over query answers
pub struct QueryCache {
    entries: LruCache<QueryKey, CacheSlot>,
    ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    /// Create a cache with the given capacity and time bound
    pub fn new(capacity: usize, ttl: Duration, enabled: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a fresh cached answer
    pub fn get(&mut self, key: &QueryKey) -> Option<CachedAnswer> {
        if !self.enabled {
            return None;
        }
        match self.entries.get(key) {
            Some(slot) if slot.stored_at.elapsed() <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.answer.clone())
            }
            Some(_) => {
                self.entries.pop(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an answer
    pub fn put(&mut self, key: QueryKey, answer: CachedAnswer) {
        if !self.enabled {
            return;
        }
        self.entries.put(
            key,
            CacheSlot {
                answer,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every answer mentioning either endpoint of a mutated edge, and
    /// every answer for the mutated capability
    pub fn invalidate_edge(
        &mut self,
        source: &str,
        target: &str,
        capability: Option<&Capability>,
    ) {
        let stale: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|(key, _)| {
                key.mentions(source)
                    || key.mentions(target)
                    || capability.is_some_and(|c| key.capability() == c)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.entries.pop(&key);
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
            enabled: self.enabled,
        }
    }
}
