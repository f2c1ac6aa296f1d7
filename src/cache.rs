//! Tiered cache of in-memory row lists.
//!
//! A closed buffer that kept its rows in memory publishes them here. Each
//! entry lives in up to three tiers at once:
//!
//! - **hard**: kept until the owner confirms its rows are on disk
//!   (`clear_for_reclaim`) or the table is disposed (`invalidate`).
//! - **soft**: bounded LRU, dropped wholesale on memory pressure (`reclaim`).
//! - **weak**: bounded map of id -> last known row count. Holds no rows and
//!   only answers whether a table was ever cached.
//!
//! All operations take one short lock and never do I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::data::Row;
use crate::error::{Result, TableError};
use crate::lru::LruCache;

pub type CachedRows = Arc<Vec<Row>>;

/// What the cache needs to know about the owner of an entry.
pub trait Cacheable {
    /// Process-unique identity of the owner.
    fn cache_id(&self) -> u64;

    /// Whether the owner's rows are durably written to disk.
    fn is_flushed_to_disk(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Hard,
    Soft,
    Weak,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub distinct: u64,
    pub invalidated: u64,
    pub reclaimed: u64,
    pub hard_hits: u64,
    pub soft_hits: u64,
    pub weak_hits: u64,
    pub misses: u64,
}

struct CacheState {
    hard: HashMap<u64, CachedRows>,
    soft: LruCache<u64, CachedRows>,
    weak: LruCache<u64, usize>,
    stats: CacheStats,
    last_log: Instant,
}

pub struct ReferenceCache {
    state: Mutex<CacheState>,
    stats_interval: Duration,
}

impl ReferenceCache {
    pub fn new(lru_capacity: usize, weak_capacity: usize, stats_interval: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                hard: HashMap::new(),
                soft: LruCache::new(lru_capacity),
                weak: LruCache::new(weak_capacity),
                stats: CacheStats::default(),
                last_log: Instant::now(),
            }),
            stats_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Entries are immutable once published; a poisoned lock still holds a
        // consistent map.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish the rows of a closed buffer in all three tiers.
    pub fn put(&self, id: u64, rows: CachedRows) {
        let mut s = self.lock();
        if !s.weak.contains(&id) && !s.hard.contains_key(&id) {
            s.stats.distinct += 1;
        }
        s.weak.put(id, rows.len());
        s.soft.put(id, Arc::clone(&rows));
        s.hard.insert(id, rows);
        self.maybe_log(&mut s);
    }

    /// Re-publish rows read back from disk, without a hard reference.
    pub fn put_soft(&self, id: u64, rows: CachedRows) {
        let mut s = self.lock();
        if !s.weak.contains(&id) {
            s.stats.distinct += 1;
        }
        s.weak.put(id, rows.len());
        s.soft.put(id, rows);
    }

    /// Rows of `id` from the strongest tier that still has them.
    ///
    /// Counts as an access: refreshes LRU recency and updates statistics.
    pub fn get(&self, id: u64) -> Option<CachedRows> {
        let mut s = self.lock();
        let result = if let Some(rows) = s.hard.get(&id).cloned() {
            s.stats.hard_hits += 1;
            s.soft.put(id, Arc::clone(&rows));
            Some(rows)
        } else if let Some(rows) = s.soft.get(&id).cloned() {
            s.stats.soft_hits += 1;
            Some(rows)
        } else {
            if s.weak.contains(&id) {
                s.stats.weak_hits += 1;
            } else {
                s.stats.misses += 1;
            }
            None
        };
        self.maybe_log(&mut s);
        result
    }

    /// Like `get` but without statistics or recency updates.
    pub fn get_silent(&self, id: u64) -> Option<CachedRows> {
        let s = self.lock();
        s.hard.get(&id).or_else(|| s.soft.peek(&id)).cloned()
    }

    /// Strongest tier currently holding `id`.
    pub fn tier(&self, id: u64) -> Option<CacheTier> {
        let s = self.lock();
        if s.hard.contains_key(&id) {
            Some(CacheTier::Hard)
        } else if s.soft.contains(&id) {
            Some(CacheTier::Soft)
        } else if s.weak.contains(&id) {
            Some(CacheTier::Weak)
        } else {
            None
        }
    }

    /// Whether rows of `id` are held by the hard or soft tier.
    pub fn contains(&self, id: u64) -> bool {
        let s = self.lock();
        s.hard.contains_key(&id) || s.soft.contains(&id)
    }

    /// Whether `id` was ever cached and not invalidated since.
    pub fn was_cached(&self, id: u64) -> bool {
        self.tier(id).is_some()
    }

    /// Last known row count recorded by the weak tier.
    pub fn last_known_size(&self, id: u64) -> Option<usize> {
        self.lock().weak.peek(&id).copied()
    }

    /// Drop the hard reference of an owner whose rows are on disk.
    ///
    /// Calling this before the owner is flushed is a contract violation.
    pub fn clear_for_reclaim(&self, owner: &dyn Cacheable) -> Result<()> {
        let id = owner.cache_id();
        if !owner.is_flushed_to_disk() {
            return Err(TableError::CacheContract(format!(
                "table {id} cleared for reclaim before it was flushed to disk"
            )));
        }
        let mut s = self.lock();
        s.hard.remove(&id);
        Ok(())
    }

    /// Remove `id` from every tier.
    pub fn invalidate(&self, id: u64) {
        let mut s = self.lock();
        let hard = s.hard.remove(&id).is_some();
        let soft = s.soft.remove(&id).is_some();
        let weak = s.weak.remove(&id).is_some();
        if hard || soft || weak {
            s.stats.invalidated += 1;
        }
    }

    /// Drop the soft tier after a memory alert. Returns the number of entries.
    pub fn reclaim(&self) -> usize {
        let mut s = self.lock();
        let n = s.soft.clear();
        s.stats.reclaimed += n as u64;
        if n > 0 {
            tracing::debug!("table cache reclaimed {} soft entries", n);
        }
        n
    }

    pub fn set_lru_capacity(&self, capacity: usize) {
        let mut s = self.lock();
        s.soft.set_capacity(capacity);
    }

    pub fn lru_capacity(&self) -> usize {
        self.lock().soft.capacity()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    fn maybe_log(&self, s: &mut CacheState) {
        if s.last_log.elapsed() < self.stats_interval {
            return;
        }
        s.last_log = Instant::now();
        let st = &s.stats;
        tracing::debug!(
            "table cache: {} distinct, {} invalidated, {} reclaimed; hits hard={} soft={} weak={}, misses={}; held hard={} soft={}",
            st.distinct,
            st.invalidated,
            st.reclaimed,
            st.hard_hits,
            st.soft_hits,
            st.weak_hits,
            st.misses,
            s.hard.len(),
            s.soft.len()
        );
    }
}

// ── Tests ───────────────────────────────────────────────────────────
