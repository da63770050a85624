//! Query result cache keyed by content fingerprints.
//!
//! The key is a 64-bit FNV-1a fingerprint of the query bytes XORed with
//! fingerprints of `k` and the distance type; hash equality alone is never
//! trusted, a hit also requires a byte-exact query comparison. Entries are
//! held in a slab with index links for both the hash-bucket chains and the
//! recency list, so eviction never chases heap pointers.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::vector::DistanceType;

const CACHE_BUCKETS: usize = 1024;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Fingerprint of `(query bytes, k, distance type)`.
fn compute_key(query: &[f32], k: usize, distance_type: DistanceType) -> u64 {
    let mut query_bytes = Vec::with_capacity(query.len() * 4);
    for &x in query {
        query_bytes.extend_from_slice(&x.to_le_bytes());
    }
    let mut hash = fnv1a_64(&query_bytes);
    hash ^= fnv1a_64(&(k as u64).to_le_bytes());
    hash ^= fnv1a_64(&(distance_type as u32).to_le_bytes());
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    /// 0 disables expiry.
    pub ttl_seconds: u64,
    /// 0 disables mutation-count invalidation.
    pub invalidate_after_mutations: u64,
    pub policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_memory_bytes: 64 * 1024 * 1024,
            ttl_seconds: 60,
            invalidate_after_mutations: 0,
            policy: EvictionPolicy::Lru,
        }
    }
}

/// Owned copy of a cached search result.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub indices: Vec<u64>,
    pub distances: Vec<f32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub memory_bytes: usize,
    pub hit_rate: f64,
}

struct Entry {
    key_hash: u64,
    query: Vec<f32>,
    k: usize,
    distance_type: DistanceType,

    indices: Vec<u64>,
    distances: Vec<f32>,

    created_at: u64,
    access_count: u64,
    memory_size: usize,

    // Recency list links (head = most recently used) and bucket chain,
    // all as slab indices.
    prev: Option<usize>,
    next: Option<usize>,
    hash_next: Option<usize>,
}

impl Entry {
    fn matches(&self, query: &[f32], k: usize, distance_type: DistanceType) -> bool {
        self.k == k
            && self.distance_type == distance_type
            && self.query.len() == query.len()
            && self
                .query
                .iter()
                .zip(query)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

fn entry_memory_size(dimension: usize, count: usize) -> usize {
    std::mem::size_of::<Entry>() + dimension * 4 + count * (8 + 4)
}

fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct CacheState {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    buckets: Vec<Option<usize>>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,

    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
    entries: usize,
    memory: usize,
    mutation_count: u64,
}

impl CacheState {
    fn unlink_lru(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.slots[idx].as_ref().unwrap();
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.lru_tail = prev,
        }
        let e = self.slots[idx].as_mut().unwrap();
        e.prev = None;
        e.next = None;
    }

    fn push_lru_front(&mut self, idx: usize) {
        let old_head = self.lru_head;
        {
            let e = self.slots[idx].as_mut().unwrap();
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().unwrap().prev = Some(idx);
        }
        self.lru_head = Some(idx);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        self.unlink_lru(idx);
        self.push_lru_front(idx);
    }

    fn unlink_bucket(&mut self, idx: usize) {
        let key_hash = self.slots[idx].as_ref().unwrap().key_hash;
        let bi = (key_hash % CACHE_BUCKETS as u64) as usize;
        let mut cur = self.buckets[bi];
        let mut prev: Option<usize> = None;
        while let Some(c) = cur {
            if c == idx {
                let next = self.slots[c].as_ref().unwrap().hash_next;
                match prev {
                    Some(p) => self.slots[p].as_mut().unwrap().hash_next = next,
                    None => self.buckets[bi] = next,
                }
                self.slots[idx].as_mut().unwrap().hash_next = None;
                return;
            }
            prev = cur;
            cur = self.slots[c].as_ref().unwrap().hash_next;
        }
    }

    /// Fully remove an entry from the slab and both link structures.
    fn remove(&mut self, idx: usize) {
        self.unlink_lru(idx);
        self.unlink_bucket(idx);
        let e = self.slots[idx].take().unwrap();
        self.entries -= 1;
        self.memory -= e.memory_size;
        self.free.push(idx);
    }

    fn evict_one(&mut self, policy: EvictionPolicy) {
        let victim = match policy {
            EvictionPolicy::Lru => self.lru_tail,
            EvictionPolicy::Lfu => {
                // Scan from the tail towards the head; the coldest
                // access count wins, ties broken by LRU order.
                let mut min_access = u64::MAX;
                let mut victim = None;
                let mut cur = self.lru_tail;
                while let Some(c) = cur {
                    let e = self.slots[c].as_ref().unwrap();
                    if e.access_count < min_access {
                        min_access = e.access_count;
                        victim = Some(c);
                    }
                    cur = e.prev;
                }
                victim
            }
        };

        if let Some(v) = victim {
            self.remove(v);
            self.evictions += 1;
        }
    }

    fn flush(&mut self) {
        let mut cur = self.lru_head;
        while let Some(c) = cur {
            cur = self.slots[c].as_ref().unwrap().next;
            self.slots[c] = None;
            self.free.push(c);
            self.invalidations += 1;
        }
        self.buckets.iter_mut().for_each(|b| *b = None);
        self.lru_head = None;
        self.lru_tail = None;
        self.entries = 0;
        self.memory = 0;
        self.mutation_count = 0;
    }

    fn alloc(&mut self, entry: Entry) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    fn find(&self, hash: u64, query: &[f32], k: usize, distance_type: DistanceType) -> Option<usize> {
        let bi = (hash % CACHE_BUCKETS as u64) as usize;
        let mut cur = self.buckets[bi];
        while let Some(c) = cur {
            let e = self.slots[c].as_ref().unwrap();
            if e.key_hash == hash && e.matches(query, k, distance_type) {
                return Some(c);
            }
            cur = e.hash_next;
        }
        None
    }
}

/// Client-side query result cache.
pub struct QueryCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                slots: Vec::new(),
                free: Vec::new(),
                buckets: vec![None; CACHE_BUCKETS],
                lru_head: None,
                lru_tail: None,
                hits: 0,
                misses: 0,
                evictions: 0,
                invalidations: 0,
                entries: 0,
                memory: 0,
                mutation_count: 0,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a cached result. Expired entries are evicted before the
    /// miss is reported.
    pub fn lookup(
        &self,
        query: &[f32],
        k: usize,
        distance_type: DistanceType,
    ) -> Result<Option<CachedResult>> {
        if query.is_empty() || k == 0 {
            return Err(Error::InvalidArgument(
                "query must be non-empty and k nonzero".into(),
            ));
        }

        let hash = compute_key(query, k, distance_type);
        let mut state = self.state.lock();

        let Some(idx) = state.find(hash, query, k, distance_type) else {
            state.misses += 1;
            return Ok(None);
        };

        let expired = self.config.ttl_seconds > 0 && {
            let created = state.slots[idx].as_ref().unwrap().created_at;
            now_seconds().saturating_sub(created) > self.config.ttl_seconds
        };
        if expired {
            state.remove(idx);
            state.invalidations += 1;
            state.misses += 1;
            return Ok(None);
        }

        let result = {
            let e = state.slots[idx].as_mut().unwrap();
            e.access_count += 1;
            CachedResult {
                indices: e.indices.clone(),
                distances: e.distances.clone(),
            }
        };
        state.touch(idx);
        state.hits += 1;
        Ok(Some(result))
    }

    /// Insert a result, replacing any existing entry with the same key.
    /// May evict synchronously to satisfy the entry and memory caps.
    pub fn store(
        &self,
        query: &[f32],
        k: usize,
        distance_type: DistanceType,
        indices: &[u64],
        distances: &[f32],
    ) -> Result<()> {
        if query.is_empty() {
            return Err(Error::InvalidArgument("query must be non-empty".into()));
        }
        if indices.len() != distances.len() {
            return Err(Error::InvalidArgument(
                "indices and distances length mismatch".into(),
            ));
        }

        let mem_needed = entry_memory_size(query.len(), indices.len());
        let hash = compute_key(query, k, distance_type);
        let mut state = self.state.lock();

        while state.entries >= self.config.max_entries && state.entries > 0 {
            state.evict_one(self.config.policy);
        }
        while state.memory + mem_needed > self.config.max_memory_bytes && state.entries > 0 {
            state.evict_one(self.config.policy);
        }

        if let Some(existing) = state.find(hash, query, k, distance_type) {
            state.remove(existing);
        }

        let now = now_seconds();
        let bi = (hash % CACHE_BUCKETS as u64) as usize;
        let entry = Entry {
            key_hash: hash,
            query: query.to_vec(),
            k,
            distance_type,
            indices: indices.to_vec(),
            distances: distances.to_vec(),
            created_at: now,
            access_count: 1,
            memory_size: mem_needed,
            prev: None,
            next: None,
            hash_next: state.buckets[bi],
        };
        let idx = state.alloc(entry);
        state.buckets[bi] = Some(idx);
        state.push_lru_front(idx);
        state.entries += 1;
        state.memory += mem_needed;
        Ok(())
    }

    /// Record one collection mutation. Reaching the configured threshold
    /// flushes the whole cache and resets the counter.
    pub fn notify_mutation(&self) {
        let mut state = self.state.lock();
        state.mutation_count += 1;

        if self.config.invalidate_after_mutations > 0
            && state.mutation_count >= self.config.invalidate_after_mutations
        {
            let flushed = state.entries;
            state.flush();
            debug!(flushed, "query cache flushed on mutation threshold");
        }
    }

    /// Drop every entry and reset the mutation counter.
    pub fn invalidate_all(&self) {
        self.state.lock().flush();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let total = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            invalidations: state.invalidations,
            entries: state.entries,
            memory_bytes: state.memory,
            hit_rate: if total > 0 {
                state.hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.hits = 0;
        state.misses = 0;
        state.evictions = 0;
        state.invalidations = 0;
    }
}
