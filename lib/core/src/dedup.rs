//! LSH-based near-duplicate index.
//!
//! Answers "is there a stored vector within L2 distance epsilon?" with
//! `num_hash_tables` random-hyperplane tables. Hash collisions only
//! nominate candidates; every candidate is verified with an exact squared
//! distance before being reported.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rng::XorShift64;
use crate::simd;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub epsilon: f32,
    pub num_hash_tables: usize,
    /// Clamped to 24 (16M buckets per table).
    pub hash_bits: usize,
    pub seed: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            num_hash_tables: 8,
            hash_bits: 12,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicatePair {
    pub original: usize,
    pub duplicate: usize,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored under this new index.
    Inserted(usize),
    /// A vector within epsilon already exists at this index; nothing
    /// was stored.
    Duplicate(usize),
}

/// Bitmap for deduplicating candidates across tables; reused between
/// rows during a scan instead of reallocating per row.
struct SeenSet {
    words: Vec<u64>,
}

impl SeenSet {
    fn with_capacity(n: usize) -> Self {
        Self {
            words: vec![0; n.div_ceil(64)],
        }
    }

    fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Returns true if `idx` was already marked.
    fn test_and_set(&mut self, idx: usize) -> bool {
        let word = &mut self.words[idx / 64];
        let bit = 1u64 << (idx % 64);
        let seen = *word & bit != 0;
        *word |= bit;
        seen
    }
}

struct DedupState {
    /// Flat row-major vector storage.
    vectors: Vec<f32>,
    count: usize,
    /// Per table, per bucket: indices of stored vectors.
    tables: Vec<Vec<Vec<u32>>>,
}

/// Near-duplicate index. Hyperplanes are fixed at construction; `clear`
/// drops the stored vectors but keeps them, so hashing stays stable
/// across reuse.
pub struct DedupIndex {
    dimension: usize,
    config: DedupConfig,
    /// `num_hash_tables * hash_bits * dimension` floats.
    hyperplanes: Vec<f32>,
    state: RwLock<DedupState>,
}

impl DedupIndex {
    pub fn new(dimension: usize, config: DedupConfig) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidArgument("dimension must be nonzero".into()));
        }

        let mut config = config;
        if config.epsilon < 0.0 {
            return Err(Error::InvalidArgument("epsilon must be non-negative".into()));
        }
        if config.num_hash_tables == 0 {
            config.num_hash_tables = 8;
        }
        if config.hash_bits == 0 {
            config.hash_bits = 12;
        }
        config.hash_bits = config.hash_bits.min(24);
        if config.seed == 0 {
            config.seed = 42;
        }

        // Standard-normal hyperplanes from one seeded stream.
        let mut rng = XorShift64::new(config.seed);
        let total = config.num_hash_tables * config.hash_bits * dimension;
        let hyperplanes: Vec<f32> = (0..total).map(|_| rng.next_gaussian()).collect();

        let num_buckets = 1usize << config.hash_bits;
        let tables = (0..config.num_hash_tables)
            .map(|_| vec![Vec::new(); num_buckets])
            .collect();

        Ok(Self {
            dimension,
            config,
            hyperplanes,
            state: RwLock::new(DedupState {
                vectors: Vec::new(),
                count: 0,
                tables,
            }),
        })
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn count(&self) -> usize {
        self.state.read().count
    }

    fn hash_vector(&self, data: &[f32], table_idx: usize) -> u32 {
        let base = table_idx * self.config.hash_bits * self.dimension;
        let mut hash = 0u32;
        for b in 0..self.config.hash_bits {
            let plane = &self.hyperplanes[base + b * self.dimension..base + (b + 1) * self.dimension];
            if simd::dot_product(data, plane) >= 0.0 {
                hash |= 1 << b;
            }
        }
        hash
    }

    fn check_dim(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.dimension {
            return Err(Error::InvalidDimension {
                expected: self.dimension,
                actual: data.len(),
            });
        }
        Ok(())
    }

    /// Exact-verified membership test. Returns the index of the first
    /// stored vector within epsilon, if any.
    pub fn check(&self, data: &[f32]) -> Result<Option<usize>> {
        self.check_dim(data)?;
        let state = self.state.read();
        Ok(self.check_locked(&state, data))
    }

    fn check_locked(&self, state: &DedupState, data: &[f32]) -> Option<usize> {
        if state.count == 0 {
            return None;
        }

        let eps_sq = self.config.epsilon * self.config.epsilon;
        let num_buckets = 1usize << self.config.hash_bits;
        let mut seen = SeenSet::with_capacity(state.count);

        for t in 0..self.config.num_hash_tables {
            let bucket = (self.hash_vector(data, t) as usize) % num_buckets;
            for &idx in &state.tables[t][bucket] {
                let idx = idx as usize;
                if idx >= state.count || seen.test_and_set(idx) {
                    continue;
                }
                let existing = &state.vectors[idx * self.dimension..(idx + 1) * self.dimension];
                if simd::l2_squared(data, existing) <= eps_sq {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Insert unless a near-duplicate already exists.
    pub fn insert(&self, data: &[f32]) -> Result<InsertOutcome> {
        self.check_dim(data)?;
        let mut state = self.state.write();

        if let Some(existing) = self.check_locked(&state, data) {
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let new_index = state.count;
        state.vectors.extend_from_slice(data);
        state.count += 1;

        let num_buckets = 1usize << self.config.hash_bits;
        for t in 0..self.config.num_hash_tables {
            let bucket = (self.hash_vector(data, t) as usize) % num_buckets;
            state.tables[t][bucket].push(new_index as u32);
        }
        Ok(InsertOutcome::Inserted(new_index))
    }

    /// Append without the duplicate guard. For bulk loads where the
    /// caller vets the data afterwards with [`DedupIndex::scan`].
    pub fn insert_unchecked(&self, data: &[f32]) -> Result<usize> {
        self.check_dim(data)?;
        let mut state = self.state.write();

        let new_index = state.count;
        state.vectors.extend_from_slice(data);
        state.count += 1;

        let num_buckets = 1usize << self.config.hash_bits;
        for t in 0..self.config.num_hash_tables {
            let bucket = (self.hash_vector(data, t) as usize) % num_buckets;
            state.tables[t][bucket].push(new_index as u32);
        }
        Ok(new_index)
    }

    /// Enumerate every stored near-duplicate pair exactly once, in
    /// ascending `(original, duplicate)` order with `original < duplicate`.
    pub fn scan(&self) -> Vec<DuplicatePair> {
        let state = self.state.read();
        if state.count < 2 {
            return Vec::new();
        }

        let eps_sq = self.config.epsilon * self.config.epsilon;
        let num_buckets = 1usize << self.config.hash_bits;
        let mut results = Vec::new();
        let mut seen = SeenSet::with_capacity(state.count);
        let mut row_matches = Vec::new();

        for i in 0..state.count {
            let vec_i = &state.vectors[i * self.dimension..(i + 1) * self.dimension];
            seen.clear();
            row_matches.clear();

            for t in 0..self.config.num_hash_tables {
                let bucket = (self.hash_vector(vec_i, t) as usize) % num_buckets;
                for &j in &state.tables[t][bucket] {
                    let j = j as usize;
                    if j <= i || j >= state.count || seen.test_and_set(j) {
                        continue;
                    }
                    let vec_j = &state.vectors[j * self.dimension..(j + 1) * self.dimension];
                    let dist_sq = simd::l2_squared(vec_i, vec_j);
                    if dist_sq <= eps_sq {
                        row_matches.push((j, dist_sq.sqrt()));
                    }
                }
            }

            row_matches.sort_unstable_by_key(|&(j, _)| j);
            results.extend(row_matches.iter().map(|&(j, distance)| DuplicatePair {
                original: i,
                duplicate: j,
                distance,
            }));
        }
        results
    }

    /// Drop all stored vectors and bucket contents. Hyperplanes and the
    /// vector buffer allocation survive for reuse.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.vectors.clear();
        state.count = 0;
        for table in &mut state.tables {
            for bucket in table {
                bucket.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DedupConfig {
        DedupConfig {
            epsilon: 0.01,
            num_hash_tables: 8,
            hash_bits: 8,
            seed: 42,
        }
    }

    #[test]
    fn insert_then_check_finds_the_vector() {
        let index = DedupIndex::new(4, test_config()).unwrap();
        let v = [1.0, 2.0, 3.0, 4.0];

        let outcome = index.insert(&v).unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted(0));
        assert_eq!(index.check(&v).unwrap(), Some(0));
    }

    #[test]
    fn duplicate_insert_does_not_store() {
        let index = DedupIndex::new(4, test_config()).unwrap();
        let v = [1.0, 2.0, 3.0, 4.0];

        index.insert(&v).unwrap();
        assert_eq!(index.insert(&v).unwrap(), InsertOutcome::Duplicate(0));
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn distinct_vectors_are_stored_separately() {
        let index = DedupIndex::new(4, test_config()).unwrap();
        assert_eq!(
            index.insert(&[1.0, 0.0, 0.0, 0.0]).unwrap(),
            InsertOutcome::Inserted(0)
        );
        assert_eq!(
            index.insert(&[0.0, 1.0, 0.0, 0.0]).unwrap(),
            InsertOutcome::Inserted(1)
        );
        assert_eq!(index.count(), 2);
        assert!(index.check(&[0.0, 0.0, 1.0, 0.0]).unwrap().is_none());
    }

    #[test]
    fn zero_epsilon_means_exact_equality() {
        let config = DedupConfig {
            epsilon: 0.0,
            ..test_config()
        };
        let index = DedupIndex::new(2, config).unwrap();

        index.insert(&[1.5, 2.5]).unwrap();
        assert_eq!(
            index.insert(&[1.5, 2.5]).unwrap(),
            InsertOutcome::Duplicate(0)
        );
        assert_eq!(
            index.insert(&[1.5, 2.5001]).unwrap(),
            InsertOutcome::Inserted(1)
        );
    }

    #[test]
    fn scan_on_guarded_inserts_finds_nothing() {
        let index = DedupIndex::new(2, test_config()).unwrap();
        index.insert(&[0.0, 0.0]).unwrap();
        index.insert(&[10.0, 10.0]).unwrap();
        index.insert(&[20.0, 20.0]).unwrap();
        assert_eq!(index.count(), 3);
        // The guard already rejected anything within epsilon.
        assert!(index.scan().is_empty());
    }

    #[test]
    fn scan_emits_each_pair_once_in_ascending_order() {
        let config = DedupConfig {
            epsilon: 1.0,
            num_hash_tables: 8,
            hash_bits: 4,
            seed: 7,
        };
        let index = DedupIndex::new(2, config).unwrap();

        // Bulk-loaded without the guard: two exact-duplicate clusters
        // (identical vectors always share every bucket) and one isolated
        // point.
        index.insert_unchecked(&[1.0, 2.0]).unwrap();
        index.insert_unchecked(&[5.0, 5.0]).unwrap();
        index.insert_unchecked(&[5.0, 5.0]).unwrap();
        index.insert_unchecked(&[1.0, 2.0]).unwrap();
        index.insert_unchecked(&[100.0, 100.0]).unwrap();

        let pairs = index.scan();
        assert_eq!(pairs.len(), 2);

        assert_eq!((pairs[0].original, pairs[0].duplicate), (0, 3));
        assert_eq!(pairs[0].distance, 0.0);

        assert_eq!((pairs[1].original, pairs[1].duplicate), (1, 2));
        assert_eq!(pairs[1].distance, 0.0);

        // Ascending (i, j) with i < j throughout.
        for w in pairs.windows(2) {
            assert!((w[0].original, w[0].duplicate) < (w[1].original, w[1].duplicate));
        }
        for p in &pairs {
            assert!(p.original < p.duplicate);
        }
    }

    #[test]
    fn clear_preserves_hyperplanes_and_reuses_storage() {
        let index = DedupIndex::new(3, test_config()).unwrap();
        index.insert(&[1.0, 2.0, 3.0]).unwrap();
        index.insert(&[4.0, 5.0, 6.0]).unwrap();

        index.clear();
        assert_eq!(index.count(), 0);
        assert!(index.check(&[1.0, 2.0, 3.0]).unwrap().is_none());

        // Reinsertion behaves exactly as on a fresh index.
        assert_eq!(
            index.insert(&[1.0, 2.0, 3.0]).unwrap(),
            InsertOutcome::Inserted(0)
        );
        assert_eq!(index.check(&[1.0, 2.0, 3.0]).unwrap(), Some(0));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let index = DedupIndex::new(4, test_config()).unwrap();
        assert!(index.insert(&[1.0, 2.0]).is_err());
        assert!(index.check(&[1.0, 2.0]).is_err());
    }
}
