//! Late-interaction (MaxSim) index.
//!
//! Documents are variable-length sequences of token embeddings living in a
//! single contiguous pool; per-document metadata references the pool by
//! offset. Search runs in two stages: a cheap ranking on precomputed
//! average embeddings selects a candidate pool, then full MaxSim
//! (`sum over query tokens of the best dot product against any doc token`)
//! scores the candidates.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::simd;

const MAGIC: &[u8; 7] = b"GV_LINT";
const VERSION: u32 = 1;

const INITIAL_DOC_CAPACITY: usize = 64;
const INITIAL_POOL_CAPACITY: usize = 64 * 128; // tokens

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LateInteractionConfig {
    pub token_dimension: usize,
    pub max_doc_tokens: usize,
    pub max_query_tokens: usize,
    /// Stage-1 candidate pool size. Stage 1 is skipped entirely when the
    /// index holds no more than this many live documents, or when `k`
    /// reaches it.
    pub candidate_pool: usize,
}

impl Default for LateInteractionConfig {
    fn default() -> Self {
        Self {
            token_dimension: 128,
            max_doc_tokens: 512,
            max_query_tokens: 32,
            candidate_pool: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub doc_index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LateInteractionStats {
    pub documents: usize,
    pub tokens: usize,
    /// Approximate resident memory of pool, metadata and averages.
    pub memory_bytes: usize,
}

struct DocMeta {
    token_offset: usize,
    num_tokens: usize,
    deleted: bool,
    /// Precomputed at insertion; dropped on delete.
    avg_embedding: Option<Vec<f32>>,
}

struct IndexState {
    /// `pool_used * token_dimension` floats of live-and-dead token data.
    token_pool: Vec<f32>,
    pool_used: usize,
    /// Capacity in tokens; grows x2 below 1024 tokens, +50% above.
    pool_capacity: usize,
    docs: Vec<DocMeta>,
    active_docs: usize,
    active_tokens: usize,
}

impl IndexState {
    fn grow_pool(&mut self, dim: usize, needed_tokens: usize) {
        if self.pool_used + needed_tokens <= self.pool_capacity {
            return;
        }
        let mut new_cap = self.pool_capacity;
        while new_cap < self.pool_used + needed_tokens {
            new_cap = if new_cap < 1024 {
                new_cap * 2
            } else {
                new_cap + new_cap / 2
            };
        }
        self.token_pool
            .reserve_exact(new_cap * dim - self.token_pool.len());
        self.pool_capacity = new_cap;
    }
}

fn compute_avg(tokens: &[f32], num_tokens: usize, dim: usize) -> Vec<f32> {
    let mut avg = vec![0.0f32; dim];
    for t in 0..num_tokens {
        let tok = &tokens[t * dim..(t + 1) * dim];
        for (a, &x) in avg.iter_mut().zip(tok) {
            *a += x;
        }
    }
    if num_tokens > 0 {
        let inv = 1.0 / num_tokens as f32;
        for a in &mut avg {
            *a *= inv;
        }
    }
    avg
}

fn maxsim(query_tokens: &[f32], num_query: usize, doc_tokens: &[f32], num_doc: usize, dim: usize) -> f32 {
    let mut total = 0.0f32;
    for q in 0..num_query {
        let qvec = &query_tokens[q * dim..(q + 1) * dim];
        let mut best = f32::MIN;
        for d in 0..num_doc {
            let dvec = &doc_tokens[d * dim..(d + 1) * dim];
            let sim = simd::dot_product(qvec, dvec);
            if sim > best {
                best = sim;
            }
        }
        total += best;
    }
    total
}

type HeapItem = Reverse<(OrderedFloat<f32>, usize)>;

/// Two-stage MaxSim index. Searches take the read lock and may run in
/// parallel; inserts and deletes are exclusive.
pub struct LateInteractionIndex {
    config: LateInteractionConfig,
    state: RwLock<IndexState>,
}

impl LateInteractionIndex {
    pub fn new(config: LateInteractionConfig) -> Result<Self> {
        if config.token_dimension == 0
            || config.max_doc_tokens == 0
            || config.max_query_tokens == 0
            || config.candidate_pool == 0
        {
            return Err(Error::InvalidArgument(
                "late-interaction config fields must be nonzero".into(),
            ));
        }

        let mut token_pool = Vec::new();
        token_pool.reserve_exact(INITIAL_POOL_CAPACITY * config.token_dimension);

        Ok(Self {
            config,
            state: RwLock::new(IndexState {
                token_pool,
                pool_used: 0,
                pool_capacity: INITIAL_POOL_CAPACITY,
                docs: Vec::with_capacity(INITIAL_DOC_CAPACITY),
                active_docs: 0,
                active_tokens: 0,
            }),
        })
    }

    pub fn config(&self) -> &LateInteractionConfig {
        &self.config
    }

    /// Append a document. Returns its index; indices are never renumbered
    /// by deletes.
    pub fn add_doc(&self, token_embeddings: &[f32]) -> Result<usize> {
        let dim = self.config.token_dimension;
        if token_embeddings.is_empty() || token_embeddings.len() % dim != 0 {
            return Err(Error::InvalidDimension {
                expected: dim,
                actual: token_embeddings.len() % dim.max(1),
            });
        }
        let num_tokens = token_embeddings.len() / dim;
        if num_tokens > self.config.max_doc_tokens {
            return Err(Error::InvalidArgument(format!(
                "document has {num_tokens} tokens, max is {}",
                self.config.max_doc_tokens
            )));
        }

        let avg = compute_avg(token_embeddings, num_tokens, dim);

        let mut state = self.state.write();
        state.grow_pool(dim, num_tokens);

        let offset = state.pool_used;
        state.token_pool.extend_from_slice(token_embeddings);
        state.pool_used += num_tokens;

        let doc_index = state.docs.len();
        state.docs.push(DocMeta {
            token_offset: offset,
            num_tokens,
            deleted: false,
            avg_embedding: Some(avg),
        });
        state.active_docs += 1;
        state.active_tokens += num_tokens;
        Ok(doc_index)
    }

    /// Logically delete a document. Pool space is not reclaimed.
    pub fn delete(&self, doc_index: usize) -> Result<()> {
        let mut state = self.state.write();
        let num_tokens = match state.docs.get_mut(doc_index) {
            Some(doc) if !doc.deleted => {
                doc.deleted = true;
                doc.avg_embedding = None;
                doc.num_tokens
            }
            _ => return Err(Error::VectorNotFound(doc_index as u64)),
        };
        state.active_docs -= 1;
        state.active_tokens -= num_tokens;
        Ok(())
    }

    /// Two-stage top-k search. Hits come back in descending score order.
    pub fn search(&self, query_tokens: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let dim = self.config.token_dimension;
        if query_tokens.is_empty() || k == 0 {
            return Err(Error::InvalidArgument(
                "query must be non-empty and k nonzero".into(),
            ));
        }
        if query_tokens.len() % dim != 0 {
            return Err(Error::InvalidDimension {
                expected: dim,
                actual: query_tokens.len() % dim,
            });
        }
        let num_query = query_tokens.len() / dim;
        if num_query > self.config.max_query_tokens {
            return Err(Error::InvalidArgument(format!(
                "query has {num_query} tokens, max is {}",
                self.config.max_query_tokens
            )));
        }

        let state = self.state.read();
        if state.active_docs == 0 {
            return Ok(Vec::new());
        }

        let pool_size = self.config.candidate_pool;
        let skip_first_stage = state.active_docs <= pool_size || k >= pool_size;

        // Stage 1: candidate selection on average embeddings.
        let candidates: Vec<usize> = if skip_first_stage {
            state
                .docs
                .iter()
                .enumerate()
                .filter(|(_, d)| !d.deleted)
                .map(|(i, _)| i)
                .collect()
        } else {
            let avg_query = compute_avg(query_tokens, num_query, dim);
            let mut heap: BinaryHeap<HeapItem> = BinaryHeap::with_capacity(pool_size);
            for (i, doc) in state.docs.iter().enumerate() {
                let Some(avg_doc) = doc.avg_embedding.as_deref() else {
                    continue;
                };
                let s = simd::dot_product(&avg_query, avg_doc);
                if heap.len() < pool_size {
                    heap.push(Reverse((OrderedFloat(s), i)));
                } else if s > heap.peek().unwrap().0 .0 .0 {
                    heap.pop();
                    heap.push(Reverse((OrderedFloat(s), i)));
                }
            }
            heap.into_iter().map(|Reverse((_, i))| i).collect()
        };

        // Stage 2: full MaxSim on the candidates.
        let effective_k = k.min(candidates.len());
        let mut heap: BinaryHeap<HeapItem> = BinaryHeap::with_capacity(effective_k);
        for &di in &candidates {
            let doc = &state.docs[di];
            let doc_tokens = &state.token_pool[doc.token_offset * dim..];
            let score = maxsim(query_tokens, num_query, doc_tokens, doc.num_tokens, dim);
            if heap.len() < effective_k {
                heap.push(Reverse((OrderedFloat(score), di)));
            } else if score > heap.peek().unwrap().0 .0 .0 {
                heap.pop();
                heap.push(Reverse((OrderedFloat(score), di)));
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse((score, doc_index))| SearchHit {
                doc_index,
                score: score.0,
            })
            .collect())
    }

    /// Number of live documents.
    pub fn count(&self) -> usize {
        self.state.read().active_docs
    }

    pub fn stats(&self) -> LateInteractionStats {
        let state = self.state.read();
        let dim = self.config.token_dimension;
        let mut memory_bytes = state.pool_capacity * dim * 4
            + state.docs.capacity() * std::mem::size_of::<DocMeta>();
        for doc in &state.docs {
            if doc.avg_embedding.is_some() {
                memory_bytes += dim * 4;
            }
        }
        LateInteractionStats {
            documents: state.active_docs,
            tokens: state.active_tokens,
            memory_bytes,
        }
    }

    /// Persist the live documents. Deleted documents are compacted out,
    /// so a reload renumbers the survivors densely.
    pub fn save<W: Write>(&self, mut w: W) -> Result<()> {
        let state = self.state.read();
        let dim = self.config.token_dimension;

        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(self.config.token_dimension as u64).to_le_bytes())?;
        w.write_all(&(self.config.max_doc_tokens as u64).to_le_bytes())?;
        w.write_all(&(self.config.max_query_tokens as u64).to_le_bytes())?;
        w.write_all(&(self.config.candidate_pool as u64).to_le_bytes())?;
        w.write_all(&(state.active_docs as u32).to_le_bytes())?;

        for doc in state.docs.iter().filter(|d| !d.deleted) {
            w.write_all(&(doc.num_tokens as u32).to_le_bytes())?;
            let tokens =
                &state.token_pool[doc.token_offset * dim..(doc.token_offset + doc.num_tokens) * dim];
            for &x in tokens {
                w.write_all(&x.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn load<R: Read>(mut r: R) -> Result<Self> {
        let mut magic = [0u8; 7];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::Corrupt("bad late-interaction magic".into()));
        }
        let version = read_u32(&mut r)?;
        if version != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported late-interaction version {version}"
            )));
        }

        let config = LateInteractionConfig {
            token_dimension: read_u64(&mut r)? as usize,
            max_doc_tokens: read_u64(&mut r)? as usize,
            max_query_tokens: read_u64(&mut r)? as usize,
            candidate_pool: read_u64(&mut r)? as usize,
        };
        let doc_count = read_u32(&mut r)?;

        let index = Self::new(config)
            .map_err(|_| Error::Corrupt("invalid late-interaction header".into()))?;
        let dim = index.config.token_dimension;

        let mut buf = [0u8; 4];
        for _ in 0..doc_count {
            let num_tokens = read_u32(&mut r)? as usize;
            let mut tokens = vec![0.0f32; num_tokens * dim];
            for x in &mut tokens {
                r.read_exact(&mut buf)
                    .map_err(|_| Error::Corrupt("truncated token data".into()))?;
                *x = f32::from_le_bytes(buf);
            }
            index
                .add_doc(&tokens)
                .map_err(|_| Error::Corrupt("invalid document record".into()))?;
        }
        Ok(index)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.save(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(BufReader::new(File::open(path)?))
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(dim: usize) -> LateInteractionConfig {
        LateInteractionConfig {
            token_dimension: dim,
            max_doc_tokens: 16,
            max_query_tokens: 8,
            candidate_pool: 100,
        }
    }

    /// One token per axis position.
    fn axis_token(dim: usize, axis: usize, value: f32) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = value;
        v
    }

    #[test]
    fn two_stage_search_prefers_the_aligned_document() {
        let index = LateInteractionIndex::new(small_config(128)).unwrap();

        let mut d0 = axis_token(128, 0, 1.0);
        d0.extend(axis_token(128, 1, 1.0));
        let mut d1 = axis_token(128, 2, 1.0);
        d1.extend(axis_token(128, 3, 1.0));
        index.add_doc(&d0).unwrap();
        index.add_doc(&d1).unwrap();

        let mut query = axis_token(128, 0, 0.9);
        query[1] = 0.1;
        let mut q1 = axis_token(128, 1, 0.9);
        q1[0] = 0.1;
        query.extend(q1);

        let hits = index.search(&query, 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_index, 0);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn stage_one_narrows_candidates_without_losing_the_winner() {
        let config = LateInteractionConfig {
            token_dimension: 4,
            max_doc_tokens: 4,
            max_query_tokens: 4,
            candidate_pool: 3,
        };
        let index = LateInteractionIndex::new(config).unwrap();

        // Ten near-orthogonal docs plus one strongly aligned with the query.
        for i in 0..10 {
            let v = axis_token(4, i % 4, 0.1 + i as f32 * 0.01);
            index.add_doc(&v).unwrap();
        }
        let winner = index.add_doc(&[5.0, 5.0, 0.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_index, winner);
    }

    #[test]
    fn deleted_documents_never_surface() {
        let index = LateInteractionIndex::new(small_config(4)).unwrap();
        let d0 = index.add_doc(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let d1 = index.add_doc(&[0.0, 1.0, 0.0, 0.0]).unwrap();

        index.delete(d0).unwrap();
        assert_eq!(index.count(), 1);

        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_index, d1);

        // Double delete fails; the index keeps the original numbering.
        assert!(index.delete(d0).is_err());
        assert!(index.delete(99).is_err());
    }

    #[test]
    fn doc_and_query_token_limits_are_enforced() {
        let index = LateInteractionIndex::new(small_config(2)).unwrap();

        let too_long = vec![0.5f32; 2 * 17];
        assert!(index.add_doc(&too_long).is_err());
        assert!(index.add_doc(&[]).is_err());

        index.add_doc(&[1.0, 0.0]).unwrap();
        let long_query = vec![0.5f32; 2 * 9];
        assert!(index.search(&long_query, 1).is_err());
    }

    #[test]
    fn empty_index_returns_no_hits() {
        let index = LateInteractionIndex::new(small_config(2)).unwrap();
        assert!(index.search(&[1.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn save_load_compacts_deleted_documents() {
        let index = LateInteractionIndex::new(small_config(2)).unwrap();
        index.add_doc(&[1.0, 0.0]).unwrap();
        let middle = index.add_doc(&[0.0, 1.0]).unwrap();
        index.add_doc(&[2.0, 2.0]).unwrap();
        index.delete(middle).unwrap();

        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();

        let loaded = LateInteractionIndex::load(buf.as_slice()).unwrap();
        assert_eq!(loaded.count(), 2);

        // Survivors are renumbered densely in original order.
        let hits = loaded.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].doc_index, 1); // [2,2] scores highest on this query
        assert_eq!(hits[1].doc_index, 0);
    }

    #[test]
    fn load_rejects_corrupt_input() {
        let index = LateInteractionIndex::new(small_config(2)).unwrap();
        index.add_doc(&[1.0, 0.0]).unwrap();

        let mut buf = Vec::new();
        index.save(&mut buf).unwrap();

        let mut bad = buf.clone();
        bad[0] = b'X';
        assert!(LateInteractionIndex::load(bad.as_slice()).is_err());
        assert!(LateInteractionIndex::load(&buf[..buf.len() - 2]).is_err());
    }

    #[test]
    fn stats_track_live_documents_and_tokens() {
        let index = LateInteractionIndex::new(small_config(2)).unwrap();
        index.add_doc(&[1.0, 0.0, 0.0, 1.0]).unwrap();
        let d1 = index.add_doc(&[0.5, 0.5]).unwrap();

        let stats = index.stats();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.tokens, 3);
        assert!(stats.memory_bytes > 0);

        index.delete(d1).unwrap();
        let stats = index.stats();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.tokens, 2);
    }
}
