//! # StrataVec Core
//!
//! Core library for the StrataVec vector search engine.
//!
//! This crate provides the in-memory subsystems:
//!
//! - [`MvccManager`] - Multi-version concurrency control over vector versions
//! - [`QueryCache`] - TTL + mutation-aware query result cache
//! - [`PqCodebook`] - Product quantization codebook with ADC distances
//! - [`LateInteractionIndex`] - Two-stage MaxSim search over token embeddings
//! - [`MuveraEncoder`] - Fixed-size encoding of multi-vector embeddings
//! - [`DedupIndex`] - LSH near-duplicate detection
//! - [`TieredManager`] - Three-tier tenant classification
//! - [`AliasRegistry`] - Collection aliases with atomic swap
//! - [`ConsistencyManager`] - Per-query consistency levels
//!
//! ## Example
//!
//! ```rust
//! use stratavec_core::MvccManager;
//!
//! let mvcc = MvccManager::new(3).unwrap();
//!
//! // Writer commits two vectors.
//! let mut txn = mvcc.begin();
//! txn.add_vector(&[1.0, 0.0, 0.0]).unwrap();
//! txn.add_vector(&[0.0, 1.0, 0.0]).unwrap();
//! txn.commit().unwrap();
//!
//! // A later reader sees both.
//! let reader = mvcc.begin();
//! assert_eq!(reader.count(), 2);
//! ```

pub mod alias;
pub mod cache;
pub mod codebook;
pub mod consistency;
pub mod dedup;
pub mod error;
pub mod late_interaction;
pub mod muvera;
pub mod mvcc;
pub mod tenant;
pub mod vector;

/// Deterministic PRNGs shared by the randomized subsystems
///
/// Seeded generators (xorshift, xoshiro256**) so that codebook training,
/// LSH hyperplanes, and MUVERA projections are bit-reproducible.
pub mod rng;

/// SIMD-optimized vector operations
///
/// Provides hardware-accelerated distance calculations:
/// - AVX2/FMA on x86_64
/// - SSE on x86
/// - NEON on ARM64/Apple Silicon
pub mod simd;

pub use alias::{AliasInfo, AliasRegistry};
pub use cache::{CacheConfig, CacheStats, CachedResult, EvictionPolicy, QueryCache};
pub use codebook::PqCodebook;
pub use consistency::{ConsistencyConfig, ConsistencyLevel, ConsistencyManager};
pub use dedup::{DedupConfig, DedupIndex, DuplicatePair, InsertOutcome};
pub use error::{Error, Result};
pub use late_interaction::{
    LateInteractionConfig, LateInteractionIndex, LateInteractionStats, SearchHit,
};
pub use muvera::{MuveraConfig, MuveraEncoder};
pub use mvcc::{MvccManager, Transaction, TxnStatus};
pub use tenant::{TenantConfig, TenantInfo, TenantTier, TierThresholds, TieredManager};
pub use vector::{DistanceType, Vector};
