//! # StrataVec
//!
//! Core subsystems of a multi-tenant vector search engine.
//!
//! StrataVec is not a thin wrapper over a nearest-neighbour library; it is a
//! collection of cooperating subsystems for indexing, quantizing,
//! replicating, and serving high-dimensional vectors:
//!
//! - **MVCC** snapshot-isolated vector versions with vacuum
//! - **CDC** ring-buffered change stream with subscribers, cursors, and an
//!   optional durable append log
//! - **Query cache** with TTL, LRU/LFU eviction, and mutation invalidation
//! - **Product quantization** codebooks with asymmetric (ADC) distances
//! - **Late interaction** two-stage MaxSim search over token embeddings
//! - **MUVERA** fixed-size multi-vector encodings
//! - **LSH dedup** near-duplicate detection
//! - **Tiered tenants**, **alias registry**, and **consistency levels**
//!
//! ## Quick Start
//!
//! ```rust
//! use stratavec::prelude::*;
//!
//! // Versioned writes with snapshot isolation.
//! let mvcc = MvccManager::new(4).unwrap();
//! let mut txn = mvcc.begin();
//! txn.add_vector(&[0.1, 0.2, 0.3, 0.4]).unwrap();
//! txn.commit().unwrap();
//!
//! // Aliases resolve to collections and swap atomically.
//! let aliases = AliasRegistry::new();
//! aliases.create("prod", "vectors_v1").unwrap();
//! aliases.create("staging", "vectors_v2").unwrap();
//! aliases.swap("prod", "staging").unwrap();
//! assert_eq!(aliases.resolve("prod").unwrap(), "vectors_v2");
//! ```
//!
//! ## Crate Structure
//!
//! StrataVec is composed of two member crates:
//!
//! - `stratavec-core` - In-memory subsystems (MVCC, cache, codebook, late
//!   interaction, MUVERA, dedup, tenants, aliases, consistency, SIMD)
//! - `stratavec-storage` - Durable-state subsystems (CDC stream, snapshots)

// Re-export core types
pub use stratavec_core::{
    AliasInfo, AliasRegistry, CacheConfig, CacheStats, CachedResult, ConsistencyConfig,
    ConsistencyLevel, ConsistencyManager, DedupConfig, DedupIndex, DistanceType, DuplicatePair,
    Error, EvictionPolicy, InsertOutcome, LateInteractionConfig, LateInteractionIndex,
    LateInteractionStats, MuveraConfig, MuveraEncoder, MvccManager, PqCodebook, QueryCache,
    Result, SearchHit, TenantConfig, TenantInfo, TenantTier, TierThresholds, TieredManager,
    Transaction, TxnStatus, Vector,
};

// Re-export storage
pub use stratavec_storage::{
    CdcChange, CdcConfig, CdcCursor, CdcEvent, CdcEventKind, CdcStream, Snapshot, SnapshotInfo,
    SnapshotStore, ALL_EVENTS,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        AliasRegistry, CacheConfig, CdcChange, CdcConfig, CdcCursor, CdcEventKind, CdcStream,
        ConsistencyConfig, ConsistencyLevel, ConsistencyManager, DedupConfig, DedupIndex,
        DistanceType, Error, LateInteractionConfig, LateInteractionIndex, MuveraConfig,
        MuveraEncoder, MvccManager, PqCodebook, QueryCache, Result, SnapshotStore, TenantConfig,
        TenantTier, TieredManager, Vector,
    };
}

/// SIMD-optimized vector operations
pub mod simd {
    pub use stratavec_core::simd::{dot_product, l2_distance, l2_squared, norm};
}
