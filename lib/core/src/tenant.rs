//! Tiered multitenancy manager.
//!
//! Classifies tenants across shared, dedicated, and premium tiers and moves
//! them between tiers based on usage thresholds. Tenants live in a chained
//! hash table keyed by tenant id; each entry carries usage counters and a
//! sliding-window QPS tracker.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const TENANT_ID_MAX_LEN: usize = 128;
const HASH_BUCKETS: usize = 1024;

/// One slot per second of the sliding QPS window.
const QPS_SLOTS: usize = 60;

/// Days of inactivity required before auto-demotion applies.
const DEMOTE_SECONDS: u64 = 7 * 86_400;
/// Usage must drop below this fraction of the lower tier's thresholds.
const DEMOTE_RATIO: f64 = 0.5;

/// Resource isolation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TenantTier {
    Shared = 0,
    Dedicated = 1,
    Premium = 2,
}

/// Usage thresholds that trigger tier transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierThresholds {
    pub shared_max_vectors: u64,
    pub dedicated_max_vectors: u64,
    pub shared_max_memory_bytes: u64,
    pub dedicated_max_memory_bytes: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            shared_max_vectors: 10_000,
            dedicated_max_vectors: 1_000_000,
            shared_max_memory_bytes: 64 * 1024 * 1024,
            dedicated_max_memory_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub thresholds: TierThresholds,
    pub auto_promote: bool,
    pub auto_demote: bool,
    pub max_shared_tenants: usize,
    pub max_total_tenants: usize,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            thresholds: TierThresholds::default(),
            auto_promote: true,
            auto_demote: false,
            max_shared_tenants: 1000,
            max_total_tenants: 10_000,
        }
    }
}

/// Point-in-time view of a tenant's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantInfo {
    pub tenant_id: String,
    pub tier: TenantTier,
    pub vector_count: u64,
    pub memory_bytes: u64,
    pub created_at: u64,
    pub last_active: u64,
    pub qps_avg: f64,
}

/// Per-second query counts over the last `QPS_SLOTS` seconds.
#[derive(Debug, Clone)]
struct QpsWindow {
    counts: [u32; QPS_SLOTS],
    base_time: u64,
    total: u64,
}

impl QpsWindow {
    fn new() -> Self {
        Self { counts: [0; QPS_SLOTS], base_time: 0, total: 0 }
    }

    /// Advance the window to `now`, clearing slots that fell out of it.
    fn advance(&mut self, now: u64) {
        if self.base_time == 0 {
            self.base_time = now;
            return;
        }
        let elapsed = now.saturating_sub(self.base_time);
        if elapsed == 0 {
            return;
        }
        if elapsed >= QPS_SLOTS as u64 {
            self.counts = [0; QPS_SLOTS];
            self.total = 0;
            self.base_time = now;
            return;
        }
        for i in 0..elapsed {
            let slot = ((self.base_time + i) % QPS_SLOTS as u64) as usize;
            self.total -= u64::from(self.counts[slot]);
            self.counts[slot] = 0;
        }
        self.base_time = now;
    }

    fn record(&mut self, now: u64) {
        self.advance(now);
        let slot = (now % QPS_SLOTS as u64) as usize;
        self.counts[slot] += 1;
        self.total += 1;
    }

    fn average(&mut self, now: u64) -> f64 {
        self.advance(now);
        self.total as f64 / QPS_SLOTS as f64
    }
}

#[derive(Debug)]
struct TenantEntry {
    id: String,
    tier: TenantTier,
    vector_count: u64,
    memory_bytes: u64,
    created_at: u64,
    last_active: u64,
    qps: QpsWindow,
}

struct TenantTable {
    buckets: Vec<Vec<TenantEntry>>,
    count: usize,
}

impl TenantTable {
    fn find(&self, tenant_id: &str) -> Option<&TenantEntry> {
        self.buckets[bucket_of(tenant_id)]
            .iter()
            .find(|e| e.id == tenant_id)
    }

    fn find_mut(&mut self, tenant_id: &str) -> Option<&mut TenantEntry> {
        self.buckets[bucket_of(tenant_id)]
            .iter_mut()
            .find(|e| e.id == tenant_id)
    }

    fn shared_count(&self) -> usize {
        self.buckets
            .iter()
            .flatten()
            .filter(|e| e.tier == TenantTier::Shared)
            .count()
    }
}

/// djb2 hash of the tenant id, reduced to the bucket range.
fn bucket_of(tenant_id: &str) -> usize {
    let mut h: u64 = 5381;
    for &b in tenant_id.as_bytes() {
        h = h.wrapping_mul(33).wrapping_add(u64::from(b));
    }
    (h % HASH_BUCKETS as u64) as usize
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Tiered tenant manager.
///
/// Thread-safe: lookups take a read lock, mutations a write lock.
pub struct TieredManager {
    config: TenantConfig,
    table: RwLock<TenantTable>,
}

impl TieredManager {
    pub fn new(config: TenantConfig) -> Self {
        Self {
            config,
            table: RwLock::new(TenantTable {
                buckets: (0..HASH_BUCKETS).map(|_| Vec::new()).collect(),
                count: 0,
            }),
        }
    }

    pub fn config(&self) -> &TenantConfig {
        &self.config
    }

    /// Register a new tenant at `initial_tier`.
    ///
    /// Fails when the total tenant cap is reached, when the shared tier is
    /// full (for shared admissions), or when the id already exists.
    pub fn add_tenant(&self, tenant_id: &str, initial_tier: TenantTier) -> Result<()> {
        self.add_tenant_at(tenant_id, initial_tier, now_seconds())
    }

    fn add_tenant_at(&self, tenant_id: &str, initial_tier: TenantTier, now: u64) -> Result<()> {
        if tenant_id.is_empty() || tenant_id.len() >= TENANT_ID_MAX_LEN {
            return Err(Error::InvalidArgument(format!(
                "tenant id must be 1..{} bytes",
                TENANT_ID_MAX_LEN
            )));
        }

        let mut table = self.table.write();

        if table.count >= self.config.max_total_tenants {
            return Err(Error::CapacityExhausted(format!(
                "tenant limit reached ({})",
                self.config.max_total_tenants
            )));
        }
        if initial_tier == TenantTier::Shared
            && table.shared_count() >= self.config.max_shared_tenants
        {
            return Err(Error::CapacityExhausted(format!(
                "shared tier full ({})",
                self.config.max_shared_tenants
            )));
        }
        if table.find(tenant_id).is_some() {
            return Err(Error::TenantExists(tenant_id.to_string()));
        }

        let bucket = bucket_of(tenant_id);
        table.buckets[bucket].push(TenantEntry {
            id: tenant_id.to_string(),
            tier: initial_tier,
            vector_count: 0,
            memory_bytes: 0,
            created_at: now,
            last_active: now,
            qps: QpsWindow::new(),
        });
        table.count += 1;
        Ok(())
    }

    pub fn remove_tenant(&self, tenant_id: &str) -> Result<()> {
        let mut table = self.table.write();
        let bucket = bucket_of(tenant_id);
        let chain = &mut table.buckets[bucket];
        match chain.iter().position(|e| e.id == tenant_id) {
            Some(pos) => {
                chain.remove(pos);
                table.count -= 1;
                Ok(())
            }
            None => Err(Error::TenantNotFound(tenant_id.to_string())),
        }
    }

    /// Manually move a tenant to `new_tier`.
    pub fn promote(&self, tenant_id: &str, new_tier: TenantTier) -> Result<()> {
        let mut table = self.table.write();
        let entry = table
            .find_mut(tenant_id)
            .ok_or_else(|| Error::TenantNotFound(tenant_id.to_string()))?;
        let old = entry.tier;
        entry.tier = new_tier;
        entry.last_active = now_seconds();
        tracing::debug!(tenant = %tenant_id, ?old, new = ?new_tier, "tenant tier changed");
        Ok(())
    }

    pub fn get_info(&self, tenant_id: &str) -> Result<TenantInfo> {
        self.get_info_at(tenant_id, now_seconds())
    }

    fn get_info_at(&self, tenant_id: &str, now: u64) -> Result<TenantInfo> {
        let mut table = self.table.write();
        let entry = table
            .find_mut(tenant_id)
            .ok_or_else(|| Error::TenantNotFound(tenant_id.to_string()))?;
        Ok(TenantInfo {
            tenant_id: entry.id.clone(),
            tier: entry.tier,
            vector_count: entry.vector_count,
            memory_bytes: entry.memory_bytes,
            created_at: entry.created_at,
            last_active: entry.last_active,
            qps_avg: entry.qps.average(now),
        })
    }

    /// Record one query against a tenant, adding `vectors_delta` vectors and
    /// `memory_delta` bytes to its usage counters.
    pub fn record_usage(&self, tenant_id: &str, vectors_delta: u64, memory_delta: u64) -> Result<()> {
        self.record_usage_at(tenant_id, vectors_delta, memory_delta, now_seconds())
    }

    fn record_usage_at(
        &self,
        tenant_id: &str,
        vectors_delta: u64,
        memory_delta: u64,
        now: u64,
    ) -> Result<()> {
        let mut table = self.table.write();
        let entry = table
            .find_mut(tenant_id)
            .ok_or_else(|| Error::TenantNotFound(tenant_id.to_string()))?;
        entry.vector_count += vectors_delta;
        entry.memory_bytes += memory_delta;
        entry.last_active = now;
        entry.qps.record(now);
        Ok(())
    }

    /// Sweep all tenants, applying auto-promotion and auto-demotion rules.
    ///
    /// Returns the number of tier transitions performed. Promotion triggers
    /// when usage exceeds the current tier's thresholds; demotion requires
    /// usage below half the lower tier's thresholds plus seven days of
    /// inactivity.
    pub fn check_tiers(&self) -> usize {
        self.check_tiers_at(now_seconds())
    }

    fn check_tiers_at(&self, now: u64) -> usize {
        let th = &self.config.thresholds;
        let mut moved = 0usize;

        let mut table = self.table.write();
        for chain in &mut table.buckets {
            for e in chain.iter_mut() {
                if self.config.auto_promote {
                    if e.tier == TenantTier::Shared
                        && (e.vector_count > th.shared_max_vectors
                            || e.memory_bytes > th.shared_max_memory_bytes)
                    {
                        e.tier = TenantTier::Dedicated;
                        e.last_active = now;
                        moved += 1;
                        tracing::debug!(tenant = %e.id, "promoted shared -> dedicated");
                        continue;
                    }
                    if e.tier == TenantTier::Dedicated
                        && (e.vector_count > th.dedicated_max_vectors
                            || e.memory_bytes > th.dedicated_max_memory_bytes)
                    {
                        e.tier = TenantTier::Premium;
                        e.last_active = now;
                        moved += 1;
                        tracing::debug!(tenant = %e.id, "promoted dedicated -> premium");
                        continue;
                    }
                }

                if self.config.auto_demote {
                    let inactive = now.saturating_sub(e.last_active);
                    match e.tier {
                        TenantTier::Dedicated => {
                            let vec_thresh = (th.shared_max_vectors as f64 * DEMOTE_RATIO) as u64;
                            let mem_thresh =
                                (th.shared_max_memory_bytes as f64 * DEMOTE_RATIO) as u64;
                            if e.vector_count < vec_thresh
                                && e.memory_bytes < mem_thresh
                                && inactive >= DEMOTE_SECONDS
                            {
                                e.tier = TenantTier::Shared;
                                e.last_active = now;
                                moved += 1;
                                tracing::debug!(tenant = %e.id, "demoted dedicated -> shared");
                            }
                        }
                        TenantTier::Premium => {
                            let vec_thresh =
                                (th.dedicated_max_vectors as f64 * DEMOTE_RATIO) as u64;
                            let mem_thresh =
                                (th.dedicated_max_memory_bytes as f64 * DEMOTE_RATIO) as u64;
                            if e.vector_count < vec_thresh
                                && e.memory_bytes < mem_thresh
                                && inactive >= DEMOTE_SECONDS
                            {
                                e.tier = TenantTier::Dedicated;
                                e.last_active = now;
                                moved += 1;
                                tracing::debug!(tenant = %e.id, "demoted premium -> dedicated");
                            }
                        }
                        TenantTier::Shared => {}
                    }
                }
            }
        }
        moved
    }

    /// Snapshot all tenants currently in `tier`.
    pub fn list_tenants(&self, tier: TenantTier) -> Vec<TenantInfo> {
        let now = now_seconds();
        let mut table = self.table.write();
        let mut out = Vec::new();
        for chain in &mut table.buckets {
            for e in chain.iter_mut() {
                if e.tier != tier {
                    continue;
                }
                out.push(TenantInfo {
                    tenant_id: e.id.clone(),
                    tier: e.tier,
                    vector_count: e.vector_count,
                    memory_bytes: e.memory_bytes,
                    created_at: e.created_at,
                    last_active: e.last_active,
                    qps_avg: e.qps.average(now),
                });
            }
        }
        out
    }

    pub fn tenant_count(&self) -> usize {
        self.table.read().count
    }
}
