//! Multi-version concurrency control over a versioned vector collection.
//!
//! Transactions get snapshot isolation: a reader sees exactly the versions
//! committed before it began, plus its own uncommitted writes. Versions are
//! append-only; deletes stamp a `delete_txn` rather than removing data, and
//! [`MvccManager::gc`] reclaims versions no active transaction can see.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// One physical version of a vector.
#[derive(Debug, Clone)]
pub struct Version {
    /// Logical vector index; stable across garbage collection.
    pub vector_index: u64,
    pub create_txn: u64,
    /// 0 means "never deleted".
    pub delete_txn: u64,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

struct MvccState {
    versions: Vec<Version>,
    next_txn_id: u64,
    /// Active txns, each mapped to the set of txn ids that were active
    /// when it began. `gc` needs the begin-time sets too: a delete that
    /// was pending when a live reader began is still visible to it.
    active: HashMap<u64, HashSet<u64>>,
}

impl MvccState {
    fn min_active_txn(&self) -> u64 {
        self.active.keys().copied().min().unwrap_or(u64::MAX)
    }
}

/// Transaction manager. One mutex serializes all reads and writes; the
/// visibility predicate is what provides isolation, not lock granularity.
pub struct MvccManager {
    dimension: usize,
    state: Mutex<MvccState>,
}

impl MvccManager {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidArgument("dimension must be nonzero".into()));
        }
        Ok(Self {
            dimension,
            state: Mutex::new(MvccState {
                versions: Vec::new(),
                next_txn_id: 1,
                active: HashMap::new(),
            }),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Start a transaction. Its snapshot covers everything committed
    /// before this call.
    pub fn begin(&self) -> Transaction<'_> {
        let mut state = self.state.lock();
        let txn_id = state.next_txn_id;
        state.next_txn_id += 1;
        // Writers uncommitted at this instant stay invisible to this
        // transaction forever, even after they commit.
        let begin_active: HashSet<u64> = state.active.keys().copied().collect();
        state.active.insert(txn_id, begin_active.clone());
        Transaction {
            mgr: self,
            txn_id,
            snapshot: txn_id - 1,
            begin_active,
            status: TxnStatus::Active,
            added: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Reclaim versions deleted by committed transactions that no active
    /// transaction can still see. Survivors keep their relative order and
    /// their `vector_index`. Returns the number of versions reclaimed.
    pub fn gc(&self) -> usize {
        let mut state = self.state.lock();
        let min_active = state.min_active_txn();

        let before = state.versions.len();
        let active = std::mem::take(&mut state.active);
        state.versions.retain(|ver| {
            !(ver.delete_txn != 0
                && !active.contains_key(&ver.delete_txn)
                && ver.delete_txn < min_active
                && !active.values().any(|began| began.contains(&ver.delete_txn)))
        });
        state.active = active;

        let removed = before - state.versions.len();
        if removed > 0 {
            debug!(removed, remaining = state.versions.len(), "mvcc gc reclaimed versions");
        }
        removed
    }

    /// Total physical versions, live and dead.
    pub fn version_count(&self) -> usize {
        self.state.lock().versions.len()
    }

    pub fn active_txn_count(&self) -> usize {
        self.state.lock().active.len()
    }
}

/// A transaction borrowed from its manager.
///
/// `commit` and `rollback` consume the transaction; dropping one that is
/// still active rolls it back.
pub struct Transaction<'a> {
    mgr: &'a MvccManager,
    txn_id: u64,
    snapshot: u64,
    /// Txn ids that were active when this transaction began.
    begin_active: HashSet<u64>,
    status: TxnStatus,
    /// Physical indices into the version store created by this txn.
    added: Vec<usize>,
    /// Physical indices whose delete stamp this txn owns.
    deleted: Vec<usize>,
}

impl<'a> Transaction<'a> {
    pub fn id(&self) -> u64 {
        self.txn_id
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    fn check_active(&self) -> Result<()> {
        if self.status != TxnStatus::Active {
            return Err(Error::TransactionNotActive(self.txn_id));
        }
        Ok(())
    }

    /// The single authoritative visibility rule. Every read goes through
    /// this; there is no second path that could drift.
    ///
    /// Visibility is frozen at `begin`: the predicate tests membership in
    /// the captured `begin_active` set, never the live one, so commits
    /// that land after this transaction began cannot leak into it.
    fn visible(&self, ver: &Version) -> bool {
        // Own insert is visible unless we also deleted it.
        if ver.create_txn == self.txn_id {
            return ver.delete_txn != self.txn_id;
        }
        if ver.create_txn > self.snapshot {
            return false;
        }
        if self.begin_active.contains(&ver.create_txn) {
            return false;
        }

        if ver.delete_txn == 0 {
            return true;
        }
        if ver.delete_txn == self.txn_id {
            return false;
        }
        if ver.delete_txn > self.snapshot {
            return true;
        }
        // Delete that was still pending when we began: row stays alive
        // for us whether or not the deleter has committed since.
        self.begin_active.contains(&ver.delete_txn)
    }

    /// Append a new vector version. Returns the logical vector index.
    pub fn add_vector(&mut self, data: &[f32]) -> Result<u64> {
        self.check_active()?;
        if data.len() != self.mgr.dimension {
            return Err(Error::InvalidDimension {
                expected: self.mgr.dimension,
                actual: data.len(),
            });
        }

        let mut state = self.mgr.state.lock();
        let ver_idx = state.versions.len();
        let vector_index = ver_idx as u64;
        state.versions.push(Version {
            vector_index,
            create_txn: self.txn_id,
            delete_txn: 0,
            data: data.to_vec(),
        });
        drop(state);

        self.added.push(ver_idx);
        Ok(vector_index)
    }

    /// Stamp a pending delete on the visible version at `vector_index`.
    ///
    /// If another transaction already holds a delete stamp on it, this is
    /// a write-write conflict; the transaction stays active and may retry.
    pub fn delete_vector(&mut self, vector_index: u64) -> Result<()> {
        self.check_active()?;

        let mut state = self.mgr.state.lock();
        let mut target = None;
        for (i, ver) in state.versions.iter().enumerate() {
            if ver.vector_index != vector_index {
                continue;
            }
            if !self.visible(ver) {
                continue;
            }
            if ver.delete_txn != 0 && ver.delete_txn != self.txn_id {
                return Err(Error::WriteConflict(vector_index));
            }
            target = Some(i);
            break;
        }

        match target {
            Some(i) => {
                state.versions[i].delete_txn = self.txn_id;
                drop(state);
                self.deleted.push(i);
                Ok(())
            }
            None => Err(Error::VectorNotFound(vector_index)),
        }
    }

    /// Deep-copy the data of the visible version at `vector_index`.
    pub fn get_vector(&self, vector_index: u64) -> Result<Vec<f32>> {
        let state = self.mgr.state.lock();
        for ver in &state.versions {
            if ver.vector_index == vector_index && self.visible(ver) {
                return Ok(ver.data.clone());
            }
        }
        Err(Error::VectorNotFound(vector_index))
    }

    /// Number of versions visible under this transaction's snapshot.
    pub fn count(&self) -> usize {
        let state = self.mgr.state.lock();
        state
            .versions
            .iter()
            .filter(|ver| self.visible(ver))
            .count()
    }

    /// Make this transaction's writes durable to future snapshots.
    pub fn commit(mut self) -> Result<()> {
        self.check_active()?;
        let mut state = self.mgr.state.lock();
        // Delete stamps are already in the store; removing ourselves from
        // the active set is what publishes them.
        state.active.remove(&self.txn_id);
        drop(state);
        self.status = TxnStatus::Committed;
        Ok(())
    }

    /// Undo all of this transaction's writes.
    pub fn rollback(mut self) -> Result<()> {
        self.check_active()?;
        self.rollback_inner();
        Ok(())
    }

    fn rollback_inner(&mut self) {
        let mut state = self.mgr.state.lock();

        // Inserts become tombstones no future reader can see.
        for &idx in &self.added {
            if let Some(ver) = state.versions.get_mut(idx) {
                ver.delete_txn = self.txn_id;
            }
        }

        // Delete stamps are cleared only if still ours.
        for &idx in &self.deleted {
            if let Some(ver) = state.versions.get_mut(idx) {
                if ver.delete_txn == self.txn_id {
                    ver.delete_txn = 0;
                }
            }
        }

        state.active.remove(&self.txn_id);
        drop(state);
        self.status = TxnStatus::Aborted;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.status == TxnStatus::Active {
            self.rollback_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_isolation_across_concurrent_txns() {
        let mgr = MvccManager::new(4).unwrap();

        let mut t1 = mgr.begin();
        let t2 = mgr.begin();

        t1.add_vector(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(t2.count(), 0);

        t1.commit().unwrap();

        // T2's snapshot predates T1's commit.
        assert_eq!(t2.count(), 0);

        let t3 = mgr.begin();
        assert_eq!(t3.count(), 1);
    }

    #[test]
    fn commit_does_not_publish_to_snapshots_begun_earlier() {
        let mgr = MvccManager::new(2).unwrap();

        let mut before = mgr.begin();
        before.add_vector(&[1.0, 2.0]).unwrap();
        before.commit().unwrap();

        let mut writer = mgr.begin();
        let reader = mgr.begin();
        let idx = writer.add_vector(&[3.0, 4.0]).unwrap();
        writer.commit().unwrap();

        // The writer was active when the reader began, so its commit must
        // stay invisible for the reader's whole lifetime.
        assert_eq!(reader.count(), 1);
        assert!(matches!(
            reader.get_vector(idx),
            Err(Error::VectorNotFound(_))
        ));

        let late = mgr.begin();
        assert_eq!(late.count(), 2);
    }

    #[test]
    fn reader_keeps_rows_whose_delete_was_pending_at_begin() {
        let mgr = MvccManager::new(2).unwrap();
        let mut setup = mgr.begin();
        let idx = setup.add_vector(&[1.0, 2.0]).unwrap();
        setup.commit().unwrap();

        let mut deleter = mgr.begin();
        deleter.delete_vector(idx).unwrap();

        // The delete is uncommitted when the reader begins; committing it
        // afterwards must not retract the row from the reader.
        let reader = mgr.begin();
        deleter.commit().unwrap();

        assert_eq!(reader.count(), 1);
        assert!(reader.get_vector(idx).is_ok());

        // And gc must not reclaim the row out from under the reader.
        assert_eq!(mgr.gc(), 0);
        assert_eq!(reader.count(), 1);
        drop(reader);
        assert_eq!(mgr.gc(), 1);
    }

    #[test]
    fn own_writes_are_visible_before_commit() {
        let mgr = MvccManager::new(2).unwrap();
        let mut txn = mgr.begin();
        let idx = txn.add_vector(&[1.0, 2.0]).unwrap();
        assert_eq!(txn.get_vector(idx).unwrap(), vec![1.0, 2.0]);
        assert_eq!(txn.count(), 1);
    }

    #[test]
    fn get_after_own_delete_is_not_found() {
        let mgr = MvccManager::new(2).unwrap();
        let mut setup = mgr.begin();
        let idx = setup.add_vector(&[1.0, 2.0]).unwrap();
        setup.commit().unwrap();

        let mut txn = mgr.begin();
        txn.delete_vector(idx).unwrap();
        assert!(matches!(
            txn.get_vector(idx),
            Err(Error::VectorNotFound(_))
        ));
        assert_eq!(txn.count(), 0);
    }

    #[test]
    fn write_write_conflict_on_concurrent_delete() {
        let mgr = MvccManager::new(2).unwrap();
        let mut setup = mgr.begin();
        let idx = setup.add_vector(&[1.0, 2.0]).unwrap();
        setup.commit().unwrap();

        let mut t1 = mgr.begin();
        let mut t2 = mgr.begin();

        t1.delete_vector(idx).unwrap();
        assert!(matches!(
            t2.delete_vector(idx),
            Err(Error::WriteConflict(_))
        ));

        // The losing txn stays active and may retry after the winner is gone.
        assert_eq!(t2.status(), TxnStatus::Active);
        t1.rollback().unwrap();
        t2.delete_vector(idx).unwrap();
    }

    #[test]
    fn rollback_undoes_inserts_and_delete_stamps() {
        let mgr = MvccManager::new(2).unwrap();
        let mut setup = mgr.begin();
        let idx = setup.add_vector(&[1.0, 2.0]).unwrap();
        setup.commit().unwrap();

        let mut txn = mgr.begin();
        txn.add_vector(&[3.0, 4.0]).unwrap();
        txn.delete_vector(idx).unwrap();
        txn.rollback().unwrap();

        let reader = mgr.begin();
        assert_eq!(reader.count(), 1);
        assert!(reader.get_vector(idx).is_ok());
    }

    #[test]
    fn dropping_an_active_txn_rolls_back() {
        let mgr = MvccManager::new(2).unwrap();
        {
            let mut txn = mgr.begin();
            txn.add_vector(&[5.0, 6.0]).unwrap();
            // dropped without commit
        }
        let reader = mgr.begin();
        assert_eq!(reader.count(), 0);
        assert_eq!(mgr.active_txn_count(), 0);
    }

    #[test]
    fn gc_reclaims_only_safely_dead_versions() {
        let mgr = MvccManager::new(2).unwrap();

        let mut t1 = mgr.begin();
        let idx = t1.add_vector(&[1.0, 2.0]).unwrap();
        t1.commit().unwrap();

        let mut t2 = mgr.begin();
        t2.delete_vector(idx).unwrap();

        // Pending delete: nothing reclaimable yet.
        assert_eq!(mgr.gc(), 0);

        t2.commit().unwrap();
        assert_eq!(mgr.gc(), 1);
        assert_eq!(mgr.version_count(), 0);
    }

    #[test]
    fn gc_respects_active_readers() {
        let mgr = MvccManager::new(2).unwrap();

        let mut t1 = mgr.begin();
        let idx = t1.add_vector(&[1.0, 2.0]).unwrap();
        t1.commit().unwrap();

        // Reader begins before the delete commits; it must keep seeing
        // the version, so gc cannot touch it.
        let reader = mgr.begin();

        let mut t2 = mgr.begin();
        t2.delete_vector(idx).unwrap();
        t2.commit().unwrap();

        assert_eq!(mgr.gc(), 0);
        assert_eq!(reader.count(), 1);

        drop(reader);
        assert_eq!(mgr.gc(), 1);
    }

    #[test]
    fn commit_is_single_shot() {
        let mgr = MvccManager::new(2).unwrap();
        let txn = mgr.begin();
        let id = txn.id();
        txn.commit().unwrap();

        // A fresh txn gets a higher id; the counter never reuses ids.
        let next = mgr.begin();
        assert!(next.id() > id);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mgr = MvccManager::new(3).unwrap();
        let mut txn = mgr.begin();
        assert!(matches!(
            txn.add_vector(&[1.0, 2.0]),
            Err(Error::InvalidDimension { .. })
        ));
    }
}
