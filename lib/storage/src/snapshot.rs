//! Point-in-time snapshot store.
//!
//! Holds immutable copies of a vector set, each tagged with an id, a
//! microsecond timestamp, and a short label. Deleting a snapshot tombstones
//! its entry; ids are never reused. The whole store serializes to a single
//! binary file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use stratavec_core::{Error, Result};

const MAGIC: &[u8; 6] = b"GVSNAP";
const VERSION: u32 = 1;
const LABEL_BYTES: usize = 64;

/// Summary of one live snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: u64,
    pub timestamp_us: u64,
    pub vector_count: usize,
    pub dimension: usize,
    pub label: String,
}

/// An opened snapshot. Cheap to clone; the vector data is shared and
/// immutable.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub snapshot_id: u64,
    pub timestamp_us: u64,
    dimension: usize,
    data: Arc<Vec<f32>>,
    label: String,
}

impl Snapshot {
    pub fn count(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn vector(&self, index: usize) -> Option<&[f32]> {
        if index >= self.count() {
            return None;
        }
        Some(&self.data[index * self.dimension..(index + 1) * self.dimension])
    }
}

struct SnapshotEntry {
    snapshot_id: u64,
    timestamp_us: u64,
    vector_count: usize,
    dimension: usize,
    data: Arc<Vec<f32>>,
    label: String,
    active: bool,
}

struct StoreState {
    entries: Vec<SnapshotEntry>,
    next_id: u64,
}

/// Snapshot store capped at `max_snapshots` live entries.
pub struct SnapshotStore {
    max_snapshots: usize,
    state: RwLock<StoreState>,
}

impl SnapshotStore {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            max_snapshots,
            state: RwLock::new(StoreState { entries: Vec::new(), next_id: 1 }),
        }
    }

    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }

    /// Copy `vectors` (flat `count * dimension` floats) into a new snapshot.
    /// Returns the snapshot id.
    pub fn create(&self, vectors: &[f32], dimension: usize, label: &str) -> Result<u64> {
        if dimension == 0 || vectors.len() % dimension != 0 {
            return Err(Error::InvalidDimension {
                expected: dimension,
                actual: vectors.len(),
            });
        }

        let mut state = self.state.write();
        let active = state.entries.iter().filter(|e| e.active).count();
        if active >= self.max_snapshots {
            return Err(Error::CapacityExhausted(format!(
                "snapshot limit reached ({})",
                self.max_snapshots
            )));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(SnapshotEntry {
            snapshot_id: id,
            timestamp_us: now_microseconds(),
            vector_count: vectors.len() / dimension,
            dimension,
            data: Arc::new(vectors.to_vec()),
            label: truncate_label(label),
            active: true,
        });
        Ok(id)
    }

    /// Open a live snapshot for reading.
    pub fn open(&self, snapshot_id: u64) -> Result<Snapshot> {
        let state = self.state.read();
        let entry = state
            .entries
            .iter()
            .find(|e| e.active && e.snapshot_id == snapshot_id)
            .ok_or(Error::SnapshotNotFound(snapshot_id))?;
        Ok(Snapshot {
            snapshot_id: entry.snapshot_id,
            timestamp_us: entry.timestamp_us,
            dimension: entry.dimension,
            data: entry.data.clone(),
            label: entry.label.clone(),
        })
    }

    /// Tombstone a snapshot and release its data. The id is never reused.
    pub fn delete(&self, snapshot_id: u64) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.active && e.snapshot_id == snapshot_id)
            .ok_or(Error::SnapshotNotFound(snapshot_id))?;
        entry.active = false;
        entry.data = Arc::new(Vec::new());
        entry.vector_count = 0;
        Ok(())
    }

    pub fn list(&self) -> Vec<SnapshotInfo> {
        let state = self.state.read();
        state
            .entries
            .iter()
            .filter(|e| e.active)
            .map(|e| SnapshotInfo {
                snapshot_id: e.snapshot_id,
                timestamp_us: e.timestamp_us,
                vector_count: e.vector_count,
                dimension: e.dimension,
                label: e.label.clone(),
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.state.read().entries.iter().filter(|e| e.active).count()
    }

    /// Serialize the live snapshots. Tombstoned entries are dropped; the id
    /// counter is preserved so reloaded stores never reuse an id.
    pub fn save<W: Write>(&self, mut w: W) -> Result<()> {
        let state = self.state.read();
        let active: Vec<&SnapshotEntry> =
            state.entries.iter().filter(|e| e.active).collect();

        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(active.len() as u64).to_le_bytes())?;
        w.write_all(&(self.max_snapshots as u64).to_le_bytes())?;
        w.write_all(&state.next_id.to_le_bytes())?;

        for e in active {
            w.write_all(&e.snapshot_id.to_le_bytes())?;
            w.write_all(&e.timestamp_us.to_le_bytes())?;
            w.write_all(&(e.vector_count as u64).to_le_bytes())?;
            w.write_all(&(e.dimension as u64).to_le_bytes())?;

            let mut label = [0u8; LABEL_BYTES];
            let bytes = e.label.as_bytes();
            label[..bytes.len()].copy_from_slice(bytes);
            w.write_all(&label)?;

            for &v in e.data.iter() {
                w.write_all(&v.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn load<R: Read>(mut r: R) -> Result<Self> {
        let mut magic = [0u8; 6];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::Corrupt("bad snapshot magic".into()));
        }
        let version = read_u32(&mut r)?;
        if version != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported snapshot version {}",
                version
            )));
        }

        let active_count = read_u64(&mut r)? as usize;
        let max_snapshots = read_u64(&mut r)? as usize;
        let next_id = read_u64(&mut r)?;

        let mut entries = Vec::new();
        for _ in 0..active_count {
            let snapshot_id = read_u64(&mut r)?;
            let timestamp_us = read_u64(&mut r)?;
            let vector_count = read_u64(&mut r)? as usize;
            let dimension = read_u64(&mut r)? as usize;

            let mut label_buf = [0u8; LABEL_BYTES];
            r.read_exact(&mut label_buf)
                .map_err(|_| Error::Corrupt("truncated snapshot label".into()))?;
            let end = label_buf.iter().position(|&b| b == 0).unwrap_or(LABEL_BYTES);
            let label = String::from_utf8(label_buf[..end].to_vec())
                .map_err(|_| Error::Corrupt("invalid snapshot label".into()))?;

            let total = (vector_count as u64)
                .checked_mul(dimension as u64)
                .ok_or_else(|| Error::Corrupt("snapshot entry size overflows".into()))?;

            // The counts come from the file, so the buffer grows with the
            // data actually read instead of being sized from the header.
            let mut data = Vec::new();
            let mut buf = [0u8; 4];
            for _ in 0..total {
                r.read_exact(&mut buf)
                    .map_err(|_| Error::Corrupt("truncated snapshot data".into()))?;
                data.push(f32::from_le_bytes(buf));
            }

            entries.push(SnapshotEntry {
                snapshot_id,
                timestamp_us,
                vector_count,
                dimension,
                data: Arc::new(data),
                label,
                active: true,
            });
        }

        Ok(Self {
            max_snapshots,
            state: RwLock::new(StoreState { entries, next_id }),
        })
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

fn now_microseconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn truncate_label(label: &str) -> String {
    if label.len() < LABEL_BYTES {
        return label.to_string();
    }
    // Trim to the last char boundary below the byte limit.
    let mut end = LABEL_BYTES - 1;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    label[..end].to_string()
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

    fn sample_vectors() -> Vec<f32> {
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    }

    #[test]
    fn create_open_read() {
        let store = SnapshotStore::new(4);
        let id = store.create(&sample_vectors(), 3, "baseline").unwrap();
        assert_eq!(id, 1);

        let snap = store.open(id).unwrap();
        assert_eq!(snap.count(), 2);
        assert_eq!(snap.dimension(), 3);
        assert_eq!(snap.label(), "baseline");
        assert_eq!(snap.vector(0).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(snap.vector(1).unwrap(), &[4.0, 5.0, 6.0]);
        assert!(snap.vector(2).is_none());
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let store = SnapshotStore::new(8);
        let a = store.create(&sample_vectors(), 3, "a").unwrap();
        let b = store.create(&sample_vectors(), 3, "b").unwrap();
        assert_eq!((a, b), (1, 2));

        store.delete(a).unwrap();
        let c = store.create(&sample_vectors(), 3, "c").unwrap();
        assert_eq!(c, 3);
    }

    #[test]
    fn delete_tombstones_entry() {
        let store = SnapshotStore::new(4);
        let id = store.create(&sample_vectors(), 3, "x").unwrap();
        store.delete(id).unwrap();

        assert!(matches!(store.open(id), Err(Error::SnapshotNotFound(_))));
        assert!(store.delete(id).is_err());
        assert_eq!(store.active_count(), 0);
        assert!(store.list().is_empty());
    }

    #[test]
    fn open_snapshot_survives_deletion() {
        let store = SnapshotStore::new(4);
        let id = store.create(&sample_vectors(), 3, "x").unwrap();
        let snap = store.open(id).unwrap();
        store.delete(id).unwrap();
        // The opened handle still owns the data.
        assert_eq!(snap.vector(0).unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn cap_counts_only_live_snapshots() {
        let store = SnapshotStore::new(2);
        let a = store.create(&sample_vectors(), 3, "a").unwrap();
        store.create(&sample_vectors(), 3, "b").unwrap();
        assert!(matches!(
            store.create(&sample_vectors(), 3, "c"),
            Err(Error::CapacityExhausted(_))
        ));

        store.delete(a).unwrap();
        store.create(&sample_vectors(), 3, "c").unwrap();
    }

    #[test]
    fn ragged_input_rejected() {
        let store = SnapshotStore::new(4);
        assert!(store.create(&[1.0, 2.0, 3.0, 4.0], 3, "bad").is_err());
        assert!(store.create(&sample_vectors(), 0, "bad").is_err());
    }

    #[test]
    fn long_labels_are_truncated() {
        let store = SnapshotStore::new(4);
        let id = store.create(&sample_vectors(), 3, &"L".repeat(100)).unwrap();
        let snap = store.open(id).unwrap();
        assert_eq!(snap.label().len(), LABEL_BYTES - 1);
    }

    #[test]
    fn save_load_round_trip_is_byte_identical() {
        let store = SnapshotStore::new(4);
        store.create(&sample_vectors(), 3, "keep").unwrap();
        let doomed = store.create(&[9.0, 9.0], 2, "drop").unwrap();
        store.delete(doomed).unwrap();

        let mut buf = Vec::new();
        store.save(&mut buf).unwrap();

        let loaded = SnapshotStore::load(buf.as_slice()).unwrap();
        assert_eq!(loaded.active_count(), 1);
        assert_eq!(loaded.max_snapshots(), 4);

        let snap = loaded.open(1).unwrap();
        assert_eq!(snap.label(), "keep");
        assert_eq!(snap.vector(1).unwrap(), &[4.0, 5.0, 6.0]);

        // The tombstoned id stays burned after reload.
        assert!(loaded.open(doomed).is_err());
        assert_eq!(loaded.create(&sample_vectors(), 3, "next").unwrap(), 3);

        let mut buf2 = Vec::new();
        SnapshotStore::load(buf.as_slice()).unwrap().save(&mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn load_rejects_corrupt_input() {
        let store = SnapshotStore::new(4);
        store.create(&sample_vectors(), 3, "x").unwrap();
        let mut buf = Vec::new();
        store.save(&mut buf).unwrap();

        let mut bad_magic = buf.clone();
        bad_magic[0] = b'X';
        assert!(SnapshotStore::load(bad_magic.as_slice()).is_err());

        let mut bad_version = buf.clone();
        bad_version[6] = 9;
        assert!(SnapshotStore::load(bad_version.as_slice()).is_err());

        assert!(SnapshotStore::load(&buf[..buf.len() - 5]).is_err());
    }

    #[test]
    fn load_rejects_oversized_counts_without_allocating() {
        // Header claiming one entry, then an entry header whose counts are
        // absurd and carry no data behind them.
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes()); // active_count
        buf.extend_from_slice(&4u64.to_le_bytes()); // max_snapshots
        buf.extend_from_slice(&2u64.to_le_bytes()); // next_id
        buf.extend_from_slice(&1u64.to_le_bytes()); // snapshot_id
        buf.extend_from_slice(&0u64.to_le_bytes()); // timestamp_us
        buf.extend_from_slice(&u64::MAX.to_le_bytes()); // vector_count
        buf.extend_from_slice(&u64::MAX.to_le_bytes()); // dimension
        buf.extend_from_slice(&[0u8; LABEL_BYTES]);

        assert!(matches!(
            SnapshotStore::load(buf.as_slice()),
            Err(Error::Corrupt(_))
        ));

        // Counts that multiply without overflow but dwarf the payload must
        // fail on the missing data, not commit memory up front.
        let len = buf.len();
        buf[len - LABEL_BYTES - 16..len - LABEL_BYTES - 8]
            .copy_from_slice(&(1u64 << 40).to_le_bytes());
        buf[len - LABEL_BYTES - 8..len - LABEL_BYTES].copy_from_slice(&1u64.to_le_bytes());
        assert!(matches!(
            SnapshotStore::load(buf.as_slice()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn save_load_via_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.bin");

        let store = SnapshotStore::new(4);
        store.create(&sample_vectors(), 3, "disk").unwrap();
        store.save_to_path(&path).unwrap();

        let loaded = SnapshotStore::load_from_path(&path).unwrap();
        assert_eq!(loaded.open(1).unwrap().label(), "disk");
    }
}
