//! Collection alias registry for atomic blue-green deployments.
//!
//! A fixed-size open-addressing hash table (FNV-1a, linear probing) mapping
//! alias names to collection names. The `swap` primitive exchanges two
//! aliases' targets under one write lock so readers never observe a half
//! swapped state.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_ALIASES: usize = 256;
const ALIAS_NAME_MAX: usize = 128;
const COLLECTION_MAX: usize = 256;

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(name: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in name.as_bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Public view of one alias entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasInfo {
    pub alias_name: String,
    pub collection_name: String,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone)]
struct AliasEntry {
    alias_name: String,
    collection_name: String,
    created_at: u64,
    updated_at: u64,
}

struct AliasTable {
    slots: Vec<Option<AliasEntry>>,
    count: usize,
}

impl AliasTable {
    fn new() -> Self {
        Self { slots: vec![None; MAX_ALIASES], count: 0 }
    }

    /// Locate the slot holding `alias_name`. An empty slot along the probe
    /// sequence means the name is absent.
    fn find_slot(&self, alias_name: &str) -> Option<usize> {
        let h = fnv1a(alias_name) as usize;
        for i in 0..MAX_ALIASES {
            let idx = (h + i) % MAX_ALIASES;
            match &self.slots[idx] {
                None => return None,
                Some(e) if e.alias_name == alias_name => return Some(idx),
                Some(_) => {}
            }
        }
        None
    }

    fn find_empty_slot(&self, alias_name: &str) -> Option<usize> {
        let h = fnv1a(alias_name) as usize;
        (0..MAX_ALIASES)
            .map(|i| (h + i) % MAX_ALIASES)
            .find(|&idx| self.slots[idx].is_none())
    }

    fn insert(&mut self, entry: AliasEntry) -> Result<()> {
        let idx = self
            .find_empty_slot(&entry.alias_name)
            .ok_or_else(|| Error::CapacityExhausted("alias table full".into()))?;
        self.slots[idx] = Some(entry);
        self.count += 1;
        Ok(())
    }

    /// Remove the entry at `idx`, then rehash the probe cluster that follows
    /// it so displaced entries remain reachable.
    fn remove_and_rehash(&mut self, idx: usize) {
        self.slots[idx] = None;
        self.count -= 1;

        let mut cur = (idx + 1) % MAX_ALIASES;
        while let Some(displaced) = self.slots[cur].take() {
            self.count -= 1;
            // The table has at least one hole (the one just opened), so this
            // re-insert cannot fail.
            let new_idx = self
                .find_empty_slot(&displaced.alias_name)
                .expect("probe cluster rehash found no empty slot");
            self.slots[new_idx] = Some(displaced);
            self.count += 1;
            cur = (cur + 1) % MAX_ALIASES;
        }
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Alias registry with atomic swap.
///
/// `resolve`/`exists`/`list` take a read lock; all mutations take the write
/// lock.
pub struct AliasRegistry {
    table: RwLock<AliasTable>,
}

impl Default for AliasRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self { table: RwLock::new(AliasTable::new()) }
    }

    /// Register `alias_name` pointing at `collection_name`.
    pub fn create(&self, alias_name: &str, collection_name: &str) -> Result<()> {
        if alias_name.is_empty() || alias_name.len() >= ALIAS_NAME_MAX {
            return Err(Error::InvalidArgument(format!(
                "alias name must be 1..{} bytes",
                ALIAS_NAME_MAX
            )));
        }
        if collection_name.len() >= COLLECTION_MAX {
            return Err(Error::InvalidArgument(format!(
                "collection name must be under {} bytes",
                COLLECTION_MAX
            )));
        }

        let mut table = self.table.write();
        if table.find_slot(alias_name).is_some() {
            return Err(Error::AliasExists(alias_name.to_string()));
        }
        if table.count >= MAX_ALIASES {
            return Err(Error::CapacityExhausted("alias table full".into()));
        }

        let now = now_unix();
        table.insert(AliasEntry {
            alias_name: alias_name.to_string(),
            collection_name: collection_name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Repoint an existing alias at a new collection.
    pub fn update(&self, alias_name: &str, new_collection_name: &str) -> Result<()> {
        if new_collection_name.len() >= COLLECTION_MAX {
            return Err(Error::InvalidArgument(format!(
                "collection name must be under {} bytes",
                COLLECTION_MAX
            )));
        }

        let mut table = self.table.write();
        let idx = table
            .find_slot(alias_name)
            .ok_or_else(|| Error::AliasNotFound(alias_name.to_string()))?;
        let entry = table.slots[idx].as_mut().unwrap();
        entry.collection_name = new_collection_name.to_string();
        entry.updated_at = now_unix();
        Ok(())
    }

    pub fn delete(&self, alias_name: &str) -> Result<()> {
        let mut table = self.table.write();
        let idx = table
            .find_slot(alias_name)
            .ok_or_else(|| Error::AliasNotFound(alias_name.to_string()))?;
        table.remove_and_rehash(idx);
        Ok(())
    }

    pub fn exists(&self, alias_name: &str) -> bool {
        self.table.read().find_slot(alias_name).is_some()
    }

    /// Exchange the collections behind two aliases.
    ///
    /// Succeeds fully or, when either alias is missing, fails without
    /// touching either entry. Both entries receive the same `updated_at`.
    pub fn swap(&self, alias_a: &str, alias_b: &str) -> Result<()> {
        let mut table = self.table.write();
        let idx_a = table
            .find_slot(alias_a)
            .ok_or_else(|| Error::AliasNotFound(alias_a.to_string()))?;
        let idx_b = table
            .find_slot(alias_b)
            .ok_or_else(|| Error::AliasNotFound(alias_b.to_string()))?;

        let now = now_unix();
        if idx_a == idx_b {
            table.slots[idx_a].as_mut().unwrap().updated_at = now;
            return Ok(());
        }

        let coll_a = table.slots[idx_a].as_ref().unwrap().collection_name.clone();
        let coll_b = table.slots[idx_b].as_ref().unwrap().collection_name.clone();
        {
            let a = table.slots[idx_a].as_mut().unwrap();
            a.collection_name = coll_b;
            a.updated_at = now;
        }
        {
            let b = table.slots[idx_b].as_mut().unwrap();
            b.collection_name = coll_a;
            b.updated_at = now;
        }
        Ok(())
    }

    /// Resolve an alias to its collection name.
    pub fn resolve(&self, alias_name: &str) -> Result<String> {
        let table = self.table.read();
        let idx = table
            .find_slot(alias_name)
            .ok_or_else(|| Error::AliasNotFound(alias_name.to_string()))?;
        Ok(table.slots[idx].as_ref().unwrap().collection_name.clone())
    }

    /// Snapshot every alias, in slot order.
    pub fn list(&self) -> Vec<AliasInfo> {
        let table = self.table.read();
        table
            .slots
            .iter()
            .flatten()
            .map(|e| AliasInfo {
                alias_name: e.alias_name.clone(),
                collection_name: e.collection_name.clone(),
                created_at: e.created_at,
                updated_at: e.updated_at,
            })
            .collect()
    }

    pub fn get_info(&self, alias_name: &str) -> Result<AliasInfo> {
        let table = self.table.read();
        let idx = table
            .find_slot(alias_name)
            .ok_or_else(|| Error::AliasNotFound(alias_name.to_string()))?;
        let e = table.slots[idx].as_ref().unwrap();
        Ok(AliasInfo {
            alias_name: e.alias_name.clone(),
            collection_name: e.collection_name.clone(),
            created_at: e.created_at,
            updated_at: e.updated_at,
        })
    }

    pub fn len(&self) -> usize {
        self.table.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize the registry: `count:u32`, then per entry the
    /// length-prefixed alias and collection names plus both timestamps,
    /// little-endian throughout.
    pub fn save<W: Write>(&self, mut w: W) -> Result<()> {
        let table = self.table.read();
        w.write_all(&(table.count as u32).to_le_bytes())?;
        for e in table.slots.iter().flatten() {
            w.write_all(&(e.alias_name.len() as u32).to_le_bytes())?;
            w.write_all(e.alias_name.as_bytes())?;
            w.write_all(&(e.collection_name.len() as u32).to_le_bytes())?;
            w.write_all(e.collection_name.as_bytes())?;
            w.write_all(&e.created_at.to_le_bytes())?;
            w.write_all(&e.updated_at.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn load<R: Read>(mut r: R) -> Result<Self> {
        let count = read_u32(&mut r)? as usize;
        if count > MAX_ALIASES {
            return Err(Error::Corrupt(format!(
                "alias count {} exceeds table capacity",
                count
            )));
        }

        let registry = Self::new();
        {
            let mut table = registry.table.write();
            for _ in 0..count {
                let alias_name = read_string(&mut r, ALIAS_NAME_MAX)?;
                let collection_name = read_string(&mut r, COLLECTION_MAX)?;
                let created_at = read_u64(&mut r)?;
                let updated_at = read_u64(&mut r)?;
                table.insert(AliasEntry {
                    alias_name,
                    collection_name,
                    created_at,
                    updated_at,
                })?;
            }
        }
        Ok(registry)
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

fn read_string<R: Read>(r: &mut R, max_len: usize) -> Result<String> {
    let len = read_u32(r)? as usize;
    if len >= max_len {
        return Err(Error::Corrupt(format!("string length {} out of range", len)));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|_| Error::Corrupt("truncated string".into()))?;
    String::from_utf8(buf).map_err(|_| Error::Corrupt("invalid utf-8 string".into()))
}
