//! # Store Module
//!
//! The record store abstraction every other module talks to, plus an in-memory
//! implementation.
//!
//! The store offers point reads, point writes and item-level atomic updates
//! (set add/remove on one group, pointer set on one record), and nothing wider:
//! there is no multi-item transaction. Group set updates are upserts, as a
//! NoSQL `ADD` update would be.

use crate::model::{
    CanonicalGroup, CanonicalId, SourceKey, SourceRecord, Tombstone, UniversalId, UniversalRecord,
};
use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Lazy sequence of universal records read from a secondary index.
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<UniversalRecord>> + 'a>;

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub universal_records: usize,
    pub canonical_groups: usize,
    pub tombstones: usize,
    pub source_records: usize,
}

/// Tables and secondary indices backing the identity model.
pub trait BugStore: Send + Sync {
    fn get_universal(&self, id: &UniversalId) -> Result<Option<UniversalRecord>>;

    /// Insert or overwrite a universal record, maintaining both secondary indices.
    fn put_universal(&self, record: &UniversalRecord) -> Result<()>;

    /// Repoint a record at another group. Returns `false` if the record does not exist.
    fn set_canonical(&self, id: &UniversalId, canonical_id: &CanonicalId) -> Result<bool>;

    fn delete_universal(&self, id: &UniversalId) -> Result<()>;

    /// Ids of every universal record, for audits.
    fn universal_ids(&self) -> Result<Vec<UniversalId>>;

    /// Index (a): source-specific key to universal record.
    fn universal_by_source(&self, key: &SourceKey) -> Result<Option<UniversalRecord>>;

    /// Index (b): every universal record whose pointer names `canonical_id`.
    fn universal_by_canonical<'a>(&'a self, canonical_id: &CanonicalId) -> Result<RecordIter<'a>>;

    fn get_group(&self, id: &CanonicalId) -> Result<Option<CanonicalGroup>>;

    fn put_group(&self, group: &CanonicalGroup) -> Result<()>;

    /// Add to the group's cached member set, creating the group if missing.
    fn add_representations(&self, id: &CanonicalId, members: &BTreeSet<UniversalId>)
        -> Result<()>;

    /// Remove from the group's cached member set. No-op if the group is missing.
    fn remove_representations(
        &self,
        id: &CanonicalId,
        members: &BTreeSet<UniversalId>,
    ) -> Result<()>;

    /// Add to the group's former ids, creating the group if missing.
    fn add_former_representations(
        &self,
        id: &CanonicalId,
        formers: &BTreeSet<CanonicalId>,
    ) -> Result<()>;

    /// Delete a group row. Deleting an absent row is a no-op.
    fn delete_group(&self, id: &CanonicalId) -> Result<()>;

    /// Ids of every live group, for sweeps.
    fn group_ids(&self) -> Result<Vec<CanonicalId>>;

    fn get_tombstone(&self, id: &CanonicalId) -> Result<Option<Tombstone>>;

    /// Write a tombstone unless one already exists. Returns whether it was written.
    fn put_tombstone(&self, tombstone: &Tombstone) -> Result<bool>;

    fn get_source_record(&self, key: &SourceKey) -> Result<Option<SourceRecord>>;

    fn put_source_record(&self, record: &SourceRecord) -> Result<()>;

    fn delete_source_record(&self, key: &SourceKey) -> Result<()>;

    fn stats(&self) -> Result<StoreStats>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Create a durable checkpoint of the store, if supported.
    fn checkpoint(&self, _path: &Path) -> Result<()> {
        Err(anyhow!("checkpoint not supported for this store"))
    }
}

#[derive(Debug, Default)]
struct Tables {
    universal: HashMap<UniversalId, UniversalRecord>,
    groups: HashMap<CanonicalId, CanonicalGroup>,
    tombstones: HashMap<CanonicalId, Tombstone>,
    sources: HashMap<SourceKey, SourceRecord>,
    by_source: HashMap<SourceKey, UniversalId>,
    by_canonical: HashMap<CanonicalId, BTreeSet<UniversalId>>,
}

impl Tables {
    fn unindex(&mut self, record: &UniversalRecord) {
        let key = record.source_key();
        if self.by_source.get(&key) == Some(&record.universal_id) {
            self.by_source.remove(&key);
        }
        if let Some(members) = self.by_canonical.get_mut(&record.canonical_id) {
            members.remove(&record.universal_id);
            if members.is_empty() {
                self.by_canonical.remove(&record.canonical_id);
            }
        }
    }

    fn index(&mut self, record: &UniversalRecord) {
        self.by_source
            .insert(record.source_key(), record.universal_id.clone());
        self.by_canonical
            .entry(record.canonical_id.clone())
            .or_default()
            .insert(record.universal_id.clone());
    }
}

/// In-memory store. Indices are updated synchronously with the tables.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BugStore for MemoryStore {
    fn get_universal(&self, id: &UniversalId) -> Result<Option<UniversalRecord>> {
        Ok(self.tables.read().universal.get(id).cloned())
    }

    fn put_universal(&self, record: &UniversalRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(previous) = tables.universal.remove(&record.universal_id) {
            tables.unindex(&previous);
        }
        tables.index(record);
        tables
            .universal
            .insert(record.universal_id.clone(), record.clone());
        Ok(())
    }

    fn set_canonical(&self, id: &UniversalId, canonical_id: &CanonicalId) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(mut record) = tables.universal.get(id).cloned() else {
            return Ok(false);
        };
        tables.unindex(&record);
        record.canonical_id = canonical_id.clone();
        tables.index(&record);
        tables.universal.insert(id.clone(), record);
        Ok(true)
    }

    fn delete_universal(&self, id: &UniversalId) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(previous) = tables.universal.remove(id) {
            tables.unindex(&previous);
        }
        Ok(())
    }

    fn universal_ids(&self) -> Result<Vec<UniversalId>> {
        let mut ids: Vec<UniversalId> = self.tables.read().universal.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn universal_by_source(&self, key: &SourceKey) -> Result<Option<UniversalRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .by_source
            .get(key)
            .and_then(|id| tables.universal.get(id))
            .cloned())
    }

    fn universal_by_canonical<'a>(&'a self, canonical_id: &CanonicalId) -> Result<RecordIter<'a>> {
        let tables = self.tables.read();
        let records: Vec<UniversalRecord> = tables
            .by_canonical
            .get(canonical_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.universal.get(id).cloned())
            .collect();
        Ok(Box::new(records.into_iter().map(Ok)))
    }

    fn get_group(&self, id: &CanonicalId) -> Result<Option<CanonicalGroup>> {
        Ok(self.tables.read().groups.get(id).cloned())
    }

    fn put_group(&self, group: &CanonicalGroup) -> Result<()> {
        self.tables
            .write()
            .groups
            .insert(group.id.clone(), group.clone());
        Ok(())
    }

    fn add_representations(
        &self,
        id: &CanonicalId,
        members: &BTreeSet<UniversalId>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        tables
            .groups
            .entry(id.clone())
            .or_insert_with(|| CanonicalGroup::new(id.clone()))
            .other_representations
            .extend(members.iter().cloned());
        Ok(())
    }

    fn remove_representations(
        &self,
        id: &CanonicalId,
        members: &BTreeSet<UniversalId>,
    ) -> Result<()> {
        if let Some(group) = self.tables.write().groups.get_mut(id) {
            group
                .other_representations
                .retain(|member| !members.contains(member));
        }
        Ok(())
    }

    fn add_former_representations(
        &self,
        id: &CanonicalId,
        formers: &BTreeSet<CanonicalId>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        tables
            .groups
            .entry(id.clone())
            .or_insert_with(|| CanonicalGroup::new(id.clone()))
            .former_canonical_representations
            .extend(formers.iter().cloned());
        Ok(())
    }

    fn delete_group(&self, id: &CanonicalId) -> Result<()> {
        self.tables.write().groups.remove(id);
        Ok(())
    }

    fn group_ids(&self) -> Result<Vec<CanonicalId>> {
        let mut ids: Vec<CanonicalId> = self.tables.read().groups.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn get_tombstone(&self, id: &CanonicalId) -> Result<Option<Tombstone>> {
        Ok(self.tables.read().tombstones.get(id).cloned())
    }

    fn put_tombstone(&self, tombstone: &Tombstone) -> Result<bool> {
        let mut tables = self.tables.write();
        if tables.tombstones.contains_key(&tombstone.id) {
            return Ok(false);
        }
        tables
            .tombstones
            .insert(tombstone.id.clone(), tombstone.clone());
        Ok(true)
    }

    fn get_source_record(&self, key: &SourceKey) -> Result<Option<SourceRecord>> {
        Ok(self.tables.read().sources.get(key).cloned())
    }

    fn put_source_record(&self, record: &SourceRecord) -> Result<()> {
        self.tables
            .write()
            .sources
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn delete_source_record(&self, key: &SourceKey) -> Result<()> {
        self.tables.write().sources.remove(key);
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats> {
        let tables = self.tables.read();
        Ok(StoreStats {
            universal_records: tables.universal.len(),
            canonical_groups: tables.groups.len(),
            tombstones: tables.tombstones.len(),
            source_records: tables.sources.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(universal: &str, canonical: &str, source_id: &str) -> UniversalRecord {
        UniversalRecord::new(
            universal.into(),
            canonical.into(),
            SourceKey::new("jira", source_id),
        )
    }

    fn members(ids: &[&str]) -> BTreeSet<UniversalId> {
        ids.iter().map(|id| UniversalId::from(*id)).collect()
    }

    #[test]
    fn test_store_creation() {
        let store = MemoryStore::new();
        assert_eq!(store.stats().unwrap(), StoreStats::default());
        assert!(store.group_ids().unwrap().is_empty());
    }

    #[test]
    fn test_source_index_follows_puts_and_deletes() {
        let store = MemoryStore::new();
        store.put_universal(&record("u1", "c1", "J-1")).unwrap();

        let key = SourceKey::new("jira", "J-1");
        let found = store.universal_by_source(&key).unwrap().unwrap();
        assert_eq!(found.universal_id, UniversalId::from("u1"));

        store.delete_universal(&"u1".into()).unwrap();
        assert!(store.universal_by_source(&key).unwrap().is_none());
        assert!(store.universal_ids().unwrap().is_empty());
    }

    #[test]
    fn test_canonical_index_follows_repointing() {
        let store = MemoryStore::new();
        store.put_universal(&record("u1", "c1", "J-1")).unwrap();
        store.put_universal(&record("u2", "c1", "J-2")).unwrap();

        assert!(store.set_canonical(&"u2".into(), &"c2".into()).unwrap());
        let in_c1: Vec<_> = store
            .universal_by_canonical(&"c1".into())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let in_c2: Vec<_> = store
            .universal_by_canonical(&"c2".into())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(in_c1.len(), 1);
        assert_eq!(in_c2[0].universal_id, UniversalId::from("u2"));
        assert_eq!(in_c2[0].canonical_id, CanonicalId::from("c2"));
    }

    #[test]
    fn test_set_canonical_on_missing_record_is_skipped() {
        let store = MemoryStore::new();
        assert!(!store.set_canonical(&"ghost".into(), &"c1".into()).unwrap());
        assert_eq!(store.stats().unwrap().universal_records, 0);
    }

    #[test]
    fn test_group_set_updates_are_upserts() {
        let store = MemoryStore::new();
        store
            .add_representations(&"c1".into(), &members(&["u1", "u2"]))
            .unwrap();
        store
            .add_former_representations(&"c1".into(), &[CanonicalId::from("c0")].into())
            .unwrap();
        store
            .remove_representations(&"c1".into(), &members(&["u1"]))
            .unwrap();

        let group = store.get_group(&"c1".into()).unwrap().unwrap();
        assert_eq!(group.other_representations, members(&["u2"]));
        assert!(group
            .former_canonical_representations
            .contains(&CanonicalId::from("c0")));

        store
            .remove_representations(&"missing".into(), &members(&["u2"]))
            .unwrap();
        assert!(store.get_group(&"missing".into()).unwrap().is_none());
    }

    #[test]
    fn test_tombstones_are_write_once() {
        let store = MemoryStore::new();
        let first = Tombstone {
            id: "c1".into(),
            replacement_id: Some("c2".into()),
        };
        let second = Tombstone {
            id: "c1".into(),
            replacement_id: None,
        };
        assert!(store.put_tombstone(&first).unwrap());
        assert!(!store.put_tombstone(&second).unwrap());
        assert_eq!(store.get_tombstone(&"c1".into()).unwrap(), Some(first));
    }

    #[test]
    fn test_delete_absent_rows_is_noop() {
        let store = MemoryStore::new();
        store.delete_group(&"c1".into()).unwrap();
        store.delete_universal(&"u1".into()).unwrap();
        store
            .delete_source_record(&SourceKey::new("jira", "J-1"))
            .unwrap();
    }
}
