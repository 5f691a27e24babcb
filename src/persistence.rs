//! RocksDB-backed `BugStore`.
//!
//! One column family per table and per secondary index. Every multi-key write
//! (a record plus its index entries) goes out as a single `WriteBatch`, and
//! read-modify-write updates are serialised by a store-local lock, so each
//! trait method is atomic on its own item the way a NoSQL `UpdateItem` is.

use crate::config::{StoreConfig, DEFAULT_CACHE_CAPACITY};
use crate::model::{
    CanonicalGroup, CanonicalId, SourceKey, SourceRecord, Tombstone, UniversalId, UniversalRecord,
};
use crate::store::{BugStore, RecordIter, StoreStats};
use anyhow::{anyhow, Result};
use lru::LruCache;
use parking_lot::Mutex as WriteLock;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

const CF_UNIVERSAL: &str = "universal_records";
const CF_GROUPS: &str = "canonical_groups";
const CF_TOMBSTONES: &str = "tombstones";
const CF_SOURCES: &str = "source_records";
const CF_INDEX_SOURCE: &str = "index_source";
const CF_INDEX_CANONICAL: &str = "index_canonical";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

pub struct PersistentStore {
    db: DB,
    cache: Mutex<LruCache<UniversalId, UniversalRecord>>,
    write_lock: WriteLock<()>,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub cache_capacity: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl From<&StoreConfig> for PersistentOpenOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            repair: config.repair,
            cache_capacity: config.cache_capacity,
        }
    }
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            warn!(path = %path.as_ref().display(), "repairing store before open");
            repair_db(path.as_ref())?;
        }
        let db = open_db(path.as_ref())?;
        validate_or_init_manifest(&db)?;

        let capacity = NonZeroUsize::new(options.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        info!(path = %path.as_ref().display(), "opened persistent store");
        Ok(Self {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
            write_lock: WriteLock::new(()),
        })
    }

    pub fn open_config(config: &StoreConfig) -> Result<Self> {
        Self::open_with_options(&config.data_dir, config.into())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("missing {name} column family"))
    }

    fn get_row<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_row<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db.put_cf(cf, key, bincode::serialize(value)?)?;
        Ok(())
    }

    fn cache_put(&self, record: &UniversalRecord) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(record.universal_id.clone(), record.clone());
        }
    }

    fn cache_evict(&self, id: &UniversalId) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(id);
        }
    }

    /// Batch the index entries of `previous` away and those of `record` in.
    fn write_universal(
        &self,
        previous: Option<&UniversalRecord>,
        record: &UniversalRecord,
    ) -> Result<()> {
        let records_cf = self.cf(CF_UNIVERSAL)?;
        let source_cf = self.cf(CF_INDEX_SOURCE)?;
        let canonical_cf = self.cf(CF_INDEX_CANONICAL)?;

        let mut batch = WriteBatch::default();
        if let Some(previous) = previous {
            self.unindex(&mut batch, previous)?;
        }
        batch.put_cf(
            records_cf,
            record.universal_id.as_str(),
            bincode::serialize(record)?,
        );
        batch.put_cf(
            source_cf,
            encode_source_key(&record.source_key()),
            record.universal_id.as_str(),
        );
        batch.put_cf(
            canonical_cf,
            encode_member_key(&record.canonical_id, &record.universal_id),
            [],
        );
        self.db.write(batch)?;
        self.cache_put(record);
        Ok(())
    }

    fn unindex(&self, batch: &mut WriteBatch, record: &UniversalRecord) -> Result<()> {
        let source_cf = self.cf(CF_INDEX_SOURCE)?;
        let canonical_cf = self.cf(CF_INDEX_CANONICAL)?;
        let source_key = encode_source_key(&record.source_key());
        if self.db.get_cf(source_cf, &source_key)?.as_deref()
            == Some(record.universal_id.as_str().as_bytes())
        {
            batch.delete_cf(source_cf, source_key);
        }
        batch.delete_cf(
            canonical_cf,
            encode_member_key(&record.canonical_id, &record.universal_id),
        );
        Ok(())
    }

    fn update_group(
        &self,
        id: &CanonicalId,
        create: bool,
        update: impl FnOnce(&mut CanonicalGroup),
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut group = match self.get_row::<CanonicalGroup>(CF_GROUPS, id.as_str().as_bytes())? {
            Some(group) => group,
            None if create => CanonicalGroup::new(id.clone()),
            None => return Ok(()),
        };
        update(&mut group);
        self.put_row(CF_GROUPS, id.as_str().as_bytes(), &group)
    }

    fn count_rows(&self, cf_name: &str) -> Result<usize> {
        let cf = self.cf(cf_name)?;
        let mut count = 0;
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

impl BugStore for PersistentStore {
    fn get_universal(&self, id: &UniversalId) -> Result<Option<UniversalRecord>> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(record) = cache.get(id) {
                return Ok(Some(record.clone()));
            }
        }
        // Only fill the cache when no writer is active, or a stale row could be cached.
        let guard = self.write_lock.try_lock();
        let record: Option<UniversalRecord> = self.get_row(CF_UNIVERSAL, id.as_str().as_bytes())?;
        if let (Some(_guard), Some(record)) = (guard, &record) {
            self.cache_put(record);
        }
        Ok(record)
    }

    fn put_universal(&self, record: &UniversalRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let previous = self.get_universal(&record.universal_id)?;
        self.write_universal(previous.as_ref(), record)
    }

    fn set_canonical(&self, id: &UniversalId, canonical_id: &CanonicalId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let Some(previous) = self.get_universal(id)? else {
            return Ok(false);
        };
        let mut record = previous.clone();
        record.canonical_id = canonical_id.clone();
        self.write_universal(Some(&previous), &record)?;
        Ok(true)
    }

    fn delete_universal(&self, id: &UniversalId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let Some(previous) = self.get_universal(id)? else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        self.unindex(&mut batch, &previous)?;
        batch.delete_cf(self.cf(CF_UNIVERSAL)?, id.as_str());
        self.db.write(batch)?;
        self.cache_evict(id);
        Ok(())
    }

    fn universal_ids(&self) -> Result<Vec<UniversalId>> {
        let cf = self.cf(CF_UNIVERSAL)?;
        let mut ids = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = entry?;
            ids.push(UniversalId::new(String::from_utf8(key.to_vec())?));
        }
        Ok(ids)
    }

    fn universal_by_source(&self, key: &SourceKey) -> Result<Option<UniversalRecord>> {
        let cf = self.cf(CF_INDEX_SOURCE)?;
        let Some(bytes) = self.db.get_cf(cf, encode_source_key(key))? else {
            return Ok(None);
        };
        let universal_id = UniversalId::new(String::from_utf8(bytes)?);
        self.get_universal(&universal_id)
    }

    fn universal_by_canonical<'a>(&'a self, canonical_id: &CanonicalId) -> Result<RecordIter<'a>> {
        let cf = self.cf(CF_INDEX_CANONICAL)?;
        let prefix = encode_string_prefix(canonical_id.as_str());
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        let canonical_id = canonical_id.clone();
        let records = iter
            .take_while({
                let prefix = prefix.clone();
                move |entry| match entry {
                    Ok((key, _)) => key.starts_with(&prefix),
                    Err(_) => true,
                }
            })
            .filter_map(move |entry| {
                let member = entry.map_err(anyhow::Error::from).and_then(|(key, _)| {
                    let universal_id = std::str::from_utf8(&key[prefix.len()..])?;
                    self.get_universal(&UniversalId::new(universal_id))
                });
                match member {
                    Ok(Some(record)) if record.canonical_id == canonical_id => Some(Ok(record)),
                    Ok(_) => None,
                    Err(err) => Some(Err(err)),
                }
            });
        Ok(Box::new(records))
    }

    fn get_group(&self, id: &CanonicalId) -> Result<Option<CanonicalGroup>> {
        self.get_row(CF_GROUPS, id.as_str().as_bytes())
    }

    fn put_group(&self, group: &CanonicalGroup) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.put_row(CF_GROUPS, group.id.as_str().as_bytes(), group)
    }

    fn add_representations(
        &self,
        id: &CanonicalId,
        members: &BTreeSet<UniversalId>,
    ) -> Result<()> {
        self.update_group(id, true, |group| {
            group.other_representations.extend(members.iter().cloned())
        })
    }

    fn remove_representations(
        &self,
        id: &CanonicalId,
        members: &BTreeSet<UniversalId>,
    ) -> Result<()> {
        self.update_group(id, false, |group| {
            group
                .other_representations
                .retain(|member| !members.contains(member))
        })
    }

    fn add_former_representations(
        &self,
        id: &CanonicalId,
        formers: &BTreeSet<CanonicalId>,
    ) -> Result<()> {
        self.update_group(id, true, |group| {
            group
                .former_canonical_representations
                .extend(formers.iter().cloned())
        })
    }

    fn delete_group(&self, id: &CanonicalId) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.db.delete_cf(self.cf(CF_GROUPS)?, id.as_str())?;
        Ok(())
    }

    fn group_ids(&self) -> Result<Vec<CanonicalId>> {
        let cf = self.cf(CF_GROUPS)?;
        let mut ids = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = entry?;
            ids.push(CanonicalId(String::from_utf8(key.to_vec())?));
        }
        Ok(ids)
    }

    fn get_tombstone(&self, id: &CanonicalId) -> Result<Option<Tombstone>> {
        self.get_row(CF_TOMBSTONES, id.as_str().as_bytes())
    }

    fn put_tombstone(&self, tombstone: &Tombstone) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let key = tombstone.id.as_str().as_bytes();
        if self.db.get_cf(self.cf(CF_TOMBSTONES)?, key)?.is_some() {
            return Ok(false);
        }
        self.put_row(CF_TOMBSTONES, key, tombstone)?;
        Ok(true)
    }

    fn get_source_record(&self, key: &SourceKey) -> Result<Option<SourceRecord>> {
        self.get_row(CF_SOURCES, &encode_source_key(key))
    }

    fn put_source_record(&self, record: &SourceRecord) -> Result<()> {
        self.put_row(CF_SOURCES, &encode_source_key(&record.key), record)
    }

    fn delete_source_record(&self, key: &SourceKey) -> Result<()> {
        self.db
            .delete_cf(self.cf(CF_SOURCES)?, encode_source_key(key))?;
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            universal_records: self.count_rows(CF_UNIVERSAL)?,
            canonical_groups: self.count_rows(CF_GROUPS)?,
            tombstones: self.count_rows(CF_TOMBSTONES)?,
            source_records: self.count_rows(CF_SOURCES)?,
        })
    }

    fn flush(&self) -> Result<()> {
        PersistentStore::flush(self)
    }

    fn checkpoint(&self, path: &Path) -> Result<()> {
        PersistentStore::checkpoint(self, path)
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_db(path: &Path) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = [
        CF_UNIVERSAL,
        CF_GROUPS,
        CF_TOMBSTONES,
        CF_SOURCES,
        CF_INDEX_SOURCE,
        CF_INDEX_CANONICAL,
        CF_METADATA,
    ]
    .into_iter()
    .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn encode_string_prefix(value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 1);
    key.extend_from_slice(value.as_bytes());
    key.push(0);
    key
}

fn encode_source_key(key: &SourceKey) -> Vec<u8> {
    let mut encoded = encode_string_prefix(&key.source);
    encoded.extend_from_slice(key.source_specific_id.as_bytes());
    encoded
}

fn encode_member_key(canonical_id: &CanonicalId, universal_id: &UniversalId) -> Vec<u8> {
    let mut key = encode_string_prefix(canonical_id.as_str());
    key.extend_from_slice(universal_id.as_str().as_bytes());
    key
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}
