//! # Bugdex
//!
//! Bug identity resolution across issue trackers, scanners and other sources.
//!
//! Every record observed in an external source gets a universal record. Universal
//! records that describe the same real bug share a canonical group, and groups
//! retired by merges leave tombstones that point at their successor. Writes are
//! never transactional across entities; a reconciliation sweep repairs whatever
//! drift crashes and races leave behind.

pub mod audit;
pub mod canonical;
pub mod config;
pub mod error;
pub mod model;
pub mod persistence;
pub mod query;
pub mod registry;
pub mod store;
pub mod sweep;
pub mod test_support;
pub mod tombstone;

// Re-export main types for convenience
pub use audit::{AuditReport, Violation};
pub use canonical::{GcOutcome, RetireCause, SweepFailure, SweepReport};
pub use config::{BugdexConfig, StoreBackend, StoreConfig, SweepConfig};
pub use error::{BugdexError, EntityKind, Result};
pub use model::{
    CanonicalGroup, CanonicalId, EntityRef, RecordRef, SourceKey, SourceObservation, SourceRecord,
    Tombstone, UniversalId, UniversalRecord,
};
pub use persistence::PersistentStore;
pub use query::DeletedRecord;
pub use store::{BugStore, MemoryStore, StoreStats};
pub use sweep::Sweeper;
pub use tombstone::TombstoneLedger;

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Main API for bug identity resolution.
///
/// Owns the store handle; construct once at process start and share it.
pub struct Bugdex {
    store: Arc<dyn BugStore>,
}

impl Bugdex {
    /// Create an instance backed by an in-memory store.
    pub fn in_memory() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Create an instance with a custom store implementation.
    pub fn with_store<S>(store: S) -> Self
    where
        S: BugStore + 'static,
    {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_shared(store: Arc<dyn BugStore>) -> Self {
        Self { store }
    }

    /// Open the store described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        match config.backend {
            StoreBackend::Memory => Ok(Self::in_memory()),
            StoreBackend::Rocksdb => Ok(Self::with_store(PersistentStore::open_config(config)?)),
        }
    }

    pub fn store(&self) -> &dyn BugStore {
        self.store.as_ref()
    }

    /// Shared handle, e.g. for a `Sweeper`.
    pub fn shared_store(&self) -> Arc<dyn BugStore> {
        Arc::clone(&self.store)
    }

    pub fn propose(
        &self,
        universal_id: &UniversalId,
        source_key: &SourceKey,
        canonical_id: Option<&CanonicalId>,
    ) -> Result<UniversalRecord> {
        registry::propose(self.store(), universal_id, source_key, canonical_id)
    }

    pub fn ingest(
        &self,
        observation: SourceObservation,
        canonical_id: Option<&CanonicalId>,
    ) -> Result<UniversalRecord> {
        registry::ingest(self.store(), observation, canonical_id)
    }

    pub fn lookup_by_source(&self, key: &SourceKey) -> Result<Option<UniversalRecord>> {
        registry::lookup_by_source(self.store(), key)
    }

    pub fn resolve(&self, reference: &RecordRef) -> Result<UniversalRecord> {
        registry::resolve(self.store(), reference)
    }

    pub fn canonical_group_of(&self, reference: &RecordRef) -> Result<CanonicalGroup> {
        registry::canonical_group_of(self.store(), reference)
    }

    pub fn group(&self, id: &CanonicalId) -> Result<CanonicalGroup> {
        self.store()
            .get_group(id)?
            .ok_or_else(|| BugdexError::not_found(EntityKind::CanonicalGroup, id))
    }

    pub fn related_bugs(
        &self,
        reference: &RecordRef,
    ) -> Result<impl Iterator<Item = Result<UniversalRecord>> + '_> {
        query::related_bugs(self.store(), reference)
    }

    /// Merge the group `absorb` into the group `keep`, both given by id.
    pub fn merge(&self, keep: &CanonicalId, absorb: &CanonicalId) -> Result<()> {
        let keep = self.group(keep)?;
        let absorb = self.group(absorb)?;
        canonical::merge(self.store(), &keep, &absorb)
    }

    /// Merge the groups the two records currently belong to, keeping the first.
    pub fn merge_records(&self, keep: &RecordRef, absorb: &RecordRef) -> Result<()> {
        let keep = self.canonical_group_of(keep)?;
        let absorb = self.canonical_group_of(absorb)?;
        canonical::merge(self.store(), &keep, &absorb)
    }

    pub fn die(&self, group: &CanonicalGroup, replacement: Option<&CanonicalGroup>) -> Result<()> {
        canonical::die(self.store(), group, replacement)
    }

    /// Reconcile one group. `None` when the group does not exist.
    pub fn garbage_collect(&self, id: &CanonicalId) -> Result<Option<GcOutcome>> {
        canonical::garbage_collect_by_id(self.store(), id)
    }

    pub fn garbage_collect_all(&self) -> Result<SweepReport> {
        canonical::garbage_collect_all(self.store())
    }

    pub fn garbage_collect_all_with(&self, cancel: &AtomicBool) -> Result<SweepReport> {
        canonical::garbage_collect_all_with(self.store(), cancel)
    }

    pub fn deep_delete(&self, key: &SourceKey) -> Result<DeletedRecord> {
        query::deep_delete(self.store(), key)
    }

    /// Follow tombstones from a possibly retired group id to its current successor.
    pub fn resolve_canonical(&self, id: &CanonicalId) -> Result<Option<CanonicalId>> {
        TombstoneLedger::new(self.store()).resolve(id)
    }

    pub fn tombstone_chain(&self, id: &CanonicalId) -> Result<Vec<Tombstone>> {
        TombstoneLedger::new(self.store()).chain(id)
    }

    pub fn audit(&self) -> Result<AuditReport> {
        audit::audit(self.store())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.stats()?)
    }

    pub fn flush(&self) -> Result<()> {
        Ok(self.store.flush()?)
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        Ok(self.store.checkpoint(path.as_ref())?)
    }
}
