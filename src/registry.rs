//! # Universal Record Registry
//!
//! Gives every source-specific record a universal identity and maps it to its
//! current canonical group.
//!
//! `propose` is the entry point adapters call whenever they observe a record.
//! It never overwrites an existing universal record; instead it heals the
//! group side of the pair, so calling it again after a crash or a concurrent
//! merge repairs whatever the previous writer left half done.

use crate::error::{BugdexError, EntityKind, Result};
use crate::model::{
    CanonicalGroup, CanonicalId, RecordRef, SourceKey, SourceObservation, SourceRecord,
    UniversalId, UniversalRecord,
};
use crate::store::BugStore;
use crate::tombstone::TombstoneLedger;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Create the universal record for `universal_id` if it does not exist, or heal
/// the group of the existing one.
///
/// For a new record, the group is written before the record. When
/// `canonical_id` names an existing group the record joins it; a retired id is
/// first resolved through the tombstone ledger.
pub fn propose(
    store: &dyn BugStore,
    universal_id: &UniversalId,
    source_key: &SourceKey,
    canonical_id: Option<&CanonicalId>,
) -> Result<UniversalRecord> {
    if let Some(existing) = store.get_universal(universal_id)? {
        if existing.source_key() != *source_key {
            warn!(
                universal = %universal_id,
                stored = %existing.source_key(),
                proposed = %source_key,
                "proposed provenance differs from stored record"
            );
        }
        return heal(store, existing);
    }

    let canonical_id = match canonical_id {
        Some(requested) => target_group(store, requested)?,
        None => CanonicalId::generate(),
    };

    store.add_representations(&canonical_id, &BTreeSet::from([universal_id.clone()]))?;
    let record = UniversalRecord::new(universal_id.clone(), canonical_id, source_key.clone());
    store.put_universal(&record)?;
    info!(
        universal = %record.universal_id,
        canonical = %record.canonical_id,
        source = %source_key,
        "proposed new universal record"
    );
    Ok(record)
}

/// Pick the group a new record proposed with an explicit canonical id lands in.
fn target_group(store: &dyn BugStore, requested: &CanonicalId) -> Result<CanonicalId> {
    match TombstoneLedger::new(store).successor(requested)? {
        Some(current) => {
            if current != *requested {
                debug!(requested = %requested, current = %current, "requested group was retired");
            }
            Ok(current)
        }
        None => {
            let fresh = CanonicalId::generate();
            warn!(
                requested = %requested,
                fresh = %fresh,
                "requested group was retired without successor, starting a new group"
            );
            Ok(fresh)
        }
    }
}

/// Make sure the record's group exists and lists the record.
///
/// If the group row is gone the record is moved to the successor named by the
/// tombstone chain, or into a fresh group when the chain ends without one or
/// loops back on itself.
fn heal(store: &dyn BugStore, mut record: UniversalRecord) -> Result<UniversalRecord> {
    let member = BTreeSet::from([record.universal_id.clone()]);

    if let Some(group) = store.get_group(&record.canonical_id)? {
        if !group.has_member(&record.universal_id) {
            debug!(
                universal = %record.universal_id,
                canonical = %group.id,
                "re-adding record to its group's representations"
            );
            store.add_representations(&group.id, &member)?;
        }
        return Ok(record);
    }

    let successor = match TombstoneLedger::new(store).successor(&record.canonical_id)? {
        Some(successor) => successor,
        None => CanonicalId::generate(),
    };
    warn!(
        universal = %record.universal_id,
        missing = %record.canonical_id,
        successor = %successor,
        "record pointed at a missing group, re-anchoring"
    );
    store.add_representations(&successor, &member)?;
    if successor != record.canonical_id {
        store.set_canonical(&record.universal_id, &successor)?;
        record.canonical_id = successor;
    }
    Ok(record)
}

/// Index (a) lookup. Absence is not an error.
pub fn lookup_by_source(store: &dyn BugStore, key: &SourceKey) -> Result<Option<UniversalRecord>> {
    Ok(store.universal_by_source(key)?)
}

/// Current universal record for a record reference.
pub fn resolve(store: &dyn BugStore, reference: &RecordRef) -> Result<UniversalRecord> {
    match reference {
        RecordRef::Universal(id) => store
            .get_universal(id)?
            .ok_or_else(|| BugdexError::not_found(EntityKind::UniversalRecord, id)),
        RecordRef::Source(key) => lookup_by_source(store, key)?
            .ok_or_else(|| BugdexError::not_found(EntityKind::UniversalRecord, key)),
    }
}

/// The canonical group a record currently belongs to.
pub fn canonical_group_of(store: &dyn BugStore, reference: &RecordRef) -> Result<CanonicalGroup> {
    let record = resolve(store, reference)?;
    store
        .get_group(&record.canonical_id)?
        .ok_or_else(|| BugdexError::not_found(EntityKind::CanonicalGroup, &record.canonical_id))
}

/// Store an observed source record and propose its universal record.
///
/// The universal id of an earlier observation is reused: first from the stored
/// source row, then from index (a), otherwise a new one is generated.
pub fn ingest(
    store: &dyn BugStore,
    observation: SourceObservation,
    canonical_id: Option<&CanonicalId>,
) -> Result<UniversalRecord> {
    let universal_id = match store.get_source_record(&observation.key)? {
        Some(existing) => existing.universal_id,
        None => match lookup_by_source(store, &observation.key)? {
            Some(record) => record.universal_id,
            None => UniversalId::generate(),
        },
    };

    let source_record = SourceRecord {
        key: observation.key,
        universal_id: universal_id.clone(),
        attributes: observation.attributes,
    };
    store.put_source_record(&source_record)?;
    propose(store, &universal_id, &source_record.key, canonical_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn jira(id: &str) -> SourceKey {
        SourceKey::new("jira", id)
    }

    #[test]
    fn propose_creates_group_then_record() {
        let store = MemoryStore::new();
        let record = propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();

        let group = store.get_group(&record.canonical_id).unwrap().unwrap();
        assert!(group.has_member(&"u1".into()));
        assert_eq!(store.stats().unwrap().canonical_groups, 1);
    }

    #[test]
    fn propose_is_idempotent() {
        let store = MemoryStore::new();
        let first = propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();
        let second = propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.stats().unwrap().canonical_groups, 1);
        assert_eq!(store.stats().unwrap().universal_records, 1);
    }

    #[test]
    fn propose_ignores_canonical_argument_for_existing_record() {
        let store = MemoryStore::new();
        let first = propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();
        let again = propose(&store, &"u1".into(), &jira("J-1"), Some(&"other".into())).unwrap();
        assert_eq!(again.canonical_id, first.canonical_id);
        assert!(store.get_group(&"other".into()).unwrap().is_none());
    }

    #[test]
    fn propose_uses_supplied_canonical_id() {
        let store = MemoryStore::new();
        let record = propose(&store, &"u1".into(), &jira("J-1"), Some(&"c1".into())).unwrap();
        assert_eq!(record.canonical_id, CanonicalId::from("c1"));
    }

    #[test]
    fn propose_into_existing_group_joins_it() {
        let store = MemoryStore::new();
        propose(&store, &"u1".into(), &jira("J-1"), Some(&"c1".into())).unwrap();
        propose(&store, &"u2".into(), &jira("J-2"), Some(&"c1".into())).unwrap();

        let group = store.get_group(&"c1".into()).unwrap().unwrap();
        assert_eq!(group.other_representations.len(), 2);
    }

    #[test]
    fn propose_into_retired_group_follows_tombstone() {
        let store = MemoryStore::new();
        propose(&store, &"u1".into(), &jira("J-1"), Some(&"live".into())).unwrap();
        TombstoneLedger::new(&store)
            .record(&"old".into(), Some(&"live".into()))
            .unwrap();

        let record = propose(&store, &"u2".into(), &jira("J-2"), Some(&"old".into())).unwrap();
        assert_eq!(record.canonical_id, CanonicalId::from("live"));
        assert!(store.get_group(&"old".into()).unwrap().is_none());
    }

    #[test]
    fn propose_heals_missing_membership() {
        let store = MemoryStore::new();
        let record = propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();
        store
            .remove_representations(&record.canonical_id, &BTreeSet::from(["u1".into()]))
            .unwrap();

        propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();
        let group = store.get_group(&record.canonical_id).unwrap().unwrap();
        assert!(group.has_member(&"u1".into()));
    }

    #[test]
    fn propose_reanchors_record_whose_group_was_retired() {
        let store = MemoryStore::new();
        let record = propose(&store, &"u1".into(), &jira("J-1"), Some(&"c1".into())).unwrap();
        store.put_group(&CanonicalGroup::new("c2".into())).unwrap();
        TombstoneLedger::new(&store)
            .record(&record.canonical_id, Some(&"c2".into()))
            .unwrap();
        store.delete_group(&record.canonical_id).unwrap();

        let healed = propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();
        assert_eq!(healed.canonical_id, CanonicalId::from("c2"));
        let stored = store.get_universal(&"u1".into()).unwrap().unwrap();
        assert_eq!(stored.canonical_id, CanonicalId::from("c2"));
        assert!(store
            .get_group(&"c2".into())
            .unwrap()
            .unwrap()
            .has_member(&"u1".into()));
    }

    #[test]
    fn propose_reanchors_into_fresh_group_when_chain_has_no_successor() {
        let store = MemoryStore::new();
        propose(&store, &"u1".into(), &jira("J-1"), Some(&"c1".into())).unwrap();
        TombstoneLedger::new(&store).record(&"c1".into(), None).unwrap();
        store.delete_group(&"c1".into()).unwrap();

        let healed = propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();
        assert_ne!(healed.canonical_id, CanonicalId::from("c1"));
        assert!(store
            .get_group(&healed.canonical_id)
            .unwrap()
            .unwrap()
            .has_member(&"u1".into()));
    }

    #[test]
    fn propose_reanchors_record_stuck_behind_cyclic_tombstones() {
        let store = MemoryStore::new();
        propose(&store, &"u1".into(), &jira("J-1"), Some(&"a".into())).unwrap();
        let ledger = TombstoneLedger::new(&store);
        ledger.record(&"a".into(), Some(&"b".into())).unwrap();
        ledger.record(&"b".into(), Some(&"a".into())).unwrap();
        store.delete_group(&"a".into()).unwrap();

        let healed = propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();
        assert_ne!(healed.canonical_id, CanonicalId::from("a"));
        assert_ne!(healed.canonical_id, CanonicalId::from("b"));
        assert!(store
            .get_group(&healed.canonical_id)
            .unwrap()
            .unwrap()
            .has_member(&"u1".into()));

        let joined = propose(&store, &"u2".into(), &jira("J-2"), Some(&"b".into())).unwrap();
        assert_ne!(joined.canonical_id, CanonicalId::from("b"));
    }

    #[test]
    fn lookup_by_source_absent_is_none() {
        let store = MemoryStore::new();
        assert!(lookup_by_source(&store, &jira("nope")).unwrap().is_none());
    }

    #[test]
    fn resolve_accepts_both_reference_kinds() {
        let store = MemoryStore::new();
        propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();

        let by_id = resolve(&store, &RecordRef::Universal("u1".into())).unwrap();
        let by_source = resolve(&store, &RecordRef::Source(jira("J-1"))).unwrap();
        assert_eq!(by_id, by_source);

        let err = resolve(&store, &RecordRef::Source(jira("J-9"))).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn canonical_group_of_reports_missing_group() {
        let store = MemoryStore::new();
        let record = propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();
        let group = canonical_group_of(&store, &RecordRef::Universal("u1".into())).unwrap();
        assert_eq!(group.id, record.canonical_id);

        store.delete_group(&record.canonical_id).unwrap();
        let err = canonical_group_of(&store, &RecordRef::Universal("u1".into())).unwrap_err();
        assert!(matches!(
            err,
            BugdexError::NotFound {
                kind: EntityKind::CanonicalGroup,
                ..
            }
        ));
    }

    #[test]
    fn ingest_reuses_universal_id_across_observations() {
        let store = MemoryStore::new();
        let first = ingest(
            &store,
            SourceObservation::new("jira", "10042").with_attribute("summary", "first"),
            None,
        )
        .unwrap();
        let second = ingest(
            &store,
            SourceObservation::new("jira", "10042").with_attribute("summary", "edited"),
            None,
        )
        .unwrap();

        assert_eq!(first.universal_id, second.universal_id);
        let stored = store.get_source_record(&jira("10042")).unwrap().unwrap();
        assert_eq!(stored.attributes["summary"], "edited");
        assert_eq!(store.stats().unwrap().canonical_groups, 1);
    }

    #[test]
    fn ingest_reuses_universal_id_from_source_index() {
        let store = MemoryStore::new();
        propose(&store, &"u1".into(), &jira("J-1"), None).unwrap();
        let record = ingest(&store, SourceObservation::new("jira", "J-1"), None).unwrap();
        assert_eq!(record.universal_id, UniversalId::from("u1"));
    }
}
