//! # Query Module
//!
//! Sibling lookup and cascading local deletion.

use crate::canonical::die;
use crate::error::{BugdexError, EntityKind, Result};
use crate::model::{CanonicalId, RecordRef, SourceKey, UniversalId, UniversalRecord};
use crate::registry::{lookup_by_source, resolve};
use crate::store::BugStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Every other record in the same canonical group as `reference`.
///
/// Reads index (b), which may lag the latest writes. The sequence is lazy and can
/// be re-requested at any time.
pub fn related_bugs<'a>(
    store: &'a dyn BugStore,
    reference: &RecordRef,
) -> Result<impl Iterator<Item = Result<UniversalRecord>> + 'a> {
    let record = resolve(store, reference)?;
    let own_id = record.universal_id;
    let siblings = store
        .universal_by_canonical(&record.canonical_id)?
        .filter(move |item| !matches!(item, Ok(sibling) if sibling.universal_id == own_id))
        .map(|item| item.map_err(BugdexError::from));
    Ok(siblings)
}

/// What `deep_delete` removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRecord {
    pub key: SourceKey,
    pub universal_id: Option<UniversalId>,
    pub canonical_id: Option<CanonicalId>,
    /// The group lost its last member and was retired.
    pub group_removed: bool,
}

/// Remove a source record and its universal record from local bookkeeping.
///
/// The group shrinks by one, or is retired without a successor when no other
/// record belongs to it. Nothing is deleted in the originating system.
pub fn deep_delete(store: &dyn BugStore, key: &SourceKey) -> Result<DeletedRecord> {
    let record = match lookup_by_source(store, key)? {
        Some(record) => Some(record),
        None => match store.get_source_record(key)? {
            Some(source) => store.get_universal(&source.universal_id)?,
            None => return Err(BugdexError::not_found(EntityKind::SourceRecord, key)),
        },
    };

    let Some(record) = record else {
        store.delete_source_record(key)?;
        info!(source = %key, "deleted source record without universal record");
        return Ok(DeletedRecord {
            key: key.clone(),
            universal_id: None,
            canonical_id: None,
            group_removed: false,
        });
    };

    let group = store.get_group(&record.canonical_id)?;
    store.delete_source_record(key)?;
    store.delete_universal(&record.universal_id)?;

    let mut group_removed = false;
    match group {
        None => warn!(
            universal = %record.universal_id,
            canonical = %record.canonical_id,
            "deleted record pointed at a missing group"
        ),
        Some(group) => {
            let gone = BTreeSet::from([record.universal_id.clone()]);
            let cache_empty = group.other_representations.is_subset(&gone);
            if cache_empty && store.universal_by_canonical(&group.id)?.next().is_none() {
                die(store, &group, None)?;
                group_removed = true;
            } else {
                store.remove_representations(&group.id, &gone)?;
            }
        }
    }

    info!(
        source = %key,
        universal = %record.universal_id,
        canonical = %record.canonical_id,
        group_removed,
        "deep deleted record"
    );
    Ok(DeletedRecord {
        key: key.clone(),
        universal_id: Some(record.universal_id),
        canonical_id: Some(record.canonical_id),
        group_removed,
    })
}
