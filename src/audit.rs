//! Read-only consistency audit.
//!
//! Reports every place where the cached group membership and the authoritative
//! record pointers disagree. Nothing is repaired here; `garbage_collect` and
//! `propose` healing do that.

use crate::error::Result;
use crate::model::{CanonicalId, UniversalId};
use crate::store::BugStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One disagreement between pointers and caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// A record points at a group that does not exist.
    DanglingPointer {
        universal_id: UniversalId,
        canonical_id: CanonicalId,
        /// A tombstone exists for the missing group.
        retired: bool,
    },
    /// A record's group exists but does not list it.
    MissingFromCache {
        universal_id: UniversalId,
        canonical_id: CanonicalId,
    },
    /// A group lists a record that points elsewhere.
    StaleCacheEntry {
        canonical_id: CanonicalId,
        universal_id: UniversalId,
        points_to: CanonicalId,
    },
    /// A group lists a record that does not exist.
    DanglingCacheEntry {
        canonical_id: CanonicalId,
        universal_id: UniversalId,
    },
    /// A group with no cached members and no record pointing at it.
    EmptyGroup { canonical_id: CanonicalId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub records_checked: usize,
    pub groups_checked: usize,
    pub violations: Vec<Violation>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Walk every record and every group and collect violations.
///
/// Concurrent writers can make a live system look briefly inconsistent; run it
/// against a quiesced store for exact results.
pub fn audit(store: &dyn BugStore) -> Result<AuditReport> {
    let mut report = AuditReport::default();

    for universal_id in store.universal_ids()? {
        let Some(record) = store.get_universal(&universal_id)? else {
            continue;
        };
        report.records_checked += 1;
        match store.get_group(&record.canonical_id)? {
            Some(group) if !group.has_member(&universal_id) => {
                report.violations.push(Violation::MissingFromCache {
                    universal_id,
                    canonical_id: record.canonical_id,
                })
            }
            Some(_) => {}
            None => {
                let retired = store.get_tombstone(&record.canonical_id)?.is_some();
                report.violations.push(Violation::DanglingPointer {
                    universal_id,
                    canonical_id: record.canonical_id,
                    retired,
                });
            }
        }
    }

    for canonical_id in store.group_ids()? {
        let Some(group) = store.get_group(&canonical_id)? else {
            continue;
        };
        report.groups_checked += 1;
        for universal_id in &group.other_representations {
            match store.get_universal(universal_id)? {
                Some(record) if record.canonical_id != canonical_id => {
                    report.violations.push(Violation::StaleCacheEntry {
                        canonical_id: canonical_id.clone(),
                        universal_id: universal_id.clone(),
                        points_to: record.canonical_id,
                    })
                }
                Some(_) => {}
                None => report.violations.push(Violation::DanglingCacheEntry {
                    canonical_id: canonical_id.clone(),
                    universal_id: universal_id.clone(),
                }),
            }
        }
        if group.other_representations.is_empty()
            && store.universal_by_canonical(&canonical_id)?.next().is_none()
        {
            report.violations.push(Violation::EmptyGroup { canonical_id });
        }
    }

    debug!(
        records = report.records_checked,
        groups = report.groups_checked,
        violations = report.violations.len(),
        "audit complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CanonicalGroup, SourceKey};
    use crate::registry::propose;
    use crate::store::MemoryStore;
    use std::collections::BTreeSet;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        propose(&store, &"u1".into(), &SourceKey::new("jira", "J-1"), Some(&"a".into())).unwrap();
        propose(&store, &"u2".into(), &SourceKey::new("jira", "J-2"), Some(&"a".into())).unwrap();
        store
    }

    #[test]
    fn consistent_store_is_clean() {
        let report = audit(&seeded()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.records_checked, 2);
        assert_eq!(report.groups_checked, 1);
    }

    #[test]
    fn reports_each_kind_of_drift() {
        let store = seeded();
        store
            .remove_representations(&"a".into(), &BTreeSet::from(["u2".into()]))
            .unwrap();
        store
            .put_group(&CanonicalGroup::with_member("b".into(), "ghost".into()))
            .unwrap();
        store
            .add_representations(&"b".into(), &BTreeSet::from(["u1".into()]))
            .unwrap();
        store.put_group(&CanonicalGroup::new("empty".into())).unwrap();

        let report = audit(&store).unwrap();
        assert!(report.violations.contains(&Violation::MissingFromCache {
            universal_id: "u2".into(),
            canonical_id: "a".into(),
        }));
        assert!(report.violations.contains(&Violation::DanglingCacheEntry {
            canonical_id: "b".into(),
            universal_id: "ghost".into(),
        }));
        assert!(report.violations.contains(&Violation::StaleCacheEntry {
            canonical_id: "b".into(),
            universal_id: "u1".into(),
            points_to: "a".into(),
        }));
        assert!(report.violations.contains(&Violation::EmptyGroup {
            canonical_id: "empty".into(),
        }));
        assert_eq!(report.violations.len(), 4);
    }

    #[test]
    fn reports_pointer_to_missing_group() {
        let store = seeded();
        store.delete_group(&"a".into()).unwrap();

        let report = audit(&store).unwrap();
        assert_eq!(report.violations.len(), 2);
        assert!(report.violations.iter().all(|violation| matches!(
            violation,
            Violation::DanglingPointer { retired: false, .. }
        )));
    }

    #[test]
    fn violations_serialize_with_kind_tag() {
        let json = serde_json::to_string(&Violation::EmptyGroup {
            canonical_id: "x".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"empty_group","canonical_id":"x"}"#);
    }
}
