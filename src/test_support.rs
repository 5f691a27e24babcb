use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

use crate::canonical::{garbage_collect_all, merge};
use crate::error::{BugdexError, Result};
use crate::model::{
    CanonicalGroup, CanonicalId, SourceKey, SourceObservation, UniversalId, UniversalRecord,
};
use crate::query::deep_delete;
use crate::registry::{canonical_group_of, ingest, propose};
use crate::store::BugStore;

pub const SOURCES: [&str; 4] = ["jira", "github", "snyk", "sonarqube"];

pub fn observation(source: &str, id: impl Into<String>) -> SourceObservation {
    SourceObservation::new(source, id)
        .with_attribute("summary", "SQL injection in search endpoint")
        .with_attribute("severity", "high")
}

/// Propose `groups` groups named `g{i}` with `members` records `u{i}-{j}` each.
pub fn seed_groups(store: &dyn BugStore, groups: usize, members: usize) -> Result<Vec<CanonicalId>> {
    let mut ids = Vec::with_capacity(groups);
    for i in 0..groups {
        let canonical_id = CanonicalId::new(format!("g{i}"));
        for j in 0..members {
            let source = SOURCES[j % SOURCES.len()];
            propose(
                store,
                &UniversalId::new(format!("u{i}-{j}")),
                &SourceKey::new(source, format!("{i}-{j}")),
                Some(&canonical_id),
            )?;
        }
        ids.push(canonical_id);
    }
    Ok(ids)
}

/// A group whose only cached member has no universal record.
pub fn inject_orphan_group(store: &dyn BugStore, id: &str) -> Result<CanonicalGroup> {
    let group = CanonicalGroup::with_member(CanonicalId::new(id), UniversalId::new(format!("{id}-ghost")));
    store.put_group(&group)?;
    Ok(group)
}

/// Add a member id without a backing record to an existing group.
pub fn inject_dangling_member(store: &dyn BugStore, group: &CanonicalId, member: &str) -> Result<()> {
    store.add_representations(group, &BTreeSet::from([UniversalId::new(member)]))?;
    Ok(())
}

/// List `member` in `group`'s cache while its record belongs to another group.
///
/// A missing record is first proposed into `home`. Returns the record as it
/// stands; its group is never `group`.
pub fn inject_stale_cache_entry(
    store: &dyn BugStore,
    group: &CanonicalId,
    member: &UniversalId,
    home: &CanonicalId,
) -> Result<UniversalRecord> {
    let record = match store.get_universal(member)? {
        Some(record) => record,
        None => propose(
            store,
            member,
            &SourceKey::new(SOURCES[0], member.as_str()),
            Some(home),
        )?,
    };
    if record.canonical_id == *group {
        return Err(BugdexError::InvalidReference(format!(
            "{member} already belongs to {group}"
        )));
    }
    store.add_representations(group, &BTreeSet::from([member.clone()]))?;
    Ok(record)
}

/// A merge that crashed after repointing `absorb`'s members, before the keeper's
/// cache was updated and before `absorb` was retired.
pub fn inject_interrupted_merge(
    store: &dyn BugStore,
    keep: &CanonicalId,
    absorb: &CanonicalId,
) -> Result<()> {
    if let Some(group) = store.get_group(absorb)? {
        for member in &group.other_representations {
            store.set_canonical(member, keep)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub records: usize,
    pub merge_probability: f64,
    pub delete_probability: f64,
    /// Share of merges that stop half way.
    pub crash_probability: f64,
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            records: 200,
            merge_probability: 0.3,
            delete_probability: 0.05,
            crash_probability: 0.2,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadSummary {
    pub ingested: usize,
    pub merged: usize,
    pub interrupted: usize,
    pub deleted: usize,
}

/// Seeded mix of ingests, merges, interrupted merges and deletes.
pub fn run_random_workload(store: &dyn BugStore, config: &WorkloadConfig) -> Result<WorkloadSummary> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut summary = WorkloadSummary::default();
    let mut live: Vec<SourceKey> = Vec::new();

    for i in 0..config.records {
        let source = SOURCES[rng.random_range(0..SOURCES.len())];
        let record = ingest(store, observation(source, format!("{i:06}")), None)?;
        live.push(record.source_key());
        summary.ingested += 1;

        if live.len() >= 2 && rng.random_bool(config.merge_probability) {
            let keep = live[rng.random_range(0..live.len())].clone();
            let absorb = live[rng.random_range(0..live.len())].clone();
            let (Ok(keep), Ok(absorb)) = (
                canonical_group_of(store, &keep.into()),
                canonical_group_of(store, &absorb.into()),
            ) else {
                continue;
            };
            if rng.random_bool(config.crash_probability) {
                inject_interrupted_merge(store, &keep.id, &absorb.id)?;
                summary.interrupted += 1;
            } else {
                merge(store, &keep, &absorb)?;
                summary.merged += 1;
            }
        }

        if !live.is_empty() && rng.random_bool(config.delete_probability) {
            let key = live.swap_remove(rng.random_range(0..live.len()));
            deep_delete(store, &key)?;
            summary.deleted += 1;
        }
    }
    Ok(summary)
}

/// Propose every universal record again, as adapters re-observing their sources would.
pub fn reobserve_all(store: &dyn BugStore) -> Result<usize> {
    let mut count = 0;
    for universal_id in store.universal_ids()? {
        if let Some(record) = store.get_universal(&universal_id)? {
            propose(store, &universal_id, &record.source_key(), None)?;
            count += 1;
        }
    }
    Ok(count)
}

/// Alternate sweeps and re-observation until a sweep changes nothing.
/// Returns the number of sweeps run, or `None` if `max_sweeps` was not enough.
pub fn converge(store: &dyn BugStore, max_sweeps: usize) -> Result<Option<usize>> {
    for sweep in 1..=max_sweeps {
        reobserve_all(store)?;
        if garbage_collect_all(store)?.is_clean() {
            return Ok(Some(sweep));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{audit, Violation};
    use crate::store::MemoryStore;

    #[test]
    fn stale_cache_entry_creates_record_in_home_group() {
        let store = MemoryStore::new();
        let groups = seed_groups(&store, 2, 1).unwrap();

        let record =
            inject_stale_cache_entry(&store, &groups[1], &"fresh".into(), &groups[0]).unwrap();
        assert_eq!(record.canonical_id, groups[0]);

        let report = audit(&store).unwrap();
        assert_eq!(
            report.violations,
            vec![Violation::StaleCacheEntry {
                canonical_id: groups[1].clone(),
                universal_id: "fresh".into(),
                points_to: groups[0].clone(),
            }]
        );
    }

    #[test]
    fn stale_cache_entry_rejects_member_of_same_group() {
        let store = MemoryStore::new();
        let groups = seed_groups(&store, 1, 1).unwrap();
        let err = inject_stale_cache_entry(&store, &groups[0], &"u0-0".into(), &groups[0])
            .unwrap_err();
        assert!(matches!(err, BugdexError::InvalidReference(_)));
        assert!(audit(&store).unwrap().is_clean());
    }
}
