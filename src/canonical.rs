//! # Canonical Group Store
//!
//! Merging, retiring and reconciling canonical groups.
//!
//! The universal records' `canonical_id` pointers form a union-find parent
//! relation that lives in the store. `merge` is the union. Nothing here takes a
//! lock across entities: every step is a single-item write, so a crash or a race
//! can leave a group's cached `other_representations` disagreeing with the
//! pointers. `garbage_collect` is the out-of-band pass that notices the
//! disagreement and retires the stale group, the way path compression shortens
//! chains in an in-memory union-find.

use crate::error::{BugdexError, EntityKind, Result};
use crate::model::{CanonicalGroup, CanonicalId, UniversalId, UniversalRecord};
use crate::store::BugStore;
use crate::tombstone::TombstoneLedger;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

/// Fold `absorb` into `keep`. `keep` survives, `absorb` is retired.
///
/// Records named in `absorb`'s cached set are repointed, as are any records the
/// canonical index still lists under `absorb`. Cached ids without a record are
/// skipped and do not follow into `keep`.
#[instrument(skip_all, fields(keep = %keep.id, absorb = %absorb.id), level = "debug")]
pub fn merge(store: &dyn BugStore, keep: &CanonicalGroup, absorb: &CanonicalGroup) -> Result<()> {
    if keep.id == absorb.id {
        return Ok(());
    }

    let mut moved: BTreeSet<UniversalId> = absorb.other_representations.clone();
    let indexed: Vec<UniversalRecord> = store
        .universal_by_canonical(&absorb.id)?
        .collect::<anyhow::Result<_>>()?;
    moved.extend(indexed.into_iter().map(|record| record.universal_id));

    let mut repointed = BTreeSet::new();
    for universal_id in moved {
        if store.set_canonical(&universal_id, &keep.id)? {
            repointed.insert(universal_id);
        } else {
            debug!(universal = %universal_id, "no record for cached representation, skipping");
        }
    }

    if !repointed.is_empty() {
        store.add_representations(&keep.id, &repointed)?;
    }

    let count = repointed.len();
    let absorbed = CanonicalGroup {
        id: absorb.id.clone(),
        other_representations: repointed,
        former_canonical_representations: absorb.former_canonical_representations.clone(),
    };
    die(store, &absorbed, Some(keep))?;
    info!(repointed = count, "merged canonical groups");
    Ok(())
}

/// Retire `group`, optionally handing its history and members to `replacement`.
///
/// The tombstone is written first, so anyone who sees `group`'s members show up
/// in the replacement can already resolve `group` to it. Safe to retry: the
/// replacement only ever gains set members, the tombstone is write-once, and
/// deleting an absent group row is a no-op.
pub fn die(
    store: &dyn BugStore,
    group: &CanonicalGroup,
    replacement: Option<&CanonicalGroup>,
) -> Result<()> {
    retire(store, group, replacement).map(|_| ())
}

/// `die`, reporting whether the group was actually retired. A group is kept
/// when the replacement is the group itself or already leads back to it.
fn retire(
    store: &dyn BugStore,
    group: &CanonicalGroup,
    replacement: Option<&CanonicalGroup>,
) -> Result<bool> {
    if replacement.is_some_and(|replacement| replacement.id == group.id) {
        debug!(group = %group.id, "refusing to retire a group into itself");
        return Ok(false);
    }

    let ledger = TombstoneLedger::new(store);
    if let Some(replacement) = replacement {
        // The replacement may itself have been retired into `group` meanwhile.
        if ledger.successor(&replacement.id)?.as_ref() == Some(&group.id) {
            warn!(
                group = %group.id,
                replacement = %replacement.id,
                "replacement was already retired into this group, keeping it"
            );
            return Ok(false);
        }
    }

    ledger.record(&group.id, replacement.map(|r| &r.id))?;
    if let Some(replacement) = replacement {
        let mut formers = group.former_canonical_representations.clone();
        formers.insert(group.id.clone());
        store.add_former_representations(&replacement.id, &formers)?;
        if !group.other_representations.is_empty() {
            store.add_representations(&replacement.id, &group.other_representations)?;
        }
    }
    store.delete_group(&group.id)?;
    debug!(
        group = %group.id,
        replacement = ?replacement.map(|r| r.id.as_str()),
        "retired canonical group"
    );
    Ok(true)
}

/// Why a group was retired by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetireCause {
    /// A cached member has no universal record.
    DanglingMember(UniversalId),
    /// A cached member points at another group.
    StaleMember(UniversalId),
    /// Empty cache and no record points at the group.
    Orphaned,
}

/// Result of reconciling one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcOutcome {
    Consistent,
    Retired {
        replacement: Option<CanonicalId>,
        cause: RetireCause,
    },
    /// The group stays, but stale pointers were compressed or the cache was
    /// refilled from index (b).
    Repaired { repointed: usize, added: usize },
    /// A member points elsewhere but its target could not be found; left for a
    /// later sweep.
    Deferred {
        universal_id: UniversalId,
        points_to: CanonicalId,
    },
}

/// Check one cached member against its authoritative pointer.
fn check_member(
    store: &dyn BugStore,
    group: &CanonicalGroup,
    universal_id: &UniversalId,
) -> Result<UniversalRecord> {
    let record = store
        .get_universal(universal_id)?
        .ok_or_else(|| BugdexError::not_found(EntityKind::UniversalRecord, universal_id))?;
    if record.canonical_id != group.id {
        return Err(BugdexError::StaleReference {
            group: group.id.clone(),
            universal_id: universal_id.clone(),
            points_to: record.canonical_id,
        });
    }
    Ok(record)
}

/// The group a stale member now belongs to: wherever the tombstone chain from
/// its pointer target leads, or the target itself when that row still exists.
///
/// A group being retired keeps its row until after its members reach the
/// replacement, so the tombstone is consulted before the row.
fn successor_of(store: &dyn BugStore, points_to: &CanonicalId) -> Result<Option<CanonicalGroup>> {
    if let Some(group) = TombstoneLedger::new(store).resolve_live(points_to)? {
        return Ok(Some(group));
    }
    Ok(store.get_group(points_to)?)
}

/// Reconcile one group against the pointers of its cached members.
///
/// A member without a record retires the whole group with no successor: a group
/// whose anchoring records cannot all be accounted for is not trusted. A member
/// that points elsewhere retires the group into that member's current group.
/// Returns after the first retirement. A surviving group has its cache refilled
/// with any record index (b) lists under it.
#[instrument(skip_all, fields(group = %group.id), level = "debug")]
pub fn garbage_collect(store: &dyn BugStore, group: &CanonicalGroup) -> Result<GcOutcome> {
    let mut repointed = 0usize;
    for universal_id in &group.other_representations {
        match check_member(store, group, universal_id) {
            Ok(_) => continue,
            Err(BugdexError::NotFound { .. }) => {
                warn!(universal = %universal_id, "dangling representation, retiring group");
                die(store, group, None)?;
                return Ok(GcOutcome::Retired {
                    replacement: None,
                    cause: RetireCause::DanglingMember(universal_id.clone()),
                });
            }
            Err(BugdexError::StaleReference { points_to, .. }) => {
                match successor_of(store, &points_to)? {
                    Some(target) if target.id == group.id => {
                        // The record points at a group that was merged into this one.
                        debug!(universal = %universal_id, via = %points_to, "compressing pointer");
                        store.set_canonical(universal_id, &group.id)?;
                        repointed += 1;
                    }
                    Some(target) => {
                        info!(
                            universal = %universal_id,
                            replacement = %target.id,
                            "stale group, retiring into member's current group"
                        );
                        if !retire(store, group, Some(&target))? {
                            return Ok(GcOutcome::Deferred {
                                universal_id: universal_id.clone(),
                                points_to,
                            });
                        }
                        return Ok(GcOutcome::Retired {
                            replacement: Some(target.id),
                            cause: RetireCause::StaleMember(universal_id.clone()),
                        });
                    }
                    None => {
                        warn!(
                            universal = %universal_id,
                            points_to = %points_to,
                            "member points at a group that cannot be found, deferring"
                        );
                        return Ok(GcOutcome::Deferred {
                            universal_id: universal_id.clone(),
                            points_to,
                        });
                    }
                }
            }
            Err(other) => return Err(other),
        }
    }

    let indexed: Vec<UniversalRecord> = store
        .universal_by_canonical(&group.id)?
        .collect::<anyhow::Result<_>>()?;
    if indexed.is_empty() && group.other_representations.is_empty() {
        info!("orphaned group, retiring");
        die(store, group, None)?;
        return Ok(GcOutcome::Retired {
            replacement: None,
            cause: RetireCause::Orphaned,
        });
    }

    let missing: BTreeSet<UniversalId> = indexed
        .into_iter()
        .map(|record| record.universal_id)
        .filter(|universal_id| !group.has_member(universal_id))
        .collect();
    if !missing.is_empty() {
        debug!(added = missing.len(), "refilling cached representations from index");
        store.add_representations(&group.id, &missing)?;
    }

    if repointed > 0 || !missing.is_empty() {
        return Ok(GcOutcome::Repaired {
            repointed,
            added: missing.len(),
        });
    }
    Ok(GcOutcome::Consistent)
}

/// A group whose reconciliation failed during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub group: CanonicalId,
    pub error: String,
}

/// Tally of one `garbage_collect_all` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub consistent: usize,
    pub retired_with_successor: usize,
    pub retired_without_successor: usize,
    pub repaired: usize,
    pub deferred: usize,
    /// Listed by the scan but already gone when loaded.
    pub vanished: usize,
    /// Not started because the sweep was cancelled.
    pub skipped: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn retired(&self) -> usize {
        self.retired_with_successor + self.retired_without_successor
    }

    pub fn is_clean(&self) -> bool {
        self.retired() == 0 && self.repaired == 0 && self.deferred == 0 && self.failures.is_empty()
    }

    fn tally(&mut self, group: CanonicalId, outcome: Option<Result<Option<GcOutcome>>>) {
        let Some(outcome) = outcome else {
            self.skipped += 1;
            return;
        };
        self.scanned += 1;
        match outcome {
            Ok(None) => self.vanished += 1,
            Ok(Some(GcOutcome::Consistent)) => self.consistent += 1,
            Ok(Some(GcOutcome::Retired {
                replacement: Some(_),
                ..
            })) => self.retired_with_successor += 1,
            Ok(Some(GcOutcome::Retired {
                replacement: None, ..
            })) => self.retired_without_successor += 1,
            Ok(Some(GcOutcome::Repaired { .. })) => self.repaired += 1,
            Ok(Some(GcOutcome::Deferred { .. })) => self.deferred += 1,
            Err(err) => self.failures.push(SweepFailure {
                group,
                error: err.to_string(),
            }),
        }
    }
}

/// Load a group by id and reconcile it. `None` when the group no longer exists.
pub fn garbage_collect_by_id(store: &dyn BugStore, id: &CanonicalId) -> Result<Option<GcOutcome>> {
    match store.get_group(id)? {
        Some(group) => garbage_collect(store, &group).map(Some),
        None => Ok(None),
    }
}

/// Reconcile every live group.
pub fn garbage_collect_all(store: &dyn BugStore) -> Result<SweepReport> {
    garbage_collect_all_with(store, &AtomicBool::new(false))
}

/// Reconcile every live group in parallel on the current rayon pool.
///
/// Groups are independent, so they are processed without coordination. Once
/// `cancel` is set no further group is started; per-group failures are reported
/// rather than aborting the sweep.
pub fn garbage_collect_all_with(store: &dyn BugStore, cancel: &AtomicBool) -> Result<SweepReport> {
    let ids = store.group_ids()?;
    let outcomes: Vec<(CanonicalId, Option<Result<Option<GcOutcome>>>)> = ids
        .into_par_iter()
        .map(|id| {
            if cancel.load(Ordering::Relaxed) {
                return (id, None);
            }
            let outcome = garbage_collect_by_id(store, &id);
            (id, Some(outcome))
        })
        .collect();

    let mut report = SweepReport::default();
    for (id, outcome) in outcomes {
        report.tally(id, outcome);
    }
    for failure in &report.failures {
        warn!(group = %failure.group, error = %failure.error, "group reconciliation failed");
    }
    Ok(report)
}
