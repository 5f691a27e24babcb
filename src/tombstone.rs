//! # Tombstone Ledger
//!
//! Write-once record of retired canonical groups. Following `replacement_id`
//! links from a stale group id leads to the group that absorbed it, which lets
//! old references be resolved long after the group itself was deleted.

use crate::config::DEFAULT_MAX_TOMBSTONE_HOPS;
use crate::error::{BugdexError, Result};
use crate::model::{CanonicalGroup, CanonicalId, Tombstone};
use crate::store::BugStore;
use tracing::{debug, warn};

/// Read/append view of the tombstone table.
pub struct TombstoneLedger<'a> {
    store: &'a dyn BugStore,
    max_hops: usize,
}

impl<'a> TombstoneLedger<'a> {
    pub fn new(store: &'a dyn BugStore) -> Self {
        Self::with_max_hops(store, DEFAULT_MAX_TOMBSTONE_HOPS)
    }

    pub fn with_max_hops(store: &'a dyn BugStore, max_hops: usize) -> Self {
        Self { store, max_hops }
    }

    /// Record that `id` was retired. A second retirement of the same id keeps the
    /// first tombstone.
    pub fn record(&self, id: &CanonicalId, replacement_id: Option<&CanonicalId>) -> Result<()> {
        let tombstone = Tombstone {
            id: id.clone(),
            replacement_id: replacement_id.cloned(),
        };
        if !self.store.put_tombstone(&tombstone)? {
            debug!(group = %id, "tombstone already present, keeping the original");
        }
        Ok(())
    }

    pub fn get(&self, id: &CanonicalId) -> Result<Option<Tombstone>> {
        Ok(self.store.get_tombstone(id)?)
    }

    pub fn is_retired(&self, id: &CanonicalId) -> Result<bool> {
        Ok(self.store.get_tombstone(id)?.is_some())
    }

    /// Follow the tombstone chain starting at `id`.
    ///
    /// Returns the first id without a tombstone (which is `id` itself when it was
    /// never retired), or `None` when the chain ends in a retirement without a
    /// successor. The returned id is not guaranteed to have a live group row.
    pub fn resolve(&self, id: &CanonicalId) -> Result<Option<CanonicalId>> {
        let mut current = id.clone();
        for _ in 0..=self.max_hops {
            match self.store.get_tombstone(&current)? {
                None => return Ok(Some(current)),
                Some(Tombstone {
                    replacement_id: None,
                    ..
                }) => return Ok(None),
                Some(Tombstone {
                    replacement_id: Some(next),
                    ..
                }) => current = next,
            }
        }
        Err(BugdexError::TombstoneCycle {
            id: id.clone(),
            hops: self.max_hops,
        })
    }

    /// Like `resolve`, but a cyclic chain counts as a retirement without a
    /// successor. Two groups retired into each other by racing sweeps leave
    /// such a cycle; callers re-anchoring records use this so they can recover.
    pub fn successor(&self, id: &CanonicalId) -> Result<Option<CanonicalId>> {
        match self.resolve(id) {
            Err(BugdexError::TombstoneCycle { hops, .. }) => {
                warn!(
                    group = %id,
                    hops,
                    "tombstone chain is cyclic, treating as retired without successor"
                );
                Ok(None)
            }
            other => other,
        }
    }

    /// Follow the chain from `id` with `successor` and load the live group it
    /// leads to, if any.
    pub fn resolve_live(&self, id: &CanonicalId) -> Result<Option<CanonicalGroup>> {
        match self.successor(id)? {
            Some(current) => Ok(self.store.get_group(&current)?),
            None => Ok(None),
        }
    }

    /// Every tombstone on the path from `id` to its current successor, oldest first.
    pub fn chain(&self, id: &CanonicalId) -> Result<Vec<Tombstone>> {
        let mut chain = Vec::new();
        let mut current = id.clone();
        while let Some(tombstone) = self.store.get_tombstone(&current)? {
            if chain.len() >= self.max_hops {
                return Err(BugdexError::TombstoneCycle {
                    id: id.clone(),
                    hops: self.max_hops,
                });
            }
            let next = tombstone.replacement_id.clone();
            chain.push(tombstone);
            match next {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn unretired_id_resolves_to_itself() {
        let store = MemoryStore::new();
        let ledger = TombstoneLedger::new(&store);
        let id = CanonicalId::from("live");
        assert_eq!(ledger.resolve(&id).unwrap(), Some(id.clone()));
        assert!(ledger.chain(&id).unwrap().is_empty());
        assert!(!ledger.is_retired(&id).unwrap());
    }

    #[test]
    fn chain_is_followed_to_the_last_successor() {
        let store = MemoryStore::new();
        let ledger = TombstoneLedger::new(&store);
        ledger.record(&"b".into(), Some(&"a".into())).unwrap();
        ledger.record(&"a".into(), Some(&"c".into())).unwrap();

        assert_eq!(ledger.resolve(&"b".into()).unwrap(), Some("c".into()));
        let chain = ledger.chain(&"b".into()).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, CanonicalId::from("b"));
        assert_eq!(chain[1].replacement_id, Some("c".into()));
    }

    #[test]
    fn retirement_without_successor_resolves_to_none() {
        let store = MemoryStore::new();
        let ledger = TombstoneLedger::new(&store);
        ledger.record(&"b".into(), Some(&"a".into())).unwrap();
        ledger.record(&"a".into(), None).unwrap();

        assert_eq!(ledger.resolve(&"b".into()).unwrap(), None);
        assert!(ledger.resolve_live(&"b".into()).unwrap().is_none());
        assert_eq!(ledger.chain(&"b".into()).unwrap().len(), 2);
    }

    #[test]
    fn second_retirement_keeps_first_tombstone() {
        let store = MemoryStore::new();
        let ledger = TombstoneLedger::new(&store);
        ledger.record(&"b".into(), Some(&"a".into())).unwrap();
        ledger.record(&"b".into(), None).unwrap();
        assert_eq!(
            ledger.get(&"b".into()).unwrap().unwrap().replacement_id,
            Some("a".into())
        );
    }

    #[test]
    fn cycles_are_reported() {
        let store = MemoryStore::new();
        let ledger = TombstoneLedger::with_max_hops(&store, 8);
        ledger.record(&"a".into(), Some(&"b".into())).unwrap();
        ledger.record(&"b".into(), Some(&"a".into())).unwrap();

        let err = ledger.resolve(&"a".into()).unwrap_err();
        assert!(matches!(err, BugdexError::TombstoneCycle { hops: 8, .. }));
        assert!(ledger.chain(&"a".into()).is_err());
    }

    #[test]
    fn cyclic_chain_has_no_successor() {
        let store = MemoryStore::new();
        store
            .put_group(&CanonicalGroup::with_member("a".into(), "u1".into()))
            .unwrap();
        let ledger = TombstoneLedger::with_max_hops(&store, 8);
        ledger.record(&"a".into(), Some(&"b".into())).unwrap();
        ledger.record(&"b".into(), Some(&"a".into())).unwrap();

        assert_eq!(ledger.successor(&"b".into()).unwrap(), None);
        assert!(ledger.resolve_live(&"b".into()).unwrap().is_none());
        assert_eq!(
            ledger.successor(&"live".into()).unwrap(),
            Some("live".into())
        );
    }

    #[test]
    fn resolve_live_loads_successor_group() {
        let store = MemoryStore::new();
        store
            .put_group(&CanonicalGroup::with_member("a".into(), "u1".into()))
            .unwrap();
        let ledger = TombstoneLedger::new(&store);
        ledger.record(&"b".into(), Some(&"a".into())).unwrap();

        let group = ledger.resolve_live(&"b".into()).unwrap().unwrap();
        assert_eq!(group.id, CanonicalId::from("a"));
    }
}
