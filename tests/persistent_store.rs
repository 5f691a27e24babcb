//! Identity resolution on the RocksDB store, across restarts.

use bugdex_rs::config::{StoreBackend, StoreConfig};
use bugdex_rs::test_support::{converge, observation, run_random_workload, WorkloadConfig};
use bugdex_rs::{Bugdex, CanonicalId, PersistentStore, RecordRef, SourceKey, UniversalId};
use tempfile::tempdir;

fn rocksdb_config(data_dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        backend: StoreBackend::Rocksdb,
        data_dir: data_dir.to_path_buf(),
        cache_capacity: 64,
        repair: false,
    }
}

#[test]
fn merges_survive_restart() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = rocksdb_config(&dir.path().join("store"));

    let (kept, absorbed) = {
        let bugdex = Bugdex::open(&config)?;
        let first = bugdex.propose(&"u1".into(), &SourceKey::new("jira", "J-1"), None)?;
        let second = bugdex.propose(&"u2".into(), &SourceKey::new("jira", "J-2"), None)?;
        bugdex.merge(&first.canonical_id, &second.canonical_id)?;
        bugdex.flush()?;
        (first.canonical_id, second.canonical_id)
    };

    let bugdex = Bugdex::open(&config)?;
    let related: Vec<UniversalId> = bugdex
        .related_bugs(&RecordRef::Universal("u1".into()))?
        .map(|record| record.map(|record| record.universal_id))
        .collect::<Result<_, _>>()?;
    assert_eq!(related, vec![UniversalId::from("u2")]);
    assert_eq!(bugdex.resolve_canonical(&absorbed)?, Some(kept.clone()));
    assert!(bugdex.group(&absorbed).unwrap_err().is_not_found());

    let record = bugdex
        .lookup_by_source(&SourceKey::new("jira", "J-2"))?
        .expect("record indexed by source");
    assert_eq!(record.canonical_id, kept);
    Ok(())
}

#[test]
fn random_workload_converges_on_rocksdb() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config = rocksdb_config(dir.path());
    let workload = WorkloadConfig {
        records: 60,
        seed: 11,
        ..WorkloadConfig::default()
    };

    let stats = {
        let bugdex = Bugdex::open(&config)?;
        let summary = run_random_workload(bugdex.store(), &workload)?;
        assert!(converge(bugdex.store(), 25)?.is_some());
        let stats = bugdex.stats()?;
        assert_eq!(stats.universal_records, summary.ingested - summary.deleted);
        stats
    };

    let bugdex = Bugdex::open(&config)?;
    assert_eq!(bugdex.stats()?, stats);
    let audit = bugdex.audit()?;
    assert!(audit.is_clean(), "violations: {:?}", audit.violations);
    Ok(())
}

#[test]
fn checkpoint_restores_identities() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let bugdex = Bugdex::open(&rocksdb_config(&dir.path().join("live")))?;
    let record = bugdex.ingest(observation("snyk", "SNYK-JS-42"), Some(&CanonicalId::new("c1")))?;

    let checkpoint = dir.path().join("checkpoint");
    bugdex.checkpoint(&checkpoint)?;

    let restored = Bugdex::with_store(PersistentStore::open(&checkpoint)?);
    let group = restored.canonical_group_of(&RecordRef::Source(SourceKey::new("snyk", "SNYK-JS-42")))?;
    assert_eq!(group.id, CanonicalId::from("c1"));
    assert!(group.has_member(&record.universal_id));
    assert!(restored.store().get_source_record(&record.source_key())?.is_some());
    Ok(())
}

#[test]
fn repair_option_reopens_existing_store() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = rocksdb_config(dir.path());
    {
        let bugdex = Bugdex::open(&config)?;
        bugdex.ingest(observation("github", "7"), None)?;
    }
    config.repair = true;
    let bugdex = Bugdex::open(&config)?;
    assert!(bugdex
        .lookup_by_source(&SourceKey::new("github", "7"))?
        .is_some());
    Ok(())
}
