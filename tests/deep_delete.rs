//! Cascading local deletion through the source, universal and canonical layers.

use bugdex_rs::test_support::observation;
use bugdex_rs::{Bugdex, CanonicalId, RecordRef, SourceKey};

#[test]
fn deleting_last_source_record_removes_group() -> anyhow::Result<()> {
    let bugdex = Bugdex::in_memory();
    let record = bugdex.ingest(observation("jira", "10042"), None)?;

    let deleted = bugdex.deep_delete(&SourceKey::new("jira", "10042"))?;
    assert!(deleted.group_removed);
    assert_eq!(deleted.universal_id, Some(record.universal_id.clone()));

    assert!(bugdex.group(&record.canonical_id).unwrap_err().is_not_found());
    assert!(bugdex
        .resolve(&RecordRef::Universal(record.universal_id))
        .unwrap_err()
        .is_not_found());
    let stats = bugdex.stats()?;
    assert_eq!(stats.universal_records, 0);
    assert_eq!(stats.source_records, 0);
    assert_eq!(stats.canonical_groups, 0);
    assert_eq!(bugdex.resolve_canonical(&record.canonical_id)?, None);
    Ok(())
}

#[test]
fn deleting_one_of_several_shrinks_group() -> anyhow::Result<()> {
    let bugdex = Bugdex::in_memory();
    let group = CanonicalId::new("xss-login");
    let jira = bugdex.ingest(observation("jira", "10042"), Some(&group))?;
    let snyk = bugdex.ingest(observation("snyk", "SNYK-JS-1"), Some(&group))?;
    let github = bugdex.ingest(observation("github", "1337"), Some(&group))?;

    let deleted = bugdex.deep_delete(&SourceKey::new("snyk", "SNYK-JS-1"))?;
    assert!(!deleted.group_removed);

    let remaining = bugdex.group(&group)?;
    assert!(!remaining.has_member(&snyk.universal_id));
    assert!(remaining.has_member(&jira.universal_id));
    assert!(remaining.has_member(&github.universal_id));

    let related: Vec<_> = bugdex
        .related_bugs(&RecordRef::Universal(jira.universal_id.clone()))?
        .collect::<Result<_, _>>()?;
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].universal_id, github.universal_id);
    assert!(bugdex.audit()?.is_clean());
    Ok(())
}

#[test]
fn deleting_unknown_record_is_not_found() {
    let bugdex = Bugdex::in_memory();
    let err = bugdex
        .deep_delete(&SourceKey::new("jira", "missing"))
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn reingesting_after_delete_starts_a_new_identity() -> anyhow::Result<()> {
    let bugdex = Bugdex::in_memory();
    let first = bugdex.ingest(observation("jira", "10042"), None)?;
    bugdex.deep_delete(&SourceKey::new("jira", "10042"))?;

    let second = bugdex.ingest(observation("jira", "10042"), None)?;
    assert_ne!(first.universal_id, second.universal_id);
    assert_ne!(first.canonical_id, second.canonical_id);
    Ok(())
}
