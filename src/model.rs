//! # Data Model
//!
//! Core data structures for bug identity resolution: per-source records, the
//! universal records that give each of them a stable identity, the canonical
//! groups that deduplicate them, and the tombstones left behind by retired groups.

use crate::error::{BugdexError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identifier for one source-specific record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniversalId(pub String);

impl UniversalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh lowercase UUIDv4 identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniversalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UniversalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a canonical group (live or retired).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(pub String);

impl CanonicalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().to_lowercase())
    }

    /// Fresh lowercase UUIDv4 identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanonicalId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Key of a record in its originating system, e.g. `("jira", "10042")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    /// Source system in lower case (e.g. "jira")
    pub source: String,
    /// Identifier assigned by the source system
    pub source_specific_id: String,
}

impl SourceKey {
    pub fn new(source: impl Into<String>, source_specific_id: impl Into<String>) -> Self {
        Self {
            source: source.into().to_lowercase(),
            source_specific_id: source_specific_id.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.source_specific_id)
    }
}

/// One entry per distinct source-specific record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniversalRecord {
    pub universal_id: UniversalId,
    /// Authoritative group membership. Repointed by merges and healing.
    pub canonical_id: CanonicalId,
    pub source: String,
    pub source_specific_id: String,
}

impl UniversalRecord {
    pub fn new(
        universal_id: UniversalId,
        canonical_id: CanonicalId,
        source_key: SourceKey,
    ) -> Self {
        Self {
            universal_id,
            canonical_id,
            source: source_key.source,
            source_specific_id: source_key.source_specific_id,
        }
    }

    pub fn source_key(&self) -> SourceKey {
        SourceKey {
            source: self.source.clone(),
            source_specific_id: self.source_specific_id.clone(),
        }
    }
}

/// The deduplicated "real bug".
///
/// `other_representations` is a best-effort cache of the universal records that
/// point at this group; the pointers themselves are authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalGroup {
    pub id: CanonicalId,
    pub other_representations: BTreeSet<UniversalId>,
    pub former_canonical_representations: BTreeSet<CanonicalId>,
}

impl CanonicalGroup {
    pub fn new(id: CanonicalId) -> Self {
        Self {
            id,
            other_representations: BTreeSet::new(),
            former_canonical_representations: BTreeSet::new(),
        }
    }

    pub fn with_member(id: CanonicalId, member: UniversalId) -> Self {
        let mut group = Self::new(id);
        group.other_representations.insert(member);
        group
    }

    pub fn has_member(&self, universal_id: &UniversalId) -> bool {
        self.other_representations.contains(universal_id)
    }
}

/// Write-once marker for a retired canonical group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: CanonicalId,
    /// `None` when the group was retired without a successor.
    pub replacement_id: Option<CanonicalId>,
}

/// Locally stored copy of a record observed in an external source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub key: SourceKey,
    pub universal_id: UniversalId,
    /// Adapter-defined fields (summary, project, issue type, ...).
    pub attributes: BTreeMap<String, String>,
}

/// A record as handed over by a source adapter, before it has an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObservation {
    pub key: SourceKey,
    pub attributes: BTreeMap<String, String>,
}

impl SourceObservation {
    pub fn new(source: impl Into<String>, source_specific_id: impl Into<String>) -> Self {
        Self {
            key: SourceKey::new(source, source_specific_id),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Anything that identifies a single record. Canonical groups are not records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordRef {
    Universal(UniversalId),
    Source(SourceKey),
}

impl From<UniversalId> for RecordRef {
    fn from(id: UniversalId) -> Self {
        RecordRef::Universal(id)
    }
}

impl From<&UniversalRecord> for RecordRef {
    fn from(record: &UniversalRecord) -> Self {
        RecordRef::Universal(record.universal_id.clone())
    }
}

impl From<SourceKey> for RecordRef {
    fn from(key: SourceKey) -> Self {
        RecordRef::Source(key)
    }
}

impl From<&SourceRecord> for RecordRef {
    fn from(record: &SourceRecord) -> Self {
        RecordRef::Source(record.key.clone())
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRef::Universal(id) => write!(f, "universal:{id}"),
            RecordRef::Source(key) => write!(f, "source:{key}"),
        }
    }
}

/// Any entity reference, as typed by an operator.
///
/// Textual forms: `universal:<id>`, `source:<source>:<source_specific_id>`,
/// `canonical:<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Universal(UniversalId),
    Source(SourceKey),
    Canonical(CanonicalId),
}

impl FromStr for EntityRef {
    type Err = BugdexError;

    fn from_str(value: &str) -> Result<Self> {
        let (kind, rest) = value.split_once(':').ok_or_else(|| {
            BugdexError::InvalidReference(format!("missing kind prefix in '{value}'"))
        })?;
        match kind {
            "universal" | "u" if !rest.is_empty() => Ok(EntityRef::Universal(UniversalId::new(rest))),
            "canonical" | "c" if !rest.is_empty() => Ok(EntityRef::Canonical(CanonicalId::new(rest))),
            "source" | "s" => {
                let (source, source_specific_id) = rest
                    .split_once(':')
                    .filter(|(source, id)| !source.is_empty() && !id.is_empty())
                    .ok_or_else(|| {
                        BugdexError::InvalidReference(format!(
                            "expected source:<source>:<id>, got '{value}'"
                        ))
                    })?;
                Ok(EntityRef::Source(SourceKey::new(source, source_specific_id)))
            }
            _ => Err(BugdexError::InvalidReference(format!(
                "unrecognised reference '{value}'"
            ))),
        }
    }
}

impl TryFrom<EntityRef> for RecordRef {
    type Error = BugdexError;

    fn try_from(value: EntityRef) -> Result<Self> {
        match value {
            EntityRef::Universal(id) => Ok(RecordRef::Universal(id)),
            EntityRef::Source(key) => Ok(RecordRef::Source(key)),
            EntityRef::Canonical(id) => Err(BugdexError::InvalidReference(format!(
                "canonical group {id} should not be used as a record"
            ))),
        }
    }
}
