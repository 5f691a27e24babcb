//! Error types for identity resolution and reconciliation.

use thiserror::Error;

use crate::model::{CanonicalId, UniversalId};

/// Result type alias for bugdex operations.
pub type Result<T> = std::result::Result<T, BugdexError>;

/// The kind of entity a lookup was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    UniversalRecord,
    CanonicalGroup,
    SourceRecord,
    Tombstone,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EntityKind::UniversalRecord => "universal record",
            EntityKind::CanonicalGroup => "canonical group",
            EntityKind::SourceRecord => "source record",
            EntityKind::Tombstone => "tombstone",
        };
        f.write_str(label)
    }
}

/// Errors that can occur while resolving or reconciling bug identities.
#[derive(Debug, Error)]
pub enum BugdexError {
    /// The record or group does not exist. Callers are expected to branch on this.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was being looked up.
        kind: EntityKind,
        /// The key that was looked up.
        id: String,
    },

    /// A canonical group was passed where a record reference was expected.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A cached group member no longer points back at the group.
    ///
    /// Only produced while reconciling; public operations never return it.
    #[error("stale reference: {universal_id} is cached in {group} but points to {points_to}")]
    StaleReference {
        group: CanonicalId,
        universal_id: UniversalId,
        points_to: CanonicalId,
    },

    /// The tombstone chain starting at `id` did not terminate.
    #[error("tombstone chain starting at {id} exceeds {hops} hops")]
    TombstoneCycle { id: CanonicalId, hops: usize },

    /// The backing store failed. Surfaced to the caller, never retried here.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl BugdexError {
    pub fn not_found(kind: EntityKind, id: impl std::fmt::Display) -> Self {
        BugdexError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BugdexError::NotFound { .. })
    }
}

impl From<figment::Error> for BugdexError {
    fn from(e: figment::Error) -> Self {
        BugdexError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_kind_and_key() {
        let err = BugdexError::not_found(EntityKind::CanonicalGroup, "abc");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "canonical group not found: abc");
    }

    #[test]
    fn store_errors_convert_with_question_mark() {
        fn fails() -> Result<()> {
            Err(anyhow::anyhow!("table unavailable"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(matches!(err, BugdexError::Store(_)));
        assert!(!err.is_not_found());
    }
}
