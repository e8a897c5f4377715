//! Store-level error taxonomy.

use thiserror::Error;

/// Errors surfaced by `overlord-store`. Callers in the root crate map these
/// onto the broader `OverlordError` taxonomy (store-transient/store-permanent).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no {kind} found for id {id}")]
    NotFound { kind: &'static str, id: String },

    /// A compare-and-set update was rejected because the row's `version`
    /// had already moved — another writer got there first.
    #[error("optimistic concurrency conflict on {kind} {id}: expected version {expected}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: i64,
    },

    #[error("duplicate row for {kind} under idempotency key {key}")]
    DuplicateIdempotencyKey { kind: &'static str, key: String },

    #[error("decision chain broken for lead {lead_id}: expected prev_hash {expected}, found {found}")]
    ChainMismatch {
        lead_id: String,
        expected: String,
        found: String,
    },

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("migration error")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same operation might succeed without
    /// intervention — i.e. it's a contention or connectivity blip, not a
    /// structural problem with the data.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::Database(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
