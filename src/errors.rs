//! Typed errors for the reconciliation engine.
//!
//! `ReconcileError` distinguishes caller mistakes (`MissingIdentifiers`)
//! from store faults and from invariant violations (`BrokenLink`), which
//! are fatal: continuing past one could corrupt further merges.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("At least one of email or phoneNumber must be provided")]
    MissingIdentifiers,

    #[error("Contact {id} not found")]
    ContactNotFound { id: i64 },

    #[error("Contact {id} links to {linked_id}, which is not an active primary")]
    BrokenLink { id: i64, linked_id: i64 },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReconcileError {
    /// True for client-input errors; everything else is an internal fault.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, ReconcileError::MissingIdentifiers)
    }
}
