//! Store and ledger errors

use foundry_core::{FlowId, WorkflowError};

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No record for the id
    #[error("workflow not found: {0}")]
    NotFound(FlowId),

    /// Insert of an existing id
    #[error("workflow already exists: {0}")]
    AlreadyExists(FlowId),

    /// Record changed since it was read
    #[error("version conflict on {flow_id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Workflow
        flow_id: FlowId,
        /// Version the writer read
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if a re-read and retry can succeed
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Errors from [`WorkflowLedger`](crate::WorkflowLedger) mutations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    /// Storage failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Mutation refused by a workflow rule
    #[error("mutation rejected: {0}")]
    Rejected(#[from] WorkflowError),

    /// Every compare-and-set attempt conflicted
    #[error("gave up on {flow_id} after {attempts} conflicting writes")]
    Contention {
        /// Workflow
        flow_id: FlowId,
        /// Attempts made
        attempts: u32,
    },

    /// Writer task is gone
    #[error("writer for {0} is closed")]
    Closed(FlowId),
}

impl LedgerError {
    /// The workflow rule error, if that is what this is
    #[must_use]
    pub fn as_rejection(&self) -> Option<&WorkflowError> {
        match self {
            Self::Rejected(err) => Some(err),
            _ => None,
        }
    }

    /// Mutation was refused because the record is terminal or the event is
    /// stale
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.as_rejection().is_some_and(WorkflowError::is_stale)
    }
}
