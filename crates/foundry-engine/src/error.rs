//! Engine errors

use foundry_core::{BusError, CollaboratorError, FlowId, WorkflowError};
use foundry_store::{LedgerError, StoreError};

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Ledger mutation failed
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Direct store access failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Collaborator call failed
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Publication failed
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Workflow rule violated outside a ledger mutation
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// Workflow did not reach a terminal phase in time
    #[error("workflow {0} still running after {1:?}")]
    Timeout(FlowId, std::time::Duration),
}

impl EngineError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Collaborator(err) => err.is_transient(),
            Self::Ledger(LedgerError::Contention { .. }) => true,
            Self::Ledger(LedgerError::Store(err)) | Self::Store(err) => err.is_conflict(),
            _ => false,
        }
    }

    /// Event was stale or duplicate, or the workflow already finished
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        match self {
            Self::Ledger(err) => err.is_stale(),
            Self::Workflow(err) => err.is_stale(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_core::Phase;

    #[test]
    fn classification() {
        assert!(EngineError::from(CollaboratorError::transient("503")).is_retryable());
        assert!(!EngineError::from(CollaboratorError::unrecoverable("quota")).is_retryable());

        let contention = LedgerError::Contention {
            flow_id: FlowId::new(),
            attempts: 8,
        };
        assert!(EngineError::from(contention).is_retryable());

        let terminal = LedgerError::Rejected(WorkflowError::Terminal(Phase::Cancelled));
        let err = EngineError::from(terminal);
        assert!(err.is_stale());
        assert!(!err.is_retryable());
    }
}
