//! Error types for Foundry Core
//!
//! - [`WorkflowError`]: domain rule violations on a workflow record
//! - [`CollaboratorError`]: failures reported by external collaborators
//! - [`ConfigError`]: configuration loading and validation
//! - [`BusError`]: event publication

use crate::phase::Phase;
use crate::types::ModuleId;
use std::fmt;
use std::path::PathBuf;

/// Workflow rule violations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    /// Edge not in the phase DAG
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        /// Current phase
        from: Phase,
        /// Requested phase
        to: Phase,
    },

    /// Record is in a terminal phase and accepts no further changes
    #[error("workflow is terminal ({0})")]
    Terminal(Phase),

    /// Module id not present in the workflow
    #[error("unknown module: {0}")]
    UnknownModule(ModuleId),

    /// Usage with negative or non-finite values
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// Event refers to an iteration other than the stored one
    #[error("stale event for {module}: event iteration {event}, stored {stored}")]
    StaleIteration {
        /// Module the event targets
        module: ModuleId,
        /// Iteration carried by the event
        event: u32,
        /// Iteration currently stored
        stored: u32,
    },

    /// Event already handled
    #[error("duplicate event: {0}")]
    Duplicate(String),
}

impl WorkflowError {
    /// Error means the event should be dropped, not recorded
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Self::StaleIteration { .. } | Self::Duplicate(_) | Self::Terminal(_)
        )
    }
}

/// Collaborator failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollaboratorErrorKind {
    /// Call failed; a later attempt may succeed
    Transient,
    /// Call returned output that could not be used
    Malformed,
    /// Call failed in a way no retry can fix
    Unrecoverable,
}

impl fmt::Display for CollaboratorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Malformed => "malformed",
            Self::Unrecoverable => "unrecoverable",
        })
    }
}

/// Error returned by a collaborator call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} collaborator error: {message}")]
pub struct CollaboratorError {
    /// Failure class
    pub kind: CollaboratorErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl CollaboratorError {
    /// Transient failure
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Unusable output
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::Malformed,
            message: message.into(),
        }
    }

    /// Permanent failure
    #[must_use]
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::Unrecoverable,
            message: message.into(),
        }
    }

    /// Check if error is transient
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == CollaboratorErrorKind::Transient
    }

    /// Check if error must fail the workflow
    #[inline]
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        self.kind == CollaboratorErrorKind::Unrecoverable
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// TOML did not parse
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML could not be produced
    #[error("cannot render TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// Value out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Event publication errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// Bus shut down
    #[error("event bus closed")]
    Closed,

    /// Transport rejected the event
    #[error("publish failed: {0}")]
    Transport(String),
}
