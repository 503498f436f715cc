//! Foundry Core
//!
//! Shared vocabulary of the workflow engine:
//!
//! - **Data model**: [`Workflow`], [`Module`], [`TestReport`] and friends
//! - **Phase state machine**: [`Phase`], [`plan_transition`], progress table
//! - **Events**: typed [`Event`]s, [`Topic`]s and the [`InProcessBus`]
//! - **Signals**: watchdog risk, milestone and cost payloads
//! - **Configuration**: [`FoundryConfig`] loaded from TOML
//!
//! # Example
//!
//! ```rust,ignore
//! use foundry_core::{FlowId, Phase, Workflow};
//!
//! let mut workflow = Workflow::new(FlowId::new(), "todo api", 3);
//! workflow.enter_phase(Phase::Designing)?;
//! assert_eq!(workflow.progress(), 15);
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod config;
pub mod error;
pub mod events;
pub mod phase;
pub mod signals;
pub mod types;

// Re-exports
pub use config::{EngineConfig, FoundryConfig, WatchdogConfig};
pub use error::{BusError, CollaboratorError, CollaboratorErrorKind, ConfigError, WorkflowError};
pub use events::{Envelope, Event, EventBus, InProcessBus, Subscription, Topic};
pub use phase::{allowed_transitions, plan_transition, validate_transition, Phase, PhasePlan};
pub use signals::{CostAlert, MilestoneSignal, RiskSignal, RiskType, Severity};
pub use types::{
    AssembledArtifact, CodeModule, ComponentSpec, DesignDocument, FailureInfo, FailureStage,
    FlowId, Metrics, Module, ModuleId, ModuleStatus, ModuleSummary, TestCase, TestReport,
    TestResult, Usage, Workflow, WorkflowSummary,
};

pub use foundry_artifact::{FileBlock, GeneratedFile, Language, ModuleType};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
