//! Foundry Engine
//!
//! Event-driven build/test/refine workflow engine:
//!
//! - **Orchestrator**: owns workflow phase, design and assembly, and the
//!   terminal outcome
//! - **Module loop**: generate, design tests, execute, refine and merge,
//!   bounded by the iteration budget
//! - **Collaborators**: trait seams for every external role, plus adapters
//!   over a prompt-in/text-out [`GenerationBackend`]
//!
//! All workflow mutations go through the store's per-workflow ledger, so
//! concurrently running module loops never lose each other's updates.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = Engine::new(store, bus, collaborators, EngineConfig::default());
//! let handle = engine.start();
//! let flow_id = engine.submit("a todo api").await?;
//! let workflow = engine.wait_for_terminal(flow_id, Duration::from_secs(60)).await?;
//! handle.shutdown().await;
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod backend;
pub mod collaborators;
pub mod dispatch;
pub mod engine;
pub mod error;

mod context;
mod module_loop;
mod orchestrator;

// Re-exports
pub use backend::{
    BackendCoder, BackendDesigner, BackendRefiner, BackendTestDesigner, Completion,
    GenerationBackend,
};
pub use collaborators::{
    Assembler, CodeGenerator, Collaborators, DesignGenerator, Generated, ManifestAssembler,
    Refiner, TestDesigner, TestExecutor,
};
pub use dispatch::{spawn_dispatcher, Handler};
pub use engine::{Engine, EngineHandle};
pub use error::EngineError;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
