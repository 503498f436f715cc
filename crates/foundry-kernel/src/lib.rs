//! Foundry Kernel
//!
//! Seeded simulation harness for the workflow engine and the `foundry`
//! command line built on it.

#![warn(unreachable_pub)]

pub mod simulator;

pub use simulator::{run_simulator, SimulatorConfig, SimulatorReport, SimulatorStats, Violation};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
