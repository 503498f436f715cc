//! Foundry Watchdog
//!
//! Periodic, read-only monitor over active workflows:
//!
//! - [`evaluate`]: staleness, error accumulation, budget and design
//!   milestone rules for one record
//! - [`Watchdog`]: snapshot, evaluate, publish; announces each milestone
//!   once per workflow
//!
//! The watchdog never writes a workflow record and never moves a phase.

#![warn(unreachable_pub)]

pub mod error;
pub mod monitor;
pub mod rules;

pub use error::WatchdogError;
pub use monitor::{ScanReport, Watchdog};
pub use rules::{evaluate, Signal, DESIGN_MILESTONE, RECENT_ERRORS};
