//! Foundry Store
//!
//! - [`WorkflowStore`]: keyed record storage with versioned compare-and-set
//!   and a write-once keyspace for test cases
//! - [`MemoryStore`]: `DashMap`-backed implementation
//! - [`WorkflowLedger`]: one writer task per workflow; every engine mutation
//!   goes through it

#![warn(unreachable_pub)]

pub mod error;
pub mod ledger;
pub mod store;

pub use error::{LedgerError, StoreError};
pub use ledger::WorkflowLedger;
pub use store::{MemoryStore, WorkflowStore};
