//! Foundry Artifact
//!
//! Generated files and the two text-level policies that shape them:
//!
//! - [`parse_blocks`]: the delimiter grammar backends use to return files
//! - [`merge_refinement`]: how a partial refiner answer becomes the next
//!   iteration's file set
//! - [`ContentHash`]: Blake3 digest of a file set, used to detect refinement
//!   cycles that changed nothing
//!
//! # Example
//!
//! ```rust,ignore
//! use foundry_artifact::{merge_refinement, parse_blocks};
//!
//! let parsed = parse_blocks(&backend_reply);
//! let outcome = merge_refinement(&module.files, parsed.blocks, module.iteration + 1);
//! if !outcome.changed() {
//!     tracing::warn!("refinement made no progress");
//! }
//! ```

#![warn(unreachable_pub)]

// Core modules
pub mod blocks;
mod file;
mod hash;
mod merge;

// Re-exports
pub use blocks::{parse_blocks, render_blocks, BlockDiagnostic, ParsedBlocks};
pub use file::{FileBlock, GeneratedFile, Language, ModuleType};
pub use hash::{ContentHash, HashError};
pub use merge::{merge_refinement, MergeOutcome};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
