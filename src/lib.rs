//! # Warning: Unstable API
//!
//! This library API is unstable and subject to breaking changes without
//! notice. Only the CLI interface is considered stable. Use at your own risk.
//!
//! To use the CLI tool, install with: `cargo install neardup`

// All modules declared here for library structure
// Mark everything as doc(hidden) to avoid exposing unstable API in docs
#[doc(hidden)]
pub mod common;
#[doc(hidden)]
pub mod dedup;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod filter;
#[doc(hidden)]
pub mod flags;
#[doc(hidden)]
pub mod index;
#[doc(hidden)]
pub mod merge;
#[doc(hidden)]
pub mod minhash;
#[doc(hidden)]
pub mod store;

// Re-export execute functions for convenience (also hidden from docs)
#[doc(hidden)]
pub use dedup::execute_dedup;
#[doc(hidden)]
pub use filter::{execute_filter_each, execute_filter_whole};
#[doc(hidden)]
pub use merge::execute_merge;
#[doc(hidden)]
pub use minhash::execute_signature;
