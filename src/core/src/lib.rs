//! Strata Core - Foundational Types and Helpers
//!
//! This crate provides the error taxonomy and small filesystem
//! primitives shared by the strata image store and its front-end.

pub mod error;
pub mod fs;

// Re-export commonly used types
pub use error::{Result, StrataError};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
