//! # objsync testkit
//!
//! Test utilities for objsync.
//!
//! This crate provides:
//! - A small people/companies domain model with actions
//! - `TestEnvironment`, a running service over an in-memory store
//! - Property-based generators for wire values using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use objsync_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_service() {
//!     let env = TestEnvironment::new();
//!     let ada = env.seed_person("Ada", 36);
//!     // ... protocol operations against env.service
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
