//! # Tether Testkit
//!
//! Test utilities for Tether.
//!
//! This crate provides:
//! - An in-memory space server with failure injection
//! - Test fixtures and client wiring helpers
//! - Property-based test generators using proptest
//! - Seeded sync scenarios
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_client() {
//!     with_synced_client(|client| {
//!         client.engine.create_object(data(&[("kind", "note")])).unwrap();
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
}

pub use fixtures::*;
pub use generators::*;
pub use server::*;
