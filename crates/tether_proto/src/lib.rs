//! # Tether Protocol
//!
//! Wire protocol types shared by the Tether client and test server.
//!
//! This crate provides:
//! - JSON pointers with RFC 6901 escaping and value addressing
//! - Patch operations in the RFC 6902 wire shape, with the `/version`
//!   reconciliation anchor
//! - Event-stream envelopes, including an explicit `Unknown` arm for
//!   unrecognized server event types
//! - The change-source taxonomy (`user`/`agent` on the wire, refined
//!   locally)
//!
//! ## Key Invariants
//!
//! - Patches apply in operation order; strict RFC 6902 semantics live here,
//!   tolerance policies live in the state layer
//! - The version anchor is a top-level `/version` add or replace; nested
//!   `version` segments are ordinary data
//! - Unknown event types decode loudly, never silently

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod patch;
mod pointer;

pub use error::{ProtoError, ProtoResult};
pub use event::{ChangeSource, StreamEvent, WireSource, KNOWN_EVENT_TYPES};
pub use patch::{Patch, PatchOp, VERSION_POINTER};
pub use pointer::Pointer;
