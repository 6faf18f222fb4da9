//! # Tether Core
//!
//! The space document model and the pure reconciliation logic over it.
//! Nothing here performs I/O or spawns threads; the sync layer in
//! `tether_client` drives these types.
//!
//! This crate provides:
//!
//! - **Identifiers and versions**: validated object/conversation ids and
//!   the monotonically increasing space [`Version`].
//! - **State**: [`SpaceState`] with typed mutations for objects, links,
//!   metadata, and conversations, plus export/import.
//! - **Patch application**: [`apply_patch`] with version screening, echo
//!   suppression, and tolerant delete handling.
//! - **Notifications**: object-level [`Notification`]s derived from
//!   applied patches.
//!
//! ## Key Invariants
//!
//! 1. The version only moves forward; patches that do not target the
//!    immediate successor are dropped or trigger a resync.
//! 2. A relation never holds duplicate targets; empty relations are
//!    dropped.
//! 3. Every object's `data.id` equals the id it is stored under, and it
//!    never changes.
//! 4. A pure echo of a local write advances the version and produces no
//!    notifications.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod error;
mod notify;
mod state;
mod types;

pub use apply::{apply_patch, ApplyOutcome};
pub use error::{CoreError, CoreResult};
pub use notify::{derive_notifications, Notification, NotificationKind};
pub use state::{AuditStamp, Conversation, Interaction, ObjectEntry, SpaceExport, SpaceState};
pub use types::{
    now_millis, ConversationId, ObjectId, SpaceId, SubscriptionId, Version, MAX_ID_LEN,
};
