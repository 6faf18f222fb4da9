//! # Tether Client
//!
//! Client-side SDK for synchronized spaces. It keeps a local mirror of
//! each opened space, applies writes optimistically, reconciles server
//! patches from a reconnecting event stream, and owns the auth session
//! the whole thing rides on.
//!
//! The pieces compose explicitly, no globals:
//!
//! - [`AuthSession`] holds credentials and refreshes tokens, at most one
//!   refresh in flight.
//! - [`StreamTransport`] keeps one scoped event stream alive across
//!   connection drops.
//! - [`SpaceSyncEngine`] mirrors one space and runs the optimistic
//!   write / echo-suppression protocol.
//! - [`SessionContext`] ties them together for one user session.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_client::{
//!     AuthConfig, AuthSession, ClientIdentity, Credentials, MockSpaceApi, SessionContext,
//!     SpaceId, StaticProvider,
//! };
//!
//! # fn main() -> tether_client::ClientResult<()> {
//! let provider = Arc::new(StaticProvider::new(Credentials::new(
//!     "access",
//!     Some("refresh".to_string()),
//!     0,
//! )));
//! let auth = AuthSession::new(provider, AuthConfig::new());
//! auth.login()?;
//!
//! let api = Arc::new(MockSpaceApi::new());
//! let context = SessionContext::new(api, auth, ClientIdentity::new("u1", "Ada"));
//! let space = context.open_space(&SpaceId::new("demo"))?;
//! println!("{} objects", space.snapshot().object_count());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod api;
mod auth;
mod checkpoint;
mod config;
mod context;
mod engine;
mod error;
mod hub;
mod provider;
mod stream;

pub use api::{CheckpointStatus, MockSpaceApi, SpaceApi};
pub use auth::{AuthEvent, AuthSession, Credentials};
pub use checkpoint::CheckpointController;
pub use config::{AuthConfig, BackoffConfig, ClientConfig, ClientIdentity};
pub use context::SessionContext;
pub use engine::{SpaceSyncEngine, SyncStats};
pub use error::{ClientError, ClientResult};
pub use hub::{NotificationHandler, NotificationHub};
pub use provider::{CredentialProvider, FileStorage, StaticProvider};
pub use stream::{ConnectionState, EventSource, StreamConnector, StreamScope, StreamTransport};

// The core and protocol types the public API is expressed in.
pub use tether_core::{
    AuditStamp, Conversation, ConversationId, CoreError, Interaction, Notification,
    NotificationKind, ObjectEntry, ObjectId, SpaceExport, SpaceId, SpaceState, SubscriptionId,
    Version,
};
pub use tether_proto::{ChangeSource, Patch, PatchOp, Pointer, ProtoError, StreamEvent, WireSource};
