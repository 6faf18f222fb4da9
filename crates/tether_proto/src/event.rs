//! Server event-stream envelopes.
//!
//! Every event is a JSON object of the form `{type, timestamp, ...}`.
//! Scope-global channels carry space lifecycle and storage events;
//! per-space channels carry `connected`, `space_patched` and
//! `space_changed`. Types the client does not recognize decode to
//! [`StreamEvent::Unknown`] so new server features are visible in logs
//! instead of silently swallowed.

use crate::error::{ProtoError, ProtoResult};
use crate::patch::Patch;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who authored a change, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireSource {
    /// A human user (possibly this client's own user).
    User,
    /// The autonomous agent attached to the space.
    Agent,
}

/// Who a change is attributed to after client-side classification.
///
/// The wire only distinguishes `user` and `agent`; the client refines
/// `user` into local vs. remote when it recognizes its own echoes, and uses
/// `System` for changes it originates itself (resync resets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    /// This client's own optimistic write.
    LocalUser,
    /// Another user's write arriving over the stream.
    RemoteUser,
    /// The space's agent writing remotely.
    RemoteAgent,
    /// Client-internal bookkeeping (full resets, sync errors).
    System,
}

impl ChangeSource {
    /// Maps a wire source to its remote classification.
    #[must_use]
    pub fn from_wire(source: WireSource) -> Self {
        match source {
            WireSource::User => Self::RemoteUser,
            WireSource::Agent => Self::RemoteAgent,
        }
    }

    /// True for sources other than this client itself.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteUser | Self::RemoteAgent)
    }
}

impl fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LocalUser => "local_user",
            Self::RemoteUser => "remote_user",
            Self::RemoteAgent => "remote_agent",
            Self::System => "system",
        };
        f.write_str(name)
    }
}

/// Event types this client understands. Used to separate "unknown type"
/// from "known type with a malformed body" while decoding.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "connected",
    "space_patched",
    "space_changed",
    "space_created",
    "space_deleted",
    "space_renamed",
    "space_access_changed",
    "user_storage_changed",
];

/// A decoded event-stream envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event on every channel; marks the subscription live. On
    /// per-space channels it carries the server's current document version.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Server document version at connect time (per-space channels).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_version: Option<u64>,
        /// Server wall clock, unix milliseconds.
        #[serde(default)]
        timestamp: u64,
    },

    /// An incremental content change for the subscribed space.
    #[serde(rename_all = "camelCase")]
    SpacePatched {
        /// The patch batch to reconcile.
        patch: Patch,
        /// Who authored the change.
        source: WireSource,
        /// Server wall clock, unix milliseconds.
        #[serde(default)]
        timestamp: u64,
    },

    /// The space changed in a way too large to patch; refetch it.
    #[serde(rename_all = "camelCase")]
    SpaceChanged {
        /// Server wall clock, unix milliseconds.
        #[serde(default)]
        timestamp: u64,
    },

    /// A space visible to this user was created.
    #[serde(rename_all = "camelCase")]
    SpaceCreated {
        /// Identifier of the new space.
        space_id: String,
        /// Display name, when the server includes it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Server wall clock, unix milliseconds.
        #[serde(default)]
        timestamp: u64,
    },

    /// A space was deleted.
    #[serde(rename_all = "camelCase")]
    SpaceDeleted {
        /// Identifier of the deleted space.
        space_id: String,
        /// Server wall clock, unix milliseconds.
        #[serde(default)]
        timestamp: u64,
    },

    /// A space was renamed.
    #[serde(rename_all = "camelCase")]
    SpaceRenamed {
        /// Identifier of the renamed space.
        space_id: String,
        /// The new display name.
        name: String,
        /// Server wall clock, unix milliseconds.
        #[serde(default)]
        timestamp: u64,
    },

    /// The caller's access to a space changed.
    #[serde(rename_all = "camelCase")]
    SpaceAccessChanged {
        /// Identifier of the affected space.
        space_id: String,
        /// Server wall clock, unix milliseconds.
        #[serde(default)]
        timestamp: u64,
    },

    /// The user's provider storage changed on another device.
    #[serde(rename_all = "camelCase")]
    UserStorageChanged {
        /// Server wall clock, unix milliseconds.
        #[serde(default)]
        timestamp: u64,
    },

    /// An envelope type this client does not recognize.
    #[serde(skip)]
    Unknown {
        /// The raw `type` field from the wire.
        event_type: String,
    },
}

impl StreamEvent {
    /// Decodes one envelope from its JSON text.
    ///
    /// Unrecognized `type` values produce [`StreamEvent::Unknown`]; a known
    /// type with a malformed body is a decode error.
    pub fn decode(raw: &str) -> ProtoResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| ProtoError::decode(format!("malformed event json: {e}")))?;
        let event_type = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProtoError::decode("event missing type field"))?
            .to_string();

        if !KNOWN_EVENT_TYPES.contains(&event_type.as_str()) {
            tracing::warn!(event_type = %event_type, "unknown stream event type");
            return Ok(Self::Unknown { event_type });
        }

        serde_json::from_value(value)
            .map_err(|e| ProtoError::decode(format!("bad {event_type} event: {e}")))
    }

    /// Encodes the envelope to JSON text. [`StreamEvent::Unknown`] cannot be
    /// encoded; it exists only on the decode side.
    pub fn encode(&self) -> ProtoResult<String> {
        serde_json::to_string(self).map_err(|e| ProtoError::decode(e.to_string()))
    }

    /// The wire name of this event's type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Connected { .. } => "connected",
            Self::SpacePatched { .. } => "space_patched",
            Self::SpaceChanged { .. } => "space_changed",
            Self::SpaceCreated { .. } => "space_created",
            Self::SpaceDeleted { .. } => "space_deleted",
            Self::SpaceRenamed { .. } => "space_renamed",
            Self::SpaceAccessChanged { .. } => "space_access_changed",
            Self::UserStorageChanged { .. } => "user_storage_changed",
            Self::Unknown { event_type } => event_type,
        }
    }

    /// True for the subscription-live marker.
    #[must_use]
    pub fn is_connected_marker(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchOp;
    use crate::pointer::Pointer;
    use serde_json::json;

    #[test]
    fn decode_connected_with_version() {
        let event =
            StreamEvent::decode(r#"{"type":"connected","serverVersion":42,"timestamp":1000}"#)
                .unwrap();
        assert_eq!(
            event,
            StreamEvent::Connected {
                server_version: Some(42),
                timestamp: 1000
            }
        );
        assert!(event.is_connected_marker());
    }

    #[test]
    fn decode_connected_without_version() {
        let event = StreamEvent::decode(r#"{"type":"connected"}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Connected {
                server_version: None,
                timestamp: 0
            }
        );
    }

    #[test]
    fn decode_space_patched() {
        let raw = r#"{
            "type": "space_patched",
            "timestamp": 5,
            "source": "agent",
            "patch": [
                {"op": "replace", "path": "/version", "value": 9},
                {"op": "add", "path": "/meta/topic", "value": "birds"}
            ]
        }"#;
        let event = StreamEvent::decode(raw).unwrap();
        match event {
            StreamEvent::SpacePatched { patch, source, .. } => {
                assert_eq!(source, WireSource::Agent);
                assert_eq!(patch.version_target(), Some(9));
                assert_eq!(patch.len(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_type() {
        let event =
            StreamEvent::decode(r#"{"type":"space_sparkled","timestamp":1}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Unknown {
                event_type: "space_sparkled".into()
            }
        );
        assert_eq!(event.type_name(), "space_sparkled");
    }

    #[test]
    fn decode_known_type_with_bad_body_is_an_error() {
        // space_patched without a patch is malformed, not unknown.
        let result = StreamEvent::decode(r#"{"type":"space_patched","timestamp":1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn decode_missing_type_is_an_error() {
        assert!(StreamEvent::decode(r#"{"timestamp":1}"#).is_err());
        assert!(StreamEvent::decode("not json").is_err());
    }

    #[test]
    fn encode_roundtrip() {
        let event = StreamEvent::SpacePatched {
            patch: crate::patch::Patch::new(vec![PatchOp::replace(
                Pointer::parse("/version").unwrap(),
                json!(3),
            )]),
            source: WireSource::User,
            timestamp: 77,
        };
        let text = event.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], json!("space_patched"));
        assert_eq!(value["source"], json!("user"));
        assert_eq!(StreamEvent::decode(&text).unwrap(), event);
    }

    #[test]
    fn source_classification() {
        assert_eq!(
            ChangeSource::from_wire(WireSource::User),
            ChangeSource::RemoteUser
        );
        assert_eq!(
            ChangeSource::from_wire(WireSource::Agent),
            ChangeSource::RemoteAgent
        );
        assert!(ChangeSource::RemoteAgent.is_remote());
        assert!(!ChangeSource::LocalUser.is_remote());
        assert_eq!(ChangeSource::System.to_string(), "system");
    }

    #[test]
    fn every_known_type_decodes() {
        let samples = [
            r#"{"type":"connected"}"#,
            r#"{"type":"space_patched","patch":[],"source":"user"}"#,
            r#"{"type":"space_changed"}"#,
            r#"{"type":"space_created","spaceId":"s1","name":"Field Notes"}"#,
            r#"{"type":"space_deleted","spaceId":"s1"}"#,
            r#"{"type":"space_renamed","spaceId":"s1","name":"Renamed"}"#,
            r#"{"type":"space_access_changed","spaceId":"s1"}"#,
            r#"{"type":"user_storage_changed"}"#,
        ];
        for raw in samples {
            let event = StreamEvent::decode(raw).unwrap();
            assert!(
                !matches!(event, StreamEvent::Unknown { .. }),
                "{raw} decoded as unknown"
            );
        }
    }
}
