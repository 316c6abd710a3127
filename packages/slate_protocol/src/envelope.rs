//! Envelope types exchanged over a client↔server connection.
//!
//! Every message in either direction is one JSON object tagged by `type`.
//! Receivers must ignore unknown `type` values (forward compatibility), so
//! decoding goes through [`decode`] rather than a bare serde call.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current wall-clock time in epoch milliseconds.
///
/// Envelope timestamps are producer wall clocks used purely for staleness
/// decisions, never as sequence numbers.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A canvas element as carried by durable and frame envelopes.
///
/// Only `id` is interpreted by the sync layer; everything else is an opaque
/// body owned by the persistence collaborator and must round-trip
/// losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementPayload {
    pub id: String,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

/// Cursor position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub x: f64,
    pub y: f64,
}

/// Connection status announcements, synthesized locally by the client's
/// connection manager. Never sent over the wire by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Failed,
}

/// ERROR envelope payload, server→client only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The closed union of wire messages.
///
/// Durable kinds (`SHAPE_CREATE`/`SHAPE_UPDATE`/`SHAPE_DELETE`) carry state
/// the route layer persists before broadcast. `FRAME_UPDATE` and
/// `CURSOR_SYNC` are ephemeral and subject to staleness discard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Envelope {
    #[serde(rename = "SHAPE_CREATE")]
    ShapeCreate {
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        payload: ElementPayload,
    },
    #[serde(rename = "SHAPE_UPDATE")]
    ShapeUpdate {
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        payload: ElementPayload,
    },
    #[serde(rename = "SHAPE_DELETE")]
    ShapeDelete {
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        payload: ElementPayload,
    },
    /// In-progress drag/resize snapshot. High-frequency, never persisted.
    #[serde(rename = "FRAME_UPDATE")]
    FrameUpdate {
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        payload: ElementPayload,
    },
    /// Presence: cursor position. High-frequency, never persisted.
    #[serde(rename = "CURSOR_SYNC")]
    CursorSync {
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        payload: CursorPayload,
    },
    #[serde(rename = "CONNECTION")]
    Connection {
        timestamp: i64,
        payload: ConnectionStatus,
    },
    #[serde(rename = "ERROR")]
    Error { timestamp: i64, payload: ErrorPayload },
}

/// Fieldless discriminant for an [`Envelope`], used to key listener
/// registries and classify admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    ShapeCreate,
    ShapeUpdate,
    ShapeDelete,
    FrameUpdate,
    CursorSync,
    Connection,
    Error,
}

impl EnvelopeKind {
    /// All kinds, in wire order.
    pub const ALL: [EnvelopeKind; 7] = [
        EnvelopeKind::ShapeCreate,
        EnvelopeKind::ShapeUpdate,
        EnvelopeKind::ShapeDelete,
        EnvelopeKind::FrameUpdate,
        EnvelopeKind::CursorSync,
        EnvelopeKind::Connection,
        EnvelopeKind::Error,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            EnvelopeKind::ShapeCreate => "SHAPE_CREATE",
            EnvelopeKind::ShapeUpdate => "SHAPE_UPDATE",
            EnvelopeKind::ShapeDelete => "SHAPE_DELETE",
            EnvelopeKind::FrameUpdate => "FRAME_UPDATE",
            EnvelopeKind::CursorSync => "CURSOR_SYNC",
            EnvelopeKind::Connection => "CONNECTION",
            EnvelopeKind::Error => "ERROR",
        }
    }

    pub fn from_wire(name: &str) -> Option<EnvelopeKind> {
        EnvelopeKind::ALL.iter().copied().find(|k| k.wire_name() == name)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::ShapeCreate { .. } => EnvelopeKind::ShapeCreate,
            Envelope::ShapeUpdate { .. } => EnvelopeKind::ShapeUpdate,
            Envelope::ShapeDelete { .. } => EnvelopeKind::ShapeDelete,
            Envelope::FrameUpdate { .. } => EnvelopeKind::FrameUpdate,
            Envelope::CursorSync { .. } => EnvelopeKind::CursorSync,
            Envelope::Connection { .. } => EnvelopeKind::Connection,
            Envelope::Error { .. } => EnvelopeKind::Error,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Envelope::ShapeCreate { timestamp, .. }
            | Envelope::ShapeUpdate { timestamp, .. }
            | Envelope::ShapeDelete { timestamp, .. }
            | Envelope::FrameUpdate { timestamp, .. }
            | Envelope::CursorSync { timestamp, .. }
            | Envelope::Connection { timestamp, .. }
            | Envelope::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Re-stamp the producer timestamp (the connection manager stamps at
    /// send time, not construction time).
    pub fn set_timestamp(&mut self, ts: i64) {
        match self {
            Envelope::ShapeCreate { timestamp, .. }
            | Envelope::ShapeUpdate { timestamp, .. }
            | Envelope::ShapeDelete { timestamp, .. }
            | Envelope::FrameUpdate { timestamp, .. }
            | Envelope::CursorSync { timestamp, .. }
            | Envelope::Connection { timestamp, .. }
            | Envelope::Error { timestamp, .. } => *timestamp = ts,
        }
    }

    /// Age relative to `now` in milliseconds. Clock skew can make this
    /// negative; staleness checks only compare against positive cutoffs.
    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.timestamp()
    }

    /// Durable envelopes are persisted by the route layer and are never
    /// discarded for staleness.
    pub fn is_durable(&self) -> bool {
        matches!(
            self.kind(),
            EnvelopeKind::ShapeCreate
                | EnvelopeKind::ShapeUpdate
                | EnvelopeKind::ShapeDelete
                | EnvelopeKind::Connection
        )
    }

    /// High-frequency envelopes may be silently dropped under the
    /// staleness rules.
    pub fn is_high_frequency(&self) -> bool {
        matches!(
            self.kind(),
            EnvelopeKind::FrameUpdate | EnvelopeKind::CursorSync
        )
    }

    /// Override the producer-supplied user id with the session principal.
    /// No-op for CONNECTION and ERROR, which carry no user identity.
    pub fn set_user_id(&mut self, principal: &str) {
        match self {
            Envelope::ShapeCreate { user_id, .. }
            | Envelope::ShapeUpdate { user_id, .. }
            | Envelope::ShapeDelete { user_id, .. }
            | Envelope::FrameUpdate { user_id, .. }
            | Envelope::CursorSync { user_id, .. } => *user_id = Some(principal.to_string()),
            Envelope::Connection { .. } | Envelope::Error { .. } => {}
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Envelope::ShapeCreate { user_id, .. }
            | Envelope::ShapeUpdate { user_id, .. }
            | Envelope::ShapeDelete { user_id, .. }
            | Envelope::FrameUpdate { user_id, .. }
            | Envelope::CursorSync { user_id, .. } => user_id.as_deref(),
            Envelope::Connection { .. } | Envelope::Error { .. } => None,
        }
    }

    /// Build an ERROR envelope stamped with the current time.
    pub fn error(status: u16, message: impl Into<String>) -> Envelope {
        Envelope::Error {
            timestamp: now_ms(),
            payload: ErrorPayload {
                status,
                message: Some(message.into()),
                data: None,
            },
        }
    }

    /// Build a locally-synthesized CONNECTION status envelope.
    pub fn connection(status: ConnectionStatus) -> Envelope {
        Envelope::Connection {
            timestamp: now_ms(),
            payload: status,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome of decoding an inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(Envelope),
    /// A well-formed envelope with a `type` this build does not know.
    /// Receivers ignore it; a newer peer may be speaking a superset.
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope is missing a string `type` field")]
    MissingType,
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode one wire frame, distinguishing unknown kinds from malformed
/// frames. Unknown kinds are not errors.
pub fn decode(text: &str) -> Result<Decoded, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(DecodeError::MissingType)?;
    if EnvelopeKind::from_wire(kind).is_none() {
        return Ok(Decoded::Unknown(kind.to_string()));
    }
    Ok(Decoded::Event(serde_json::from_value(value)?))
}

/// The only shape that crosses the backplane: an envelope tagged with the
/// stable identity of the server process that published it, so a relay can
/// discard its own echoes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackplaneEnvelope {
    pub origin_server_id: String,
    pub event: Envelope,
}

impl BackplaneEnvelope {
    pub fn new(origin_server_id: impl Into<String>, event: Envelope) -> Self {
        Self {
            origin_server_id: origin_server_id.into(),
            event,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: &str) -> ElementPayload {
        let mut body = serde_json::Map::new();
        body.insert("x".into(), serde_json::json!(10));
        body.insert("y".into(), serde_json::json!(20));
        body.insert("kind".into(), serde_json::json!("rect"));
        ElementPayload {
            id: id.to_string(),
            body,
        }
    }

    #[test]
    fn shape_create_from_raw_json() {
        let json = r#"{"type":"SHAPE_CREATE","timestamp":1700000000000,"userId":"u-1","payload":{"id":"e1","x":1,"y":2}}"#;
        match decode(json).unwrap() {
            Decoded::Event(Envelope::ShapeCreate {
                timestamp,
                user_id,
                payload,
            }) => {
                assert_eq!(timestamp, 1_700_000_000_000);
                assert_eq!(user_id.as_deref(), Some("u-1"));
                assert_eq!(payload.id, "e1");
                assert_eq!(payload.body["x"], serde_json::json!(1));
            }
            other => panic!("expected ShapeCreate, got {other:?}"),
        }
    }

    #[test]
    fn user_id_omitted_when_absent() {
        let env = Envelope::ShapeDelete {
            timestamp: 5,
            user_id: None,
            payload: element("e2"),
        };
        let json = env.encode().unwrap();
        assert!(!json.contains("userId"));
        assert!(json.contains("SHAPE_DELETE"));
    }

    #[test]
    fn element_payload_round_trips_losslessly() {
        let raw = r#"{"type":"SHAPE_UPDATE","timestamp":1,"payload":{"id":"e1","nested":{"a":[1,2,3]},"label":"héllo"}}"#;
        let Decoded::Event(env) = decode(raw).unwrap() else {
            panic!("expected event");
        };
        let reencoded = env.encode().unwrap();
        let back = decode(&reencoded).unwrap();
        assert_eq!(Decoded::Event(env), back);
    }

    #[test]
    fn cursor_sync_round_trip() {
        let env = Envelope::CursorSync {
            timestamp: 42,
            user_id: Some("u-2".into()),
            payload: CursorPayload { x: 3.5, y: -7.25 },
        };
        let json = env.encode().unwrap();
        assert!(json.contains("CURSOR_SYNC"));
        let Decoded::Event(back) = decode(&json).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(env, back);
    }

    #[test]
    fn connection_status_wire_names() {
        let env = Envelope::connection(ConnectionStatus::Failed);
        let json = env.encode().unwrap();
        assert!(json.contains(r#""payload":"failed""#));
    }

    #[test]
    fn error_payload_optional_fields_skipped() {
        let env = Envelope::Error {
            timestamp: 1,
            payload: ErrorPayload {
                status: 4401,
                message: None,
                data: None,
            },
        };
        let json = env.encode().unwrap();
        assert!(!json.contains("message"));
        assert!(!json.contains("data"));
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let json = r#"{"type":"PING","timestamp":1}"#;
        match decode(json).unwrap() {
            Decoded::Unknown(kind) => assert_eq!(kind, "PING"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn missing_type_is_malformed() {
        let json = r#"{"timestamp":1,"payload":{}}"#;
        assert!(matches!(decode(json), Err(DecodeError::MissingType)));
    }

    #[test]
    fn non_string_type_is_malformed() {
        let json = r#"{"type":7,"timestamp":1}"#;
        assert!(matches!(decode(json), Err(DecodeError::MissingType)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode("not json"), Err(DecodeError::Json(_))));
    }

    #[test]
    fn known_type_with_bad_fields_is_malformed() {
        // Known tag but payload shape is wrong for CURSOR_SYNC.
        let json = r#"{"type":"CURSOR_SYNC","timestamp":1,"payload":{"x":"left"}}"#;
        assert!(matches!(decode(json), Err(DecodeError::Json(_))));
    }

    #[test]
    fn durable_and_high_frequency_classification() {
        let durable = [
            Envelope::ShapeCreate {
                timestamp: 0,
                user_id: None,
                payload: element("a"),
            },
            Envelope::ShapeUpdate {
                timestamp: 0,
                user_id: None,
                payload: element("a"),
            },
            Envelope::ShapeDelete {
                timestamp: 0,
                user_id: None,
                payload: element("a"),
            },
            Envelope::connection(ConnectionStatus::Connected),
        ];
        for env in durable {
            assert!(env.is_durable(), "{:?} should be durable", env.kind());
            assert!(!env.is_high_frequency());
        }

        let ephemeral = [
            Envelope::FrameUpdate {
                timestamp: 0,
                user_id: None,
                payload: element("a"),
            },
            Envelope::CursorSync {
                timestamp: 0,
                user_id: None,
                payload: CursorPayload { x: 0.0, y: 0.0 },
            },
        ];
        for env in ephemeral {
            assert!(env.is_high_frequency());
            assert!(!env.is_durable());
        }
    }

    #[test]
    fn set_user_id_overrides_spoofed_value() {
        let mut env = Envelope::ShapeCreate {
            timestamp: 0,
            user_id: Some("impostor".into()),
            payload: element("e1"),
        };
        env.set_user_id("real-principal");
        assert_eq!(env.user_id(), Some("real-principal"));
    }

    #[test]
    fn set_user_id_noop_on_connection_and_error() {
        let mut conn = Envelope::connection(ConnectionStatus::Connected);
        conn.set_user_id("u");
        assert_eq!(conn.user_id(), None);

        let mut err = Envelope::error(4401, "nope");
        err.set_user_id("u");
        assert_eq!(err.user_id(), None);
    }

    #[test]
    fn age_ms_handles_clock_skew() {
        let env = Envelope::CursorSync {
            timestamp: 1000,
            user_id: None,
            payload: CursorPayload { x: 0.0, y: 0.0 },
        };
        assert_eq!(env.age_ms(7000), 6000);
        // Producer clock ahead of ours: negative age, never stale.
        assert_eq!(env.age_ms(500), -500);
    }

    #[test]
    fn kind_wire_names_round_trip() {
        for kind in EnvelopeKind::ALL {
            assert_eq!(EnvelopeKind::from_wire(kind.wire_name()), Some(kind));
        }
        assert_eq!(EnvelopeKind::from_wire("NOPE"), None);
    }

    #[test]
    fn backplane_envelope_round_trip() {
        let wrapped = BackplaneEnvelope::new(
            "srv-a",
            Envelope::ShapeUpdate {
                timestamp: 9,
                user_id: Some("u-1".into()),
                payload: element("e9"),
            },
        );
        let bytes = wrapped.to_bytes().unwrap();
        let back = BackplaneEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(back.origin_server_id, "srv-a");
        assert_eq!(back, wrapped);
    }

    #[test]
    fn backplane_envelope_wire_shape() {
        let wrapped = BackplaneEnvelope::new("srv-a", Envelope::connection(ConnectionStatus::Connected));
        let json: serde_json::Value =
            serde_json::from_slice(&wrapped.to_bytes().unwrap()).unwrap();
        assert_eq!(json["originServerId"], "srv-a");
        assert_eq!(json["event"]["type"], "CONNECTION");
    }
}
