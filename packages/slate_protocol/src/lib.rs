//! Shared wire contract for the slate synchronization layer.
//!
//! Both the server relay and the client connection manager speak this
//! protocol: a closed tagged union of JSON envelopes plus the staleness
//! and throttling rules that govern the high-frequency event kinds.

mod envelope;
mod role;

pub use envelope::{
    BackplaneEnvelope, ConnectionStatus, CursorPayload, DecodeError, Decoded, ElementPayload,
    Envelope, EnvelopeKind, ErrorPayload, decode, now_ms,
};
pub use role::Role;

/// WebSocket close code sent when the connection credential is missing or
/// invalid. Sent before any message exchange.
pub const CLOSE_UNAUTHORIZED: u16 = 3000;

/// ERROR envelope status for messages rejected by the admission policy
/// (role absent or insufficient).
pub const ERROR_STATUS_FORBIDDEN: u16 = 4401;

/// Server-hop staleness cutoff for high-frequency envelopes (ms).
pub const DEFAULT_SERVER_STALE_MS: i64 = 5000;

/// Client-hop staleness cutoff for inbound FRAME_UPDATE envelopes (ms).
pub const DEFAULT_CLIENT_STALE_MS: i64 = 1000;

/// Minimum interval between client FRAME_UPDATE sends (ms).
pub const DEFAULT_FRAME_THROTTLE_MS: u64 = 50;
