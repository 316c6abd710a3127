//! Client-side connection manager for the slate synchronization layer.
//!
//! Owns one WebSocket per canvas channel and hides its lifecycle from the
//! application: messages sent while offline are queued and flushed in
//! order on reconnect, high-frequency updates are throttled and
//! staleness-filtered, and listeners receive locally synthesized
//! CONNECTION envelopes alongside remote traffic.
//!
//! The manager is transport-agnostic behind the [`Transport`] trait;
//! [`WsTransport`] is the production implementation.

mod manager;
mod transport;

#[cfg(test)]
pub mod test_support;

pub use manager::{ClientConfig, ConnState, ConnectionManager, Listener};
pub use transport::{LinkSink, LinkStream, Transport, TransportError, WsTransport};
