//! WebSocket session handler.
//!
//! `GET /ws/{channel_id}` with a `slate_session` cookie. Authentication
//! happens before the relay is touched; an unauthenticated socket is
//! accepted and then immediately closed with code 3000 so browser clients
//! can tell "refused" apart from "network died".

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
    },
    http::{HeaderMap, header},
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use slate_protocol::{CLOSE_UNAUTHORIZED, Decoded, Envelope, now_ms};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::AppState;
use crate::session::{Admission, AdmissionPolicy, DiscardReason, Session};

/// Cookie carrying the connection credential.
pub const SESSION_COOKIE: &str = "slate_session";

pub async fn ws_handler(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = session_cookie(&headers);
    ws.on_upgrade(move |socket| handle_session(socket, state, channel_id, credential))
}

/// Pull the session credential out of the Cookie header.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

async fn handle_session(
    mut socket: WebSocket,
    state: AppState,
    channel_id: String,
    credential: Option<String>,
) {
    let principal = match credential {
        Some(c) => state.auth.authenticate(&c).await,
        None => None,
    };
    let Some(principal) = principal else {
        info!(channel = %channel_id, "refusing unauthenticated connection");
        state.metrics.auth_rejection();
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: Utf8Bytes::from_static("unauthorized"),
            })))
            .await;
        return;
    };

    // Role is resolved once, up front, so the possibly-slow authorization
    // lookup never runs inside the message loop.
    let role = state.auth.role_for(&channel_id, &principal).await;
    let session = Session::new(channel_id.clone(), principal, role);
    let connection_id = session.connection_id.clone();

    info!(
        channel = %channel_id,
        connection = %connection_id,
        principal = %session.principal,
        role = ?session.role,
        "session opened"
    );
    state.metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Queue of envelopes bound for this socket; the relay fans out into it.
    let (tx, mut rx) = mpsc::channel::<Envelope>(state.sync.send_channel_capacity);
    state
        .relay
        .subscribe(&channel_id, &connection_id, tx.clone())
        .await;

    // Task to send queued envelopes to the WebSocket
    let sender_task = async move {
        while let Some(event) = rx.recv().await {
            let json = match event.encode() {
                Ok(j) => j,
                Err(e) => {
                    error!("failed to serialize envelope: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Task to gate and broadcast incoming envelopes
    let policy = AdmissionPolicy::new(state.sync.stale_threshold_ms);
    let relay = state.relay.clone();
    let metrics = state.metrics.clone();
    let input_channel = channel_id.clone();
    let input_connection = connection_id.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    metrics.message_received();
                    match slate_protocol::decode(&text) {
                        Ok(Decoded::Event(event)) => {
                            match policy.admit(&session, event, now_ms()) {
                                Admission::Forward(event) => {
                                    metrics.message_forwarded();
                                    // Everyone local except the sender, then
                                    // the rest of the fleet.
                                    relay.deliver_local(
                                        &input_channel,
                                        &event,
                                        Some(&input_connection),
                                    );
                                    relay.publish(&input_channel, &event).await;
                                }
                                Admission::Reject(error) => {
                                    metrics.message_rejected();
                                    if tx.send(error).await.is_err() {
                                        break;
                                    }
                                }
                                Admission::Discard(DiscardReason::Stale { age_ms }) => {
                                    metrics.message_discarded_stale();
                                    trace!(age_ms, "discarding stale high-frequency envelope");
                                }
                                Admission::Discard(DiscardReason::ReservedKind) => {
                                    trace!("dropping reserved envelope kind from client");
                                }
                            }
                        }
                        Ok(Decoded::Unknown(kind)) => {
                            debug!(kind, "ignoring unknown envelope type");
                        }
                        Err(e) => {
                            metrics.message_malformed();
                            warn!(error = %e, "dropping malformed envelope");
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                // Pings are answered by axum; binary frames are not part of
                // the protocol.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
                Err(e) => {
                    debug!(error = %e, "websocket receive error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("sender task ended"),
        _ = input_task => debug!("input task ended"),
    }

    state.relay.unsubscribe(&channel_id, &connection_id).await;
    state.metrics.connection_closed();
    info!(channel = %channel_id, connection = %connection_id, "session closed");
}
