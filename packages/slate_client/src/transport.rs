//! Transport seam between the connection manager and the network.
//!
//! The manager drives a connected link from one task, selecting over
//! outbound traffic and inbound frames, so a connect yields a split
//! sink/stream pair rather than a single duplex handle.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Recv(String),
}

/// Dials one channel and yields a connected link.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        channel_id: &str,
    ) -> Result<(Box<dyn LinkSink>, Box<dyn LinkStream>), TransportError>;
}

/// Write half of a connected link.
#[async_trait]
pub trait LinkSink: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    /// Best-effort close; errors are irrelevant at this point.
    async fn close(&mut self);
}

/// Read half of a connected link. `None` means the peer closed.
#[async_trait]
pub trait LinkStream: Send {
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
}

/// WebSocket transport against a relay server.
///
/// `base_url` is the server origin (`ws://host:port`); the channel id is
/// appended as `/ws/{channel_id}`. The credential rides in the
/// `slate_session` cookie, matching what the server's gate reads.
pub struct WsTransport {
    base_url: String,
    credential: Option<String>,
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    fn channel_url(&self, channel_id: &str) -> String {
        format!("{}/ws/{}", self.base_url.trim_end_matches('/'), channel_id)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        channel_id: &str,
    ) -> Result<(Box<dyn LinkSink>, Box<dyn LinkStream>), TransportError> {
        let mut request = self
            .channel_url(channel_id)
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Some(credential) = &self.credential {
            let cookie = format!("slate_session={credential}");
            request.headers_mut().insert(
                header::COOKIE,
                HeaderValue::from_str(&cookie)
                    .map_err(|e| TransportError::Connect(e.to_string()))?,
            );
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = socket.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsStream { stream })))
    }
}

struct WsSink {
    sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
}

#[async_trait]
impl LinkSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

struct WsStream {
    stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl LinkStream for WsStream {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_string())),
                Ok(Message::Close(_)) => return None,
                // Pings are answered by the library; binary frames are not
                // part of the protocol.
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Recv(e.to_string()))),
            }
        }
        None
    }
}
