//! Pub/sub backplane for cross-process channel fan-out.
//!
//! Each server process publishes admitted envelopes to a per-channel topic
//! and subscribes to the topics of channels with local subscribers. The
//! relay treats the backplane as best-effort: a publish failure degrades
//! the channel to single-process scope, it never fails the client send.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BackplaneError {
    #[error("backplane connection failed: {0}")]
    Connection(String),
    #[error("backplane publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("backplane subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// Callback invoked for every payload received on a subscribed topic.
/// Runs on the backplane's read task; must not block.
pub type TopicHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Transport seam between the relay and whatever carries messages across
/// server processes. One subscription per topic per client; re-subscribing
/// replaces the previous handler.
#[async_trait]
pub trait Backplane: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackplaneError>;
    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<(), BackplaneError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), BackplaneError>;
    async fn disconnect(&self) -> Result<(), BackplaneError>;
}

// =============================================================================
// In-process bus
// =============================================================================

#[derive(Default)]
struct BusState {
    // topic -> client id -> handler
    topics: HashMap<String, HashMap<u64, TopicHandler>>,
}

struct Bus {
    state: std::sync::Mutex<BusState>,
    next_client: AtomicU64,
}

/// In-memory backplane for single-process deployments and tests.
///
/// `peer()` attaches another client to the same bus, which is how tests
/// stand up multiple relays that see each other's publishes. Publishes
/// are delivered to every subscribed client, including the publisher;
/// origin filtering is the relay's job.
pub struct LocalBackplane {
    bus: Arc<Bus>,
    client_id: u64,
}

impl LocalBackplane {
    pub fn new() -> Self {
        let bus = Arc::new(Bus {
            state: std::sync::Mutex::new(BusState::default()),
            next_client: AtomicU64::new(1),
        });
        Self { bus, client_id: 0 }
    }

    /// Another client on the same bus.
    pub fn peer(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            client_id: self.bus.next_client.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for LocalBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for LocalBackplane {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackplaneError> {
        let handlers: Vec<TopicHandler> = {
            let state = self.bus.state.lock().unwrap();
            state
                .topics
                .get(topic)
                .map(|subs| subs.values().cloned().collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<(), BackplaneError> {
        let mut state = self.bus.state.lock().unwrap();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(self.client_id, handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackplaneError> {
        let mut state = self.bus.state.lock().unwrap();
        if let Some(subs) = state.topics.get_mut(topic) {
            subs.remove(&self.client_id);
            if subs.is_empty() {
                state.topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BackplaneError> {
        let mut state = self.bus.state.lock().unwrap();
        state.topics.retain(|_, subs| {
            subs.remove(&self.client_id);
            !subs.is_empty()
        });
        Ok(())
    }
}

// =============================================================================
// Redis pub/sub
// =============================================================================

/// Redis-backed backplane. Publishes go through one multiplexed connection;
/// each subscribed topic gets a dedicated pub/sub connection with a read
/// task that is cancelled on unsubscribe.
pub struct RedisBackplane {
    client: redis::Client,
    publish_conn: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    readers: tokio::sync::Mutex<HashMap<String, CancellationToken>>,
}

impl RedisBackplane {
    /// Parse and validate the URL. Connections are established lazily so a
    /// server can boot before its Redis is reachable.
    pub fn connect(url: &str) -> Result<Self, BackplaneError> {
        let client =
            redis::Client::open(url).map_err(|e| BackplaneError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            publish_conn: tokio::sync::Mutex::new(None),
            readers: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    async fn publisher(&self) -> Result<redis::aio::MultiplexedConnection, BackplaneError> {
        let mut guard = self.publish_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BackplaneError::Connection(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackplaneError> {
        let mut conn = self.publisher().await?;
        let result: Result<i64, redis::RedisError> = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            // Drop the cached connection so the next publish reconnects.
            *self.publish_conn.lock().await = None;
            return Err(BackplaneError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<(), BackplaneError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BackplaneError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BackplaneError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let token = CancellationToken::new();
        {
            let mut readers = self.readers.lock().await;
            if let Some(previous) = readers.insert(topic.to_string(), token.clone()) {
                previous.cancel();
            }
        }

        let topic_name = topic.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(topic = %topic_name, "backplane reader cancelled");
                        break;
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => handler(msg.get_payload_bytes().to_vec()),
                            None => {
                                warn!(topic = %topic_name, "backplane pub/sub stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BackplaneError> {
        if let Some(token) = self.readers.lock().await.remove(topic) {
            token.cancel();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BackplaneError> {
        for (_, token) in self.readers.lock().await.drain() {
            token.cancel();
        }
        *self.publish_conn.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector() -> (TopicHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: TopicHandler = Arc::new(move |payload| {
            sink.lock().unwrap().push(payload);
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn local_bus_delivers_to_all_clients() {
        let a = LocalBackplane::new();
        let b = a.peer();
        let (handler_a, seen_a) = collector();
        let (handler_b, seen_b) = collector();
        a.subscribe("channel:one", handler_a).await.unwrap();
        b.subscribe("channel:one", handler_b).await.unwrap();

        a.publish("channel:one", b"hello".to_vec()).await.unwrap();

        // Publisher is subscribed too; origin filtering happens upstream.
        assert_eq!(seen_a.lock().unwrap().len(), 1);
        assert_eq!(seen_b.lock().unwrap().as_slice(), &[b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn local_bus_scopes_by_topic() {
        let a = LocalBackplane::new();
        let (handler, seen) = collector();
        a.subscribe("channel:one", handler).await.unwrap();

        a.publish("channel:two", b"x".to_vec()).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_bus_unsubscribe_stops_delivery() {
        let a = LocalBackplane::new();
        let b = a.peer();
        let (handler, seen) = collector();
        b.subscribe("channel:one", handler).await.unwrap();
        b.unsubscribe("channel:one").await.unwrap();

        a.publish("channel:one", b"x".to_vec()).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_bus_resubscribe_replaces_handler() {
        let a = LocalBackplane::new();
        let (first, seen_first) = collector();
        let (second, seen_second) = collector();
        a.subscribe("t", first).await.unwrap();
        a.subscribe("t", second).await.unwrap();

        a.publish("t", b"x".to_vec()).await.unwrap();
        assert!(seen_first.lock().unwrap().is_empty());
        assert_eq!(seen_second.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_bus_disconnect_removes_all_subscriptions() {
        let a = LocalBackplane::new();
        let b = a.peer();
        let (handler, seen) = collector();
        b.subscribe("t1", handler.clone()).await.unwrap();
        b.subscribe("t2", handler).await.unwrap();
        b.disconnect().await.unwrap();

        a.publish("t1", b"x".to_vec()).await.unwrap();
        a.publish("t2", b"x".to_vec()).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn redis_backplane_rejects_bad_url() {
        assert!(RedisBackplane::connect("not a url").is_err());
    }
}
