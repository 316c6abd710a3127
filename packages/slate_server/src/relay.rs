//! Channel relay: per-channel fan-out with backplane bridging.
//!
//! A channel is a broadcast domain keyed by id. Local WebSocket sessions
//! register an outbound queue under a subscriber id; admitted envelopes are
//! fanned out to every local queue and published to the channel's backplane
//! topic so sessions parked on other server processes see them too. The
//! relay discards backplane messages that carry its own origin id, which is
//! what keeps a publish from echoing back to the process that sent it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use slate_protocol::{BackplaneEnvelope, Envelope};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::backplane::{Backplane, TopicHandler};
use crate::metrics::ServerMetrics;

/// One local session's outbound queue.
#[derive(Clone)]
struct LocalSubscriber {
    tx: mpsc::Sender<Envelope>,
    dropped: Arc<AtomicU64>,
}

type Registry = HashMap<String, HashMap<String, LocalSubscriber>>;

pub struct ChannelRelay {
    /// Stable identity of this process on the backplane, fixed at
    /// construction. Used for echo suppression.
    server_id: String,
    backplane: Arc<dyn Backplane>,
    channels: Arc<RwLock<Registry>>,
    /// Serializes first-subscriber/last-subscriber backplane transitions so
    /// a racing subscribe and unsubscribe cannot leave a channel with local
    /// subscribers but no backplane subscription.
    bridge: tokio::sync::Mutex<()>,
    metrics: Arc<ServerMetrics>,
}

fn topic(channel: &str) -> String {
    format!("slate:channel:{channel}")
}

impl ChannelRelay {
    pub fn new(
        server_id: impl Into<String>,
        backplane: Arc<dyn Backplane>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            backplane,
            channels: Arc::new(RwLock::new(HashMap::new())),
            bridge: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Register a local subscriber. The first subscriber on a channel opens
    /// the backplane subscription for that channel's topic. Re-subscribing
    /// under the same id replaces the previous queue.
    ///
    /// Backplane failures are logged, not returned: the channel still works
    /// for sessions on this process.
    pub async fn subscribe(&self, channel: &str, subscriber_id: &str, tx: mpsc::Sender<Envelope>) {
        let _bridge = self.bridge.lock().await;

        let opens_channel = {
            let mut channels = self.channels.write().unwrap();
            let subs = channels.entry(channel.to_string()).or_default();
            let first = subs.is_empty();
            subs.insert(
                subscriber_id.to_string(),
                LocalSubscriber {
                    tx,
                    dropped: Arc::new(AtomicU64::new(0)),
                },
            );
            first
        };

        if opens_channel {
            debug!(channel, "first local subscriber, opening backplane subscription");
            let handler = self.inbound_handler(channel);
            if let Err(e) = self.backplane.subscribe(&topic(channel), handler).await {
                warn!(channel, error = %e, "backplane subscribe failed, channel is single-process");
            }
        }
    }

    /// Remove a local subscriber. The last one out closes the channel's
    /// backplane subscription. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, channel: &str, subscriber_id: &str) {
        let _bridge = self.bridge.lock().await;

        let closes_channel = {
            let mut channels = self.channels.write().unwrap();
            match channels.get_mut(channel) {
                Some(subs) => {
                    subs.remove(subscriber_id);
                    if subs.is_empty() {
                        channels.remove(channel);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if closes_channel {
            debug!(channel, "last local subscriber left, closing backplane subscription");
            if let Err(e) = self.backplane.unsubscribe(&topic(channel)).await {
                warn!(channel, error = %e, "backplane unsubscribe failed");
            }
        }
    }

    /// Fan an envelope out to local subscribers, skipping `exclude` (the
    /// originating session already has the state it sent).
    pub fn deliver_local(&self, channel: &str, event: &Envelope, exclude: Option<&str>) {
        fan_out(&self.channels, &self.metrics, channel, event, exclude);
    }

    /// Publish an admitted envelope to the channel's backplane topic.
    /// Failures degrade the envelope to single-process scope; they are
    /// counted and logged but never surfaced to the sending client.
    pub async fn publish(&self, channel: &str, event: &Envelope) {
        let wrapped = BackplaneEnvelope::new(self.server_id.clone(), event.clone());
        let bytes = match wrapped.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!(channel, error = %e, "failed to encode backplane envelope");
                self.metrics.backplane_publish_failure();
                return;
            }
        };
        if let Err(e) = self.backplane.publish(&topic(channel), bytes).await {
            warn!(channel, error = %e, "backplane publish failed");
            self.metrics.backplane_publish_failure();
        }
    }

    /// Tear down every channel and disconnect from the backplane.
    /// Safe to call more than once.
    pub async fn destroy(&self) {
        let _bridge = self.bridge.lock().await;

        let drained: Vec<String> = {
            let mut channels = self.channels.write().unwrap();
            channels.drain().map(|(name, _)| name).collect()
        };
        for channel in &drained {
            if let Err(e) = self.backplane.unsubscribe(&topic(channel)).await {
                warn!(channel, error = %e, "backplane unsubscribe failed during shutdown");
            }
        }
        if let Err(e) = self.backplane.disconnect().await {
            warn!(error = %e, "backplane disconnect failed");
        }
    }

    pub fn local_subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }

    /// Handler for messages arriving on a channel's backplane topic.
    fn inbound_handler(&self, channel: &str) -> TopicHandler {
        let channels = self.channels.clone();
        let metrics = self.metrics.clone();
        let server_id = self.server_id.clone();
        let channel = channel.to_string();
        Arc::new(move |payload| {
            let wrapped = match BackplaneEnvelope::from_bytes(&payload) {
                Ok(w) => w,
                Err(e) => {
                    warn!(channel, error = %e, "undecodable backplane payload");
                    return;
                }
            };
            // Our own publish coming back around.
            if wrapped.origin_server_id == server_id {
                return;
            }
            metrics.backplane_message_received();
            fan_out(&channels, &metrics, &channel, &wrapped.event, None);
        })
    }
}

/// Push one envelope onto every matching local queue.
///
/// Backpressure policy: a full queue drops ephemeral envelopes on the floor
/// (counted), while durable envelopes are handed to a task that waits for
/// capacity. A saturated subscriber can therefore see durable updates
/// arrive late, but never lose them short of disconnect.
fn fan_out(
    channels: &Arc<RwLock<Registry>>,
    metrics: &Arc<ServerMetrics>,
    channel: &str,
    event: &Envelope,
    exclude: Option<&str>,
) {
    let targets: Vec<(String, LocalSubscriber)> = {
        let channels = channels.read().unwrap();
        match channels.get(channel) {
            Some(subs) => subs
                .iter()
                .filter(|(id, _)| exclude != Some(id.as_str()))
                .map(|(id, sub)| (id.clone(), sub.clone()))
                .collect(),
            None => return,
        }
    };

    for (subscriber_id, sub) in targets {
        match sub.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                if event.is_durable() {
                    let tx = sub.tx.clone();
                    tokio::spawn(async move {
                        // Receiver gone mid-wait is fine; session teardown
                        // unsubscribes.
                        let _ = tx.send(event).await;
                    });
                } else {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    metrics.delivery_dropped();
                    if dropped.is_multiple_of(100) {
                        warn!(channel, subscriber_id, dropped, "slow subscriber, dropping ephemeral envelopes");
                    } else {
                        trace!(channel, subscriber_id, kind = %event.kind(), "dropped ephemeral envelope for slow subscriber");
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(channel, subscriber_id, "subscriber queue closed");
            }
        }
    }
}
