//! Connection lifecycle, offline queueing, and listener dispatch.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slate_protocol::{ConnectionStatus, Decoded, Envelope, EnvelopeKind, now_ms};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::transport::{LinkSink, LinkStream, Transport};

/// Listener invoked for every delivered envelope of a subscribed kind.
/// Runs on the connection's read task; panics are caught and logged.
pub type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Connection lifecycle. `Destroyed` is absorbing: no operation leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    Open,
    Closing,
    Destroyed,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Leading-edge throttle for outbound FRAME_UPDATE envelopes.
    pub frame_throttle: Duration,
    /// Inbound FRAME_UPDATE envelopes older than this are dropped; a
    /// fresher frame is already behind them.
    pub frame_stale_ms: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            disconnect_timeout: Duration::from_millis(5000),
            reconnect_delay: Duration::from_millis(3000),
            max_reconnect_attempts: 100,
            frame_throttle: Duration::from_millis(
                slate_protocol::DEFAULT_FRAME_THROTTLE_MS,
            ),
            frame_stale_ms: slate_protocol::DEFAULT_CLIENT_STALE_MS,
        }
    }
}

/// Manages one channel's WebSocket on behalf of the application.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    channel_id: Mutex<Option<String>>,
    state: Mutex<ConnState>,
    /// Envelopes accepted while offline, flushed in order on reconnect.
    queue: Mutex<VecDeque<Envelope>>,
    listeners: Mutex<HashMap<EnvelopeKind, Vec<Listener>>>,
    /// Outbound lane into the live connection's driver task.
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    conn_token: Mutex<Option<CancellationToken>>,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    attempts: AtomicU32,
    /// Serializes concurrent `initialize` calls; later callers wait for the
    /// in-flight one.
    init_lock: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
    last_frame_sent: Mutex<Option<tokio::time::Instant>>,
    destroyed: CancellationToken,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                channel_id: Mutex::new(None),
                state: Mutex::new(ConnState::Closed),
                queue: Mutex::new(VecDeque::new()),
                listeners: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                conn_token: Mutex::new(None),
                driver: tokio::sync::Mutex::new(None),
                attempts: AtomicU32::new(0),
                init_lock: tokio::sync::Mutex::new(()),
                reconnecting: AtomicBool::new(false),
                last_frame_sent: Mutex::new(None),
                destroyed: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.lock().unwrap()
    }

    /// Bind to a channel and open the connection. Calling again for the
    /// same channel while connected is a no-op; calling with a different
    /// channel closes the old connection before dialing the new one.
    /// Single-flight: a call that arrives while another initialization is
    /// running waits for it to finish instead of racing to open a second
    /// socket, then usually no-ops against the now-open connection.
    pub async fn initialize(&self, channel_id: &str) {
        let inner = &self.inner;
        if inner.destroyed.is_cancelled() {
            debug!("initialize after destroy ignored");
            return;
        }
        let _in_flight = inner.init_lock.lock().await;
        self.initialize_inner(channel_id).await;
    }

    async fn initialize_inner(&self, channel_id: &str) {
        let inner = &self.inner;
        let switching = {
            let channel = inner.channel_id.lock().unwrap();
            match channel.as_deref() {
                Some(current) if current == channel_id => {
                    if matches!(
                        *inner.state.lock().unwrap(),
                        ConnState::Open | ConnState::Connecting
                    ) {
                        debug!(channel_id, "already connected");
                        return;
                    }
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if switching {
            debug!(channel_id, "switching channels, closing the old connection");
            self.disconnect().await;
            // Queued envelopes belong to the old channel.
            inner.queue.lock().unwrap().clear();
            inner.attempts.store(0, Ordering::SeqCst);
        }
        *inner.channel_id.lock().unwrap() = Some(channel_id.to_string());
        if !connect_once(inner).await {
            schedule_reconnect(inner);
        }
    }

    /// Hand an envelope to the sync layer.
    ///
    /// The timestamp is stamped here, at the moment the envelope leaves the
    /// application, so queue dwell time counts against staleness. While the
    /// connection is down the envelope is queued; FRAME_UPDATE envelopes
    /// are throttled to one per throttle window, keeping the first of each
    /// burst.
    pub fn send(&self, mut event: Envelope) {
        let inner = &self.inner;
        if inner.destroyed.is_cancelled() {
            debug!("send after destroy ignored");
            return;
        }

        if event.kind() == EnvelopeKind::FrameUpdate {
            let mut last = inner.last_frame_sent.lock().unwrap();
            let now = tokio::time::Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < inner.config.frame_throttle {
                    trace!("frame update throttled");
                    return;
                }
            }
            *last = Some(now);
        }

        event.set_timestamp(now_ms());

        let state = *inner.state.lock().unwrap();
        if state == ConnState::Open {
            if let Some(tx) = inner.outbound.lock().unwrap().as_ref() {
                match tx.send(event) {
                    Ok(()) => return,
                    // Driver just died; fall through to the queue.
                    Err(err) => event = err.0,
                }
            }
        }

        inner.queue.lock().unwrap().push_back(event);
        if state == ConnState::Closed {
            schedule_reconnect(inner);
        }
    }

    /// Register a listener for one envelope kind. Listener sets have set
    /// semantics by pointer identity: registering the same `Arc` twice for
    /// one kind is a no-op, while the same `Arc` may be registered for
    /// several kinds and removed individually.
    pub fn subscribe(&self, kind: EnvelopeKind, listener: Listener) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        let list = listeners.entry(kind).or_default();
        if !list.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            list.push(listener);
        }
    }

    /// Remove a previously registered listener (pointer identity).
    pub fn unsubscribe(&self, kind: EnvelopeKind, listener: &Listener) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        if let Some(list) = listeners.get_mut(&kind) {
            list.retain(|l| !Arc::ptr_eq(l, listener));
            if list.is_empty() {
                listeners.remove(&kind);
            }
        }
    }

    /// Hint from the application that the surface became visible or hidden.
    /// Becoming visible while disconnected retries immediately-ish, with a
    /// fresh attempt budget; the tab may have been asleep long past the
    /// give-up point.
    pub fn notify_visibility(&self, visible: bool) {
        let inner = &self.inner;
        if !visible || inner.destroyed.is_cancelled() {
            return;
        }
        let initialized = inner.channel_id.lock().unwrap().is_some();
        if initialized && *inner.state.lock().unwrap() == ConnState::Closed {
            debug!("surface visible again, retrying connection");
            inner.attempts.store(0, Ordering::SeqCst);
            schedule_reconnect(inner);
        }
    }

    /// Close the connection without tearing the manager down. A later
    /// `send` or visibility change will reconnect.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if inner.destroyed.is_cancelled() {
            return;
        }
        if matches!(
            *inner.state.lock().unwrap(),
            ConnState::Closed | ConnState::Closing
        ) {
            return;
        }
        set_state(inner, ConnState::Closing);
        if let Some(token) = inner.conn_token.lock().unwrap().take() {
            token.cancel();
        }
        let handle = inner.driver.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(inner.config.disconnect_timeout, handle)
                .await
                .is_err()
            {
                warn!("connection driver did not stop within the close timeout");
            }
        }
        set_state(inner, ConnState::Closed);
        emit(inner, &Envelope::connection(ConnectionStatus::Disconnected));
    }

    /// Permanently tear the manager down. Idempotent; every later call on
    /// this manager is a no-op.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.is_cancelled() {
            return;
        }
        inner.destroyed.cancel();
        set_state(inner, ConnState::Destroyed);
        if let Some(token) = inner.conn_token.lock().unwrap().take() {
            token.cancel();
        }
        let handle = inner.driver.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(inner.config.disconnect_timeout, handle).await;
        }
        inner.queue.lock().unwrap().clear();
        inner.listeners.lock().unwrap().clear();
        debug!("connection manager destroyed");
    }

    /// Number of envelopes waiting for the next connection.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

/// `Destroyed` is absorbing.
fn set_state(inner: &Inner, next: ConnState) {
    let mut state = inner.state.lock().unwrap();
    if *state != ConnState::Destroyed {
        *state = next;
    }
}

/// One connection attempt. Returns true when a connection is live and its
/// driver task is running.
async fn connect_once(inner: &Arc<Inner>) -> bool {
    let Some(channel) = inner.channel_id.lock().unwrap().clone() else {
        return false;
    };
    set_state(inner, ConnState::Connecting);

    let attempt = tokio::time::timeout(
        inner.config.connect_timeout,
        inner.transport.connect(&channel),
    )
    .await;
    let (sink, stream) = match attempt {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(channel = %channel, error = %e, "connect failed");
            set_state(inner, ConnState::Closed);
            return false;
        }
        Err(_) => {
            warn!(channel = %channel, "connect timed out");
            set_state(inner, ConnState::Closed);
            return false;
        }
    };
    if inner.destroyed.is_cancelled() {
        return false;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();

    // Flush the offline queue in arrival order before the sender becomes
    // visible to `send`, so queued envelopes keep their place ahead of
    // anything sent once the state reads Open (including sends from a
    // connected-listener).
    {
        let mut queue = inner.queue.lock().unwrap();
        for event in queue.drain(..) {
            let _ = tx.send(event);
        }
        *inner.outbound.lock().unwrap() = Some(tx);
    }
    *inner.conn_token.lock().unwrap() = Some(token.clone());
    set_state(inner, ConnState::Open);
    inner.attempts.store(0, Ordering::SeqCst);
    emit(inner, &Envelope::connection(ConnectionStatus::Connected));

    let handle = tokio::spawn(drive(inner.clone(), sink, stream, rx, token));
    *inner.driver.lock().await = Some(handle);
    true
}

enum DriverEnd {
    /// We closed it (disconnect/destroy); no reconnect.
    Local,
    /// The link died underneath us.
    Remote,
}

async fn drive(
    inner: Arc<Inner>,
    mut sink: Box<dyn LinkSink>,
    mut stream: Box<dyn LinkStream>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    token: CancellationToken,
) {
    let end = loop {
        tokio::select! {
            _ = token.cancelled() => break DriverEnd::Local,
            _ = inner.destroyed.cancelled() => break DriverEnd::Local,
            outbound = rx.recv() => match outbound {
                Some(event) => match event.encode() {
                    Ok(json) => {
                        if let Err(e) = sink.send(json).await {
                            warn!(error = %e, "send failed, connection is gone");
                            break DriverEnd::Remote;
                        }
                    }
                    Err(e) => error!("failed to serialize envelope: {e}"),
                },
                None => break DriverEnd::Local,
            },
            inbound = stream.recv() => match inbound {
                Some(Ok(text)) => dispatch(&inner, &text),
                Some(Err(e)) => {
                    debug!(error = %e, "receive error, connection is gone");
                    break DriverEnd::Remote;
                }
                None => break DriverEnd::Remote,
            },
        }
    };

    sink.close().await;
    *inner.outbound.lock().unwrap() = None;

    if matches!(end, DriverEnd::Remote) && !inner.destroyed.is_cancelled() {
        set_state(&inner, ConnState::Closed);
        emit(&inner, &Envelope::connection(ConnectionStatus::Disconnected));
        schedule_reconnect(&inner);
    }
}

/// Decode one inbound frame and deliver it to listeners.
fn dispatch(inner: &Arc<Inner>, text: &str) {
    match slate_protocol::decode(text) {
        Ok(Decoded::Event(event)) => {
            if event.kind() == EnvelopeKind::FrameUpdate {
                let age_ms = event.age_ms(now_ms());
                if age_ms > inner.config.frame_stale_ms {
                    trace!(age_ms, "dropping stale frame update");
                    return;
                }
            }
            emit(inner, &event);
        }
        Ok(Decoded::Unknown(kind)) => debug!(kind, "ignoring unknown envelope type"),
        Err(e) => warn!(error = %e, "dropping malformed envelope"),
    }
}

fn emit(inner: &Inner, event: &Envelope) {
    let listeners: Vec<Listener> = inner
        .listeners
        .lock()
        .unwrap()
        .get(&event.kind())
        .cloned()
        .unwrap_or_default();
    for listener in listeners {
        // One buggy listener must not take down the read loop or starve
        // its siblings.
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            error!(kind = %event.kind(), "listener panicked");
        }
    }
}

/// Start the background retry loop, unless one is already running.
fn schedule_reconnect(inner: &Arc<Inner>) {
    if inner.destroyed.is_cancelled() {
        return;
    }
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    let inner = inner.clone();
    tokio::spawn(async move {
        loop {
            let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > inner.config.max_reconnect_attempts {
                warn!(
                    attempts = inner.config.max_reconnect_attempts,
                    "giving up on reconnection"
                );
                emit(&inner, &Envelope::connection(ConnectionStatus::Failed));
                break;
            }
            tokio::select! {
                _ = inner.destroyed.cancelled() => break,
                _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
            }
            // A disconnect() or a competing connect may have changed things
            // while we slept.
            if *inner.state.lock().unwrap() != ConnState::Closed {
                break;
            }
            debug!(attempt, "reconnection attempt");
            if connect_once(&inner).await {
                break;
            }
        }
        inner.reconnecting.store(false, Ordering::SeqCst);
    });
}
