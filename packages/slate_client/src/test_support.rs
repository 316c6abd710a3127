//! Scriptable in-memory transport for connection manager tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{LinkSink, LinkStream, Transport, TransportError};

/// What the next `connect` call should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Succeed,
    Fail,
    /// Never resolve; exercises the connect timeout.
    Hang,
}

/// One accepted fake connection, visible to the test.
pub struct FakeConn {
    pub channel: String,
    /// Frames the manager wrote, in order.
    pub sent: Arc<Mutex<Vec<String>>>,
    inject: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl FakeConn {
    /// Push a frame at the manager, as if the server broadcast it.
    pub fn inject(&self, text: impl Into<String>) {
        if let Some(tx) = self.inject.lock().unwrap().as_ref() {
            let _ = tx.send(text.into());
        }
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        self.inject.lock().unwrap().take();
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeTransport {
    /// Consumed front-to-back; an empty script means `Succeed`.
    script: Mutex<VecDeque<ConnectOutcome>>,
    pub conns: Mutex<Vec<Arc<FakeConn>>>,
    failures: Mutex<usize>,
    /// When set, every connect fails regardless of the script.
    always_fail: bool,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    pub fn script(self, outcomes: impl IntoIterator<Item = ConnectOutcome>) -> Self {
        self.script.lock().unwrap().extend(outcomes);
        self
    }

    pub fn connect_count(&self) -> usize {
        self.conns.lock().unwrap().len() + self.failed_count()
    }

    pub fn accepted_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    pub fn last_conn(&self) -> Arc<FakeConn> {
        self.conns.lock().unwrap().last().cloned().expect("no connection accepted")
    }

    fn failed_count(&self) -> usize {
        *self.failures.lock().unwrap()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        channel_id: &str,
    ) -> Result<(Box<dyn LinkSink>, Box<dyn LinkStream>), TransportError> {
        let outcome = if self.always_fail {
            ConnectOutcome::Fail
        } else {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ConnectOutcome::Succeed)
        };

        match outcome {
            ConnectOutcome::Fail => {
                *self.failures.lock().unwrap() += 1;
                Err(TransportError::Connect("scripted failure".into()))
            }
            ConnectOutcome::Hang => {
                *self.failures.lock().unwrap() += 1;
                futures::future::pending().await
            }
            ConnectOutcome::Succeed => {
                let (tx, rx) = mpsc::unbounded_channel();
                let sent = Arc::new(Mutex::new(Vec::new()));
                let conn = Arc::new(FakeConn {
                    channel: channel_id.to_string(),
                    sent: sent.clone(),
                    inject: Mutex::new(Some(tx)),
                });
                self.conns.lock().unwrap().push(conn);
                Ok((Box::new(FakeSink { sent }), Box::new(FakeStream { rx })))
            }
        }
    }
}

struct FakeSink {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl LinkSink for FakeSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&mut self) {}
}

struct FakeStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl LinkStream for FakeStream {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}
