//! In-memory transport and backend doubles for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use cobrowse_core::errors::ConnectionError;
use cobrowse_core::ids::SessionId;
use cobrowse_settings::ConnectionSettings;

use crate::backend::{BackendError, BrowserBackend, CreatedSession, SessionSnapshot};
use crate::connection::transport::{Connector, IncomingFrame, OutgoingFrame, Transport};

/// What the next `connect` call does.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Script {
    Accept,
    Refuse,
    /// Sleep, then accept.
    Delay(Duration),
}

/// Server side of an accepted mock transport.
pub(crate) struct ServerEnd {
    pub sent: mpsc::Receiver<OutgoingFrame>,
    pub push: mpsc::Sender<IncomingFrame>,
}

impl ServerEnd {
    /// Next text frame the client wrote, as JSON. Panics on close.
    pub async fn next_json(&mut self) -> Value {
        match self.sent.recv().await {
            Some(OutgoingFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Next frame of any kind, or `None` when the client dropped its writer.
    pub async fn next_frame(&mut self) -> Option<OutgoingFrame> {
        self.sent.recv().await
    }

    /// Whether no frame is queued right now.
    pub fn is_quiet(&mut self) -> bool {
        self.sent.try_recv().is_err()
    }

    pub async fn push_json(&self, value: Value) {
        self.push_text(&value.to_string()).await;
    }

    pub async fn push_text(&self, text: &str) {
        self.push
            .send(IncomingFrame::Text(text.to_owned()))
            .await
            .unwrap();
    }

    pub async fn close(&self, clean: bool) {
        let _ = self
            .push
            .send(IncomingFrame::Closed {
                clean,
                reason: None,
            })
            .await;
    }
}

/// Scripted connector handing each accepted transport's server end to the test.
pub(crate) struct MockConnector {
    script: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl MockConnector {
    pub fn new(script: impl IntoIterator<Item = Script>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
            urls: Mutex::default(),
            servers,
        });
        (connector, rx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Transport, ConnectionError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_owned());
        let step = self.script.lock().pop_front().unwrap_or(Script::Accept);
        match step {
            Script::Refuse => {
                return Err(ConnectionError::ConnectFailed {
                    url: url.to_owned(),
                    reason: "connection refused".into(),
                });
            }
            Script::Delay(d) => tokio::time::sleep(d).await,
            Script::Accept => {}
        }
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.servers.send(ServerEnd {
            sent: out_rx,
            push: in_tx,
        });
        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Fast settings for tests: 1s base, 3 attempts, 10s connect timeout.
pub(crate) fn test_connection_settings() -> ConnectionSettings {
    ConnectionSettings {
        ws_url: "ws://mock.test/ws".into(),
        reconnect_base_delay_ms: 1000,
        reconnect_max_delay_ms: 30_000,
        max_reconnect_attempts: 3,
        connect_timeout_ms: 10_000,
        ..ConnectionSettings::default()
    }
}

/// Backend double that records calls and returns canned sessions.
#[derive(Default)]
pub(crate) struct MockBackend {
    pub calls: Mutex<Vec<String>>,
    pub snapshots: Mutex<Vec<SessionSnapshot>>,
}

impl MockBackend {
    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BrowserBackend for MockBackend {
    async fn create_session(&self, task: &str) -> Result<CreatedSession, BackendError> {
        self.record(format!("create:{task}"));
        Ok(CreatedSession {
            session_id: SessionId::from("created-1"),
            browser_url: Some("https://live.test/created-1".into()),
        })
    }

    async fn pause(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.record(format!("pause:{session_id}"));
        Ok(())
    }

    async fn resume(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.record(format!("resume:{session_id}"));
        Ok(())
    }

    async fn stop(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.record(format!("stop:{session_id}"));
        Ok(())
    }

    async fn close_session(&self, session_id: &SessionId) -> Result<(), BackendError> {
        self.record(format!("close:{session_id}"));
        Ok(())
    }

    async fn close_all(&self) -> Result<(), BackendError> {
        self.record("close_all".into());
        Ok(())
    }

    async fn fetch_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionSnapshot>, BackendError> {
        self.record(format!("fetch:{session_id}"));
        Ok(self
            .snapshots
            .lock()
            .iter()
            .find(|s| &s.session_id == session_id)
            .cloned())
    }
}
