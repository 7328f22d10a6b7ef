//! Connection manager: one multiplexed real-time channel for every session.
//!
//! ## Lifecycle
//!
//! ```text
//! disconnected ──connect──▶ connecting ──open──▶ connected
//!      ▲                        │                   │
//!      └──────── failure ───────┘      abnormal close: backoff, reconnect
//!      └──────────────── disconnect (closing) ──────┘
//! ```
//!
//! Concurrent `connect` calls share a single in-flight attempt. Abnormal
//! closes schedule reconnects with capped exponential backoff; a successful
//! reconnect resets the attempt counter, and exhausting the attempts leaves
//! the manager offline until the next explicit `connect`. Reconnecting never
//! re-sends subscriptions.
//!
//! Inbound frames are dispatched in order on one read loop. Malformed frames
//! are logged and dropped.

pub mod listeners;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cobrowse_core::backoff::BackoffPolicy;
use cobrowse_core::errors::{ConnectionError, ProtocolError, TerminalReconnectError};
use cobrowse_core::ids::SessionId;
use cobrowse_core::protocol::{OutboundMessage, decode, parse_frame};
use cobrowse_core::session::ConnectionState;
use cobrowse_settings::ConnectionSettings;

pub use listeners::{ConnectionEvent, EventFilter, Handler, ListenerId};
pub use transport::{Connector, IncomingFrame, OutgoingFrame, Transport, WsConnector};

use listeners::ListenerRegistry;

type ConnectFuture = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

/// Handle to the shared connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    ws_url: String,
    backoff: BackoffPolicy,
    connect_timeout: Duration,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    listeners: ListenerRegistry,
}

#[derive(Default)]
struct Link {
    outgoing: Option<mpsc::Sender<OutgoingFrame>>,
    in_flight: Option<ConnectFuture>,
    /// Bumped on every open and on `disconnect`; a read loop whose
    /// generation is stale must not touch the link.
    generation: u64,
    attempts: u32,
    manual_close: bool,
    offline: bool,
    scope: Option<SessionId>,
    reconnect_timer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Manager over an arbitrary connector.
    pub fn new(settings: &ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(settings.event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                connector,
                ws_url: settings.ws_url.trim_end_matches('/').to_owned(),
                backoff: settings.backoff_policy(),
                connect_timeout: settings.connect_timeout(),
                link: Mutex::default(),
                state_tx,
                events_tx,
                listeners: ListenerRegistry::default(),
            }),
        }
    }

    /// Manager over a real WebSocket.
    pub fn websocket(settings: &ConnectionSettings) -> Self {
        Self::new(settings, Arc::new(WsConnector::new(settings.outbound_buffer)))
    }

    /// Open the channel, or join the attempt already in flight.
    ///
    /// `session_hint` scopes the URL as `{ws_url}/{session_id}` when this
    /// call starts a fresh open; reconnects reuse that scope. Clears the
    /// offline state left by exhausted reconnects.
    pub async fn connect(&self, session_hint: Option<&SessionId>) -> Result<(), ConnectionError> {
        let attempt = {
            let mut link = self.inner.link.lock();
            link.manual_close = false;
            if link.offline {
                link.offline = false;
                link.attempts = 0;
            }
            if link.outgoing.is_some() {
                return Ok(());
            }
            if let Some(existing) = link.in_flight.clone() {
                existing
            } else {
                link.scope = session_hint.cloned();
                let fresh = Arc::clone(&self.inner).open().boxed().shared();
                link.in_flight = Some(fresh.clone());
                fresh
            }
        };
        attempt.await
    }

    /// Serialize and deliver `message`, connecting first if needed.
    pub async fn send(
        &self,
        message: &OutboundMessage,
        session_hint: Option<&SessionId>,
    ) -> Result<(), ConnectionError> {
        let text =
            serde_json::to_string(message).map_err(|e| ConnectionError::Encode(e.to_string()))?;

        let outgoing = match self.inner.outgoing() {
            Some(tx) => tx,
            None => {
                self.connect(session_hint).await?;
                self.inner.outgoing().ok_or(ConnectionError::Closed)?
            }
        };

        outgoing
            .send(OutgoingFrame::Text(text))
            .await
            .map_err(|_| ConnectionError::SendFailed("transport writer stopped".into()))?;
        debug!(
            kind = message.kind(),
            session_id = ?message.session_id(),
            "sent frame"
        );
        Ok(())
    }

    /// Close cleanly and suppress reconnection until the next `connect`.
    pub async fn disconnect(&self) {
        let (outgoing, timer, reader) = {
            let mut link = self.inner.link.lock();
            link.manual_close = true;
            link.offline = false;
            link.attempts = 0;
            link.generation += 1;
            (
                link.outgoing.take(),
                link.reconnect_timer.take(),
                link.reader.take(),
            )
        };

        if let Some(timer) = timer {
            timer.abort();
        }

        let was_open = outgoing.is_some();
        if let Some(tx) = outgoing {
            self.inner.set_state(ConnectionState::Closing);
            let _ = tx.send(OutgoingFrame::Close).await;
        }
        if let Some(reader) = reader {
            reader.abort();
        }

        self.inner.set_state(ConnectionState::Disconnected);
        if was_open {
            info!("disconnected");
            self.inner.emit(ConnectionEvent::Closed {
                abnormal: false,
                reason: Some("client disconnect".into()),
            });
        }
    }

    /// Register a synchronous handler for events passing `filter`.
    pub fn on<F>(&self, filter: EventFilter, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(filter, Arc::new(handler))
    }

    /// Remove a handler. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Async stream of every event. Slow receivers observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch receiver tracking the state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().outgoing.is_some()
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.link.lock().attempts
    }

    /// Whether reconnects were exhausted.
    pub fn is_offline(&self) -> bool {
        self.inner.link.lock().offline
    }
}

impl Inner {
    fn url_for(&self, scope: Option<&SessionId>) -> String {
        match scope {
            Some(id) => format!("{}/{id}", self.ws_url),
            None => self.ws_url.clone(),
        }
    }

    fn outgoing(&self) -> Option<mpsc::Sender<OutgoingFrame>> {
        self.link.lock().outgoing.clone()
    }

    async fn open(self: Arc<Self>) -> Result<(), ConnectionError> {
        let url = {
            let link = self.link.lock();
            self.url_for(link.scope.as_ref())
        };
        self.set_state(ConnectionState::Connecting);
        debug!(%url, "opening connection");

        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = self.connect_timeout.as_millis() as u64;
        let opened = match tokio::time::timeout(self.connect_timeout, self.connector.connect(&url))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout {
                url: url.clone(),
                timeout_ms,
            }),
        };

        let transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                self.link.lock().in_flight = None;
                self.set_state(ConnectionState::Disconnected);
                warn!(%url, error = %e, "connection attempt failed");
                return Err(e);
            }
        };

        let generation = {
            let mut link = self.link.lock();
            link.in_flight = None;
            if link.manual_close {
                drop(link);
                let _ = transport.outgoing.try_send(OutgoingFrame::Close);
                self.set_state(ConnectionState::Disconnected);
                debug!(%url, "disconnect raced the open, dropping transport");
                return Err(ConnectionError::Closed);
            }
            link.generation += 1;
            link.outgoing = Some(transport.outgoing);
            link.attempts = 0;
            link.offline = false;
            link.generation
        };

        self.set_state(ConnectionState::Connected);
        info!(%url, "connected");

        let reader = tokio::spawn(Arc::clone(&self).read_loop(generation, transport.incoming));
        let mut link = self.link.lock();
        if link.generation == generation {
            link.reader = Some(reader);
        }
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, generation: u64, mut incoming: mpsc::Receiver<IncomingFrame>) {
        let (clean, reason) = loop {
            match incoming.recv().await {
                Some(IncomingFrame::Text(text)) => self.dispatch(&text),
                Some(IncomingFrame::Closed { clean, reason }) => break (clean, reason),
                None => break (false, None),
            }
        };
        self.handle_close(generation, clean, reason);
    }

    fn handle_close(self: &Arc<Self>, generation: u64, clean: bool, reason: Option<String>) {
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.outgoing = None;
            link.reader = None;
            if link.manual_close {
                return;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        if clean {
            info!(?reason, "server closed the connection");
        } else {
            warn!(?reason, "connection closed abnormally");
        }
        self.emit(ConnectionEvent::Closed {
            abnormal: !clean,
            reason,
        });
        if !clean {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let next = {
            let mut link = self.link.lock();
            if link.manual_close {
                return;
            }
            let attempt = link.attempts;
            match self.backoff.delay_for(attempt) {
                Some(delay) => {
                    link.attempts += 1;
                    Ok((link.attempts, delay))
                }
                None => {
                    link.offline = true;
                    Err(attempt)
                }
            }
        };

        let (attempt, delay) = match next {
            Ok(next) => next,
            Err(attempts) => {
                error!(attempts, "reconnect attempts exhausted, going offline");
                self.emit(ConnectionEvent::ReconnectExhausted(TerminalReconnectError {
                    attempts,
                }));
                return;
            }
        };

        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        info!(attempt, delay_ms, "scheduling reconnect");
        self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });

        let inner = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let attempt_fut = {
                let mut link = inner.link.lock();
                link.reconnect_timer = None;
                if link.manual_close || link.outgoing.is_some() {
                    return;
                }
                if let Some(existing) = link.in_flight.clone() {
                    existing
                } else {
                    let fresh = Arc::clone(&inner).open().boxed().shared();
                    link.in_flight = Some(fresh.clone());
                    fresh
                }
            };
            if attempt_fut.await.is_err() {
                inner.schedule_reconnect();
            }
        });
        self.link.lock().reconnect_timer = Some(timer);
    }

    fn dispatch(&self, text: &str) {
        let value = match parse_frame(text) {
            Ok(value) => Arc::new(value),
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };
        self.emit(ConnectionEvent::Raw(Arc::clone(&value)));

        match decode(&value) {
            Ok(message) => self.emit(ConnectionEvent::Message(Arc::new(message))),
            Err(ProtocolError::UnknownType(kind)) => {
                debug!(%kind, "ignoring unhandled message type");
            }
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(state = %next, "connection state changed");
            self.emit(ConnectionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        self.listeners.emit(&event);
        let _ = self.events_tx.send(event);
    }
}
