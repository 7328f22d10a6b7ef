//! `SessionClient`: the owned service wiring every component together.
//!
//! Construction installs two connection listeners: one routes typed
//! messages to the handoff coordinator and then the registry, the other
//! fails pending handoffs when the connection closes. Both hold weak
//! references, so dropping the client releases everything.

use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::{info, warn};

use cobrowse_core::errors::{ConnectionError, TransitionError};
use cobrowse_core::ids::{ContextId, SessionId};
use cobrowse_core::protocol::{InboundMessage, OutboundMessage};
use cobrowse_core::session::{ControlOwner, Session, TransitionKind};
use cobrowse_settings::CobrowseSettings;

use crate::backend::{BackendError, BrowserBackend, HttpBackend};
use crate::connection::{ConnectionEvent, ConnectionManager, Connector, EventFilter, ListenerId, WsConnector};
use crate::handoff::HandoffCoordinator;
use crate::registry::SessionRegistry;
use crate::subscription::SubscriptionManager;

/// Failure of a client operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The real-time channel failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A control handoff failed.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The HTTP backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The session is not in the registry.
    #[error("session '{0}' not found")]
    SessionNotFound(SessionId),
}

/// Shared browser-session client.
pub struct SessionClient {
    settings: CobrowseSettings,
    connection: ConnectionManager,
    registry: Arc<SessionRegistry>,
    handoff: Arc<HandoffCoordinator>,
    subscriptions: SubscriptionManager,
    backend: Arc<dyn BrowserBackend>,
    listeners: Vec<ListenerId>,
}

impl SessionClient {
    /// Client over explicit transport and backend implementations.
    pub fn new(
        settings: CobrowseSettings,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn BrowserBackend>,
    ) -> Self {
        let connection = ConnectionManager::new(&settings.connection, connector);
        let registry = Arc::new(SessionRegistry::new(settings.connection.event_buffer));
        let handoff = Arc::new(HandoffCoordinator::new(
            Arc::clone(&registry),
            connection.clone(),
            settings.handoff.transition_timeout(),
        ));
        let subscriptions = SubscriptionManager::new(connection.clone());

        let (weak_registry, weak_handoff) = (Arc::downgrade(&registry), Arc::downgrade(&handoff));
        let on_message = connection.on(EventFilter::Messages, move |event| {
            if let ConnectionEvent::Message(message) = event {
                if let (Some(registry), Some(handoff)) = (weak_registry.upgrade(), weak_handoff.upgrade()) {
                    let _ = route_message(&registry, &handoff, message);
                }
            }
        });

        let weak_handoff: Weak<HandoffCoordinator> = Arc::downgrade(&handoff);
        let on_close = connection.on(EventFilter::State, move |event| {
            if let ConnectionEvent::Closed { .. } = event {
                if let Some(handoff) = weak_handoff.upgrade() {
                    handoff.on_connection_lost();
                }
            }
        });

        Self {
            settings,
            connection,
            registry,
            handoff,
            subscriptions,
            backend,
            listeners: vec![on_message, on_close],
        }
    }

    /// Client over a real WebSocket and the HTTP backend.
    pub fn from_settings(settings: CobrowseSettings) -> Result<Self, ClientError> {
        let connector = Arc::new(WsConnector::new(settings.connection.outbound_buffer));
        let backend = Arc::new(HttpBackend::new(&settings.backend)?);
        Ok(Self::new(settings, connector, backend))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Open the real-time channel.
    pub async fn connect(&self, session_hint: Option<&SessionId>) -> Result<(), ClientError> {
        self.connection.connect(session_hint).await?;
        Ok(())
    }

    /// Close the channel cleanly. Pending handoffs fail with `ConnectionLost`.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        info!("session client shut down");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Backend calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Start `task` in a new session and record it locally.
    pub async fn start_task(
        &self,
        task: &str,
        context: Option<ContextId>,
    ) -> Result<Session, ClientError> {
        let created = self.backend.create_session(task).await?;
        let _ = self
            .registry
            .insert_local(&created.session_id, created.browser_url, context);
        self.registry
            .get(&created.session_id)
            .ok_or(ClientError::SessionNotFound(created.session_id))
    }

    /// Suspend the agent.
    pub async fn pause(&self, session_id: &SessionId) -> Result<(), ClientError> {
        Ok(self.backend.pause(session_id).await?)
    }

    /// Resume the agent.
    pub async fn resume(&self, session_id: &SessionId) -> Result<(), ClientError> {
        Ok(self.backend.resume(session_id).await?)
    }

    /// Stop the task.
    pub async fn stop(&self, session_id: &SessionId) -> Result<(), ClientError> {
        Ok(self.backend.stop(session_id).await?)
    }

    /// Close one session and forget it locally.
    ///
    /// Once the backend has closed it the session is purged even if the
    /// unsubscribe frame cannot be sent.
    pub async fn close_session(&self, session_id: &SessionId) -> Result<(), ClientError> {
        self.backend.close_session(session_id).await?;
        if let Err(e) = self.subscriptions.unsubscribe_from_session(session_id).await {
            warn!(session_id = %session_id, error = %e, "failed to unsubscribe from closed session");
        }
        let _ = self.registry.remove(session_id);
        let _ = self.handoff.on_session_removed(session_id);
        Ok(())
    }

    /// Close every session and clear the registry.
    pub async fn close_all(&self) -> Result<(), ClientError> {
        self.backend.close_all().await?;
        for session_id in self.subscriptions.subscribed_sessions() {
            if let Err(e) = self.subscriptions.unsubscribe_from_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "failed to unsubscribe from closed session");
            }
        }
        self.registry.clear();
        self.handoff.forget_removed();
        Ok(())
    }

    /// Poll one session from the backend and merge it. A session the backend
    /// no longer has is purged.
    pub async fn refresh_session(&self, session_id: &SessionId) -> Result<Option<Session>, ClientError> {
        match self.backend.fetch_session(session_id).await? {
            Some(snapshot) => {
                let _ = self.registry.apply_snapshot(&snapshot);
            }
            None => {
                let _ = self.registry.remove(session_id);
                let _ = self.handoff.on_session_removed(session_id);
            }
        }
        Ok(self.registry.get(session_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Real-time calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask the backend to push a fresh screenshot.
    pub async fn request_screenshot(&self, session_id: &SessionId) -> Result<(), ClientError> {
        let frame = OutboundMessage::GetScreenshot {
            session_id: session_id.clone(),
        };
        self.connection.send(&frame, None).await?;
        Ok(())
    }

    /// Deliver a message to the agent without changing ownership.
    pub async fn send_guidance(
        &self,
        session_id: &SessionId,
        message: impl Into<String>,
    ) -> Result<ControlOwner, ClientError> {
        Ok(self
            .handoff
            .request_control_transition(
                session_id,
                false,
                Some(message.into()),
                TransitionKind::Guidance,
            )
            .await?)
    }

    /// Hand control to the human.
    pub async fn take_control(
        &self,
        session_id: &SessionId,
        message: Option<String>,
    ) -> Result<ControlOwner, ClientError> {
        Ok(self
            .handoff
            .request_control_transition(session_id, true, message, TransitionKind::Handoff)
            .await?)
    }

    /// Return control to the agent.
    pub async fn release_control(
        &self,
        session_id: &SessionId,
        message: Option<String>,
    ) -> Result<ControlOwner, ClientError> {
        Ok(self
            .handoff
            .request_control_transition(session_id, false, message, TransitionKind::Handoff)
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Effective settings.
    pub fn settings(&self) -> &CobrowseSettings {
        &self.settings
    }

    /// Connection manager.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handoff coordinator.
    pub fn handoff(&self) -> &Arc<HandoffCoordinator> {
        &self.handoff
    }

    /// Subscription manager.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        for id in self.listeners.drain(..) {
            let _ = self.connection.off(id);
        }
    }
}

/// Offer `message` to the coordinator, then apply it to the registry unless
/// it was consumed as a handoff acknowledgment. A message that purged its
/// session fails any handoff pending on it. Returns whether the registry
/// changed.
pub(crate) fn route_message(
    registry: &SessionRegistry,
    handoff: &HandoffCoordinator,
    message: &InboundMessage,
) -> bool {
    if handoff.on_message(message) {
        return false;
    }
    let changed = registry.apply_message(message);
    if let Some(session_id) = message.session_id() {
        if !registry.contains(session_id) {
            let _ = handoff.on_session_removed(session_id);
        }
    }
    changed
}
