//! Opt-in per-session and all-sessions feeds.
//!
//! Subscribing is idempotent: the frame is sent once per subscription, and
//! a redundant call is a no-op. When the connection drops the server forgets
//! every subscription, so active ones move to a lapsed set; nothing is
//! re-sent until the consumer calls [`SubscriptionManager::resubscribe_lapsed`].

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use cobrowse_core::errors::ConnectionError;
use cobrowse_core::ids::SessionId;
use cobrowse_core::protocol::{Channel, OutboundMessage};
use cobrowse_core::session::ConnectionState;

use crate::connection::{ConnectionEvent, ConnectionManager, EventFilter, ListenerId};

#[derive(Debug, Default)]
struct Subscriptions {
    sessions: HashSet<SessionId>,
    /// Frames in flight; a concurrent duplicate call is a no-op.
    pending_sessions: HashSet<SessionId>,
    browser_sessions: bool,
    browser_sessions_pending: bool,
    lapsed_sessions: HashSet<SessionId>,
    lapsed_browser_sessions: bool,
    /// Bumped on every connection close.
    epoch: u64,
}

impl Subscriptions {
    fn lapse(&mut self) {
        let active: Vec<SessionId> = self.sessions.drain().collect();
        self.lapsed_sessions.extend(active);
        if std::mem::take(&mut self.browser_sessions) {
            self.lapsed_browser_sessions = true;
        }
        self.epoch += 1;
    }

    /// Reserve a session subscription. Returns the epoch to hand back to
    /// [`Self::finish_session`], or `None` if already active or in flight.
    fn begin_session(&mut self, session_id: &SessionId) -> Option<u64> {
        if self.sessions.contains(session_id) || !self.pending_sessions.insert(session_id.clone()) {
            return None;
        }
        Some(self.epoch)
    }

    /// Record the outcome of a subscribe frame. A frame delivered on a
    /// connection that has since closed was forgotten by the server, so the
    /// subscription counts as lapsed. Returns whether it is now active.
    fn finish_session(&mut self, session_id: &SessionId, epoch: u64, sent: bool) -> bool {
        let _ = self.pending_sessions.remove(session_id);
        if !sent {
            return false;
        }
        if epoch != self.epoch {
            let _ = self.lapsed_sessions.insert(session_id.clone());
            return false;
        }
        let _ = self.lapsed_sessions.remove(session_id);
        let _ = self.sessions.insert(session_id.clone());
        true
    }

    fn begin_browser_sessions(&mut self) -> Option<u64> {
        if self.browser_sessions || std::mem::replace(&mut self.browser_sessions_pending, true) {
            return None;
        }
        Some(self.epoch)
    }

    fn finish_browser_sessions(&mut self, epoch: u64, sent: bool) -> bool {
        self.browser_sessions_pending = false;
        if !sent {
            return false;
        }
        if epoch != self.epoch {
            self.lapsed_browser_sessions = true;
            return false;
        }
        self.lapsed_browser_sessions = false;
        self.browser_sessions = true;
        true
    }
}

/// Tracks which feeds this client has opted into.
pub struct SubscriptionManager {
    connection: ConnectionManager,
    state: Arc<Mutex<Subscriptions>>,
    listener: ListenerId,
}

impl SubscriptionManager {
    /// Manager sending over `connection`.
    pub fn new(connection: ConnectionManager) -> Self {
        let state = Arc::new(Mutex::new(Subscriptions::default()));
        let weak: Weak<Mutex<Subscriptions>> = Arc::downgrade(&state);
        let listener = connection.on(EventFilter::State, move |event| {
            if let ConnectionEvent::Closed { .. } = event {
                if let Some(state) = weak.upgrade() {
                    state.lock().lapse();
                    debug!("subscriptions lapsed with the connection");
                }
            }
        });
        Self {
            connection,
            state,
            listener,
        }
    }

    /// Receive fine-grained updates for one session. Connects first if
    /// needed. Returns `false` if already subscribed or in flight, or if the
    /// connection dropped while the frame was being sent (the subscription
    /// is then lapsed).
    pub async fn subscribe_to_session(&self, session_id: &SessionId) -> Result<bool, ConnectionError> {
        let Some(epoch) = self.state.lock().begin_session(session_id) else {
            return Ok(false);
        };
        let frame = OutboundMessage::Subscribe {
            channel: Channel::Session,
            session_id: session_id.clone(),
        };
        let result = self.connection.send(&frame, None).await;
        let active = self
            .state
            .lock()
            .finish_session(session_id, epoch, result.is_ok());
        result?;
        if active {
            info!(session_id = %session_id, "subscribed to session");
        } else {
            debug!(session_id = %session_id, "subscription lapsed while sending");
        }
        Ok(active)
    }

    /// Stop fine-grained updates for one session. Returns `false` if not
    /// subscribed. The frame is only sent while connected.
    pub async fn unsubscribe_from_session(
        &self,
        session_id: &SessionId,
    ) -> Result<bool, ConnectionError> {
        let was_active = {
            let mut state = self.state.lock();
            let _ = state.lapsed_sessions.remove(session_id);
            state.sessions.remove(session_id)
        };
        if !was_active {
            return Ok(false);
        }
        if self.connection.state() == ConnectionState::Connected {
            let frame = OutboundMessage::Unsubscribe {
                channel: Channel::Session,
                session_id: Some(session_id.clone()),
            };
            self.connection.send(&frame, None).await?;
        }
        info!(session_id = %session_id, "unsubscribed from session");
        Ok(true)
    }

    /// Receive the coarse feed of every browser session. Returns `false` if
    /// already subscribed or if the subscription lapsed while sending.
    pub async fn subscribe_to_browser_sessions(&self) -> Result<bool, ConnectionError> {
        let Some(epoch) = self.state.lock().begin_browser_sessions() else {
            return Ok(false);
        };
        let frame = OutboundMessage::SubscribeSessions {
            channel: Channel::BrowserSessions,
        };
        let result = self.connection.send(&frame, None).await;
        let active = self
            .state
            .lock()
            .finish_browser_sessions(epoch, result.is_ok());
        result?;
        if active {
            info!("subscribed to browser sessions");
        }
        Ok(active)
    }

    /// Leave the all-sessions feed. Returns `false` if not subscribed.
    pub async fn unsubscribe_from_browser_sessions(&self) -> Result<bool, ConnectionError> {
        let was_active = {
            let mut state = self.state.lock();
            state.lapsed_browser_sessions = false;
            std::mem::take(&mut state.browser_sessions)
        };
        if !was_active {
            return Ok(false);
        }
        if self.connection.state() == ConnectionState::Connected {
            let frame = OutboundMessage::Unsubscribe {
                channel: Channel::BrowserSessions,
                session_id: None,
            };
            self.connection.send(&frame, None).await?;
        }
        Ok(true)
    }

    /// Re-send every subscription lost with the previous connection.
    /// Returns how many were restored.
    pub async fn resubscribe_lapsed(&self) -> Result<usize, ConnectionError> {
        let (sessions, browser_sessions) = {
            let mut state = self.state.lock();
            let sessions: Vec<SessionId> = state.lapsed_sessions.drain().collect();
            (sessions, std::mem::take(&mut state.lapsed_browser_sessions))
        };

        let mut restored = 0;
        if browser_sessions && self.subscribe_to_browser_sessions().await? {
            restored += 1;
        }
        for (i, session_id) in sessions.iter().enumerate() {
            match self.subscribe_to_session(session_id).await {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => {
                    // Keep the rest for the next attempt
                    self.state
                        .lock()
                        .lapsed_sessions
                        .extend(sessions[i..].iter().cloned());
                    return Err(e);
                }
            }
        }
        if restored > 0 {
            info!(restored, "resubscribed lapsed subscriptions");
        }
        Ok(restored)
    }

    /// Whether the session feed is active.
    pub fn is_subscribed(&self, session_id: &SessionId) -> bool {
        self.state.lock().sessions.contains(session_id)
    }

    /// Whether the all-sessions feed is active.
    pub fn is_subscribed_to_browser_sessions(&self) -> bool {
        self.state.lock().browser_sessions
    }

    /// Active per-session subscriptions.
    pub fn subscribed_sessions(&self) -> Vec<SessionId> {
        self.state.lock().sessions.iter().cloned().collect()
    }

    /// Subscriptions lost with the last connection.
    pub fn lapsed_sessions(&self) -> Vec<SessionId> {
        self.state.lock().lapsed_sessions.iter().cloned().collect()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        let _ = self.connection.off(self.listener);
    }
}
