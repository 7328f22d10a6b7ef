//! Control handoff coordinator.
//!
//! Per session the owner cycles `agent_active → transition → human_active →
//! transition → agent_active`. A request marks the session as in transition,
//! sends `control_toggle`, and waits for a matching `control_change`. Whoever
//! claims the pending waiter resolves the registry: the ack handler, the
//! timeout, a connection loss, a purge of the session, or the request being
//! dropped. A session is therefore never left in transition.
//!
//! Guidance delivers a message to the agent as `user_feedback` and never
//! touches ownership.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use cobrowse_core::errors::TransitionError;
use cobrowse_core::ids::{RequestId, SessionId};
use cobrowse_core::protocol::{InboundMessage, OutboundMessage};
use cobrowse_core::session::{ControlOwner, ControlTransitionRequest, TransitionKind};

use crate::connection::ConnectionManager;
use crate::registry::{SessionRegistry, TransitionStart};

type Outcome = Result<ControlOwner, TransitionError>;

struct Waiter {
    request_id: RequestId,
    target: ControlOwner,
    tx: oneshot::Sender<Outcome>,
}

/// Runs control transitions against the registry and the connection.
pub struct HandoffCoordinator {
    registry: Arc<SessionRegistry>,
    connection: ConnectionManager,
    timeout: Duration,
    waiters: Mutex<HashMap<SessionId, Waiter>>,
}

impl HandoffCoordinator {
    /// Coordinator waiting at most `timeout` for each acknowledgment.
    pub fn new(
        registry: Arc<SessionRegistry>,
        connection: ConnectionManager,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            connection,
            timeout,
            waiters: Mutex::default(),
        }
    }

    /// Acknowledgment timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of transitions awaiting acknowledgment.
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Move control of `session_id` to the human (`take_control`) or back to
    /// the agent, or deliver guidance. Resolves to the owner afterwards.
    ///
    /// Fails without side effects if the session is unknown or already in
    /// transition. Any failure after the request was sent rolls the session
    /// back to its prior owner before returning.
    pub async fn request_control_transition(
        &self,
        session_id: &SessionId,
        take_control: bool,
        message: Option<String>,
        kind: TransitionKind,
    ) -> Result<ControlOwner, TransitionError> {
        let request = ControlTransitionRequest::new(session_id.clone(), take_control, message, kind);
        match request.kind {
            TransitionKind::Guidance => self.send_guidance(request).await,
            TransitionKind::Handoff => self.handoff(request).await,
        }
    }

    /// Offer an inbound message. Returns `true` when it was consumed as a
    /// handoff acknowledgment and must not be applied to the registry again.
    pub fn on_message(&self, message: &InboundMessage) -> bool {
        match message {
            InboundMessage::ControlChange(change) => {
                let owner = ControlOwner::from_human_control(change.human_control);
                let waiter = {
                    let mut waiters = self.waiters.lock();
                    let Some(waiter) = waiters.get(&change.session_id) else {
                        return false;
                    };
                    if change
                        .request_id
                        .as_ref()
                        .is_some_and(|id| id != &waiter.request_id)
                    {
                        debug!(
                            session_id = %change.session_id,
                            request_id = ?change.request_id,
                            "ignoring control_change for another request"
                        );
                        return true;
                    }
                    waiters.remove(&change.session_id)
                };
                if let Some(waiter) = waiter {
                    self.resolve_ack(&change.session_id, waiter, owner);
                }
                true
            }
            InboundMessage::Error(event) => {
                let Some(session_id) = &event.session_id else {
                    return false;
                };
                let Some(waiter) = self.waiters.lock().remove(session_id) else {
                    return false;
                };
                let err = TransitionError::Backend {
                    session_id: session_id.clone(),
                    message: event.message.clone(),
                };
                self.fail(session_id, waiter, err);
                false
            }
            _ => false,
        }
    }

    /// Fail every pending transition because the connection dropped.
    pub fn on_connection_lost(&self) {
        let drained: Vec<(SessionId, Waiter)> = self.waiters.lock().drain().collect();
        for (session_id, waiter) in drained {
            let err = TransitionError::ConnectionLost(session_id.clone());
            self.fail(&session_id, waiter, err);
        }
    }

    /// Fail the pending transition of a session that was purged from the
    /// registry. Returns whether one was pending.
    pub fn on_session_removed(&self, session_id: &SessionId) -> bool {
        let Some(waiter) = self.waiters.lock().remove(session_id) else {
            return false;
        };
        info!(session_id = %session_id, "session closed while control transition was pending");
        let _ = waiter
            .tx
            .send(Err(TransitionError::SessionClosed(session_id.clone())));
        true
    }

    /// Fail every pending transition whose session is no longer in the
    /// registry.
    pub fn forget_removed(&self) {
        let gone: Vec<SessionId> = self
            .waiters
            .lock()
            .keys()
            .filter(|id| !self.registry.contains(id))
            .cloned()
            .collect();
        for session_id in gone {
            let _ = self.on_session_removed(&session_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn send_guidance(&self, request: ControlTransitionRequest) -> Outcome {
        let session_id = request.session_id;
        let session = self
            .registry
            .get(&session_id)
            .ok_or_else(|| TransitionError::SessionNotFound(session_id.clone()))?;
        let message = request
            .message
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| TransitionError::EmptyGuidance(session_id.clone()))?;

        let frame = OutboundMessage::UserFeedback {
            session_id: session_id.clone(),
            message,
            action_type: TransitionKind::Guidance,
        };
        self.connection.send(&frame, Some(&session_id)).await?;
        info!(session_id = %session_id, "guidance delivered");
        Ok(session.control_owner)
    }

    async fn handoff(&self, request: ControlTransitionRequest) -> Outcome {
        let session_id = request.session_id.clone();
        let target = request.desired_owner;
        let request_id = request.request_id.clone();

        let prior = match self
            .registry
            .begin_transition(&session_id, target, request_id.clone())?
        {
            TransitionStart::AlreadyOwner(owner) => {
                debug!(session_id = %session_id, %owner, "already owner, nothing to send");
                return Ok(owner);
            }
            TransitionStart::Started { prior } => prior,
        };

        let (tx, mut rx) = oneshot::channel();
        let _ = self.waiters.lock().insert(
            session_id.clone(),
            Waiter {
                request_id: request_id.clone(),
                target,
                tx,
            },
        );
        let mut guard = PendingGuard {
            coordinator: self,
            session_id: &session_id,
            request_id: &request_id,
            armed: true,
        };
        info!(session_id = %session_id, from = %prior, to = %target, "control transition started");

        let frame = OutboundMessage::ControlToggle {
            session_id: session_id.clone(),
            human_control: target.is_human(),
            additional_prompt: request.message,
            request_id: request_id.clone(),
        };
        if let Err(e) = self.connection.send(&frame, Some(&session_id)).await {
            guard.armed = false;
            let err = TransitionError::from(e);
            if let Some(waiter) = self.claim(&session_id, &request_id) {
                self.fail(&session_id, waiter, err.clone());
            }
            return Err(err);
        }

        let outcome = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransitionError::ConnectionLost(session_id.clone())),
            Err(_) => match self.claim(&session_id, &request_id) {
                Some(waiter) => {
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = self.timeout.as_millis() as u64;
                    let err = TransitionError::Timeout {
                        session_id: session_id.clone(),
                        timeout_ms,
                    };
                    self.fail(&session_id, waiter, err.clone());
                    Err(err)
                }
                // Resolved concurrently with the deadline
                None => rx
                    .await
                    .unwrap_or_else(|_| Err(TransitionError::ConnectionLost(session_id.clone()))),
            },
        };
        guard.armed = false;
        outcome
    }

    fn claim(&self, session_id: &SessionId, request_id: &RequestId) -> Option<Waiter> {
        let mut waiters = self.waiters.lock();
        let matches = waiters
            .get(session_id)
            .is_some_and(|w| &w.request_id == request_id);
        if matches {
            waiters.remove(session_id)
        } else {
            None
        }
    }

    fn resolve_ack(&self, session_id: &SessionId, waiter: Waiter, owner: ControlOwner) {
        if owner == waiter.target {
            let _ = self
                .registry
                .complete_transition(session_id, &waiter.request_id, owner);
            info!(session_id = %session_id, %owner, "control transition complete");
            let _ = waiter.tx.send(Ok(owner));
        } else {
            let err = TransitionError::Rejected {
                session_id: session_id.clone(),
                owner,
            };
            warn!(session_id = %session_id, %owner, "backend rejected control transition");
            let _ = self
                .registry
                .rollback_transition(session_id, &waiter.request_id, &err.to_string());
            let _ = self.registry.apply_control_change(session_id, owner);
            let _ = waiter.tx.send(Err(err));
        }
    }

    fn fail(&self, session_id: &SessionId, waiter: Waiter, err: TransitionError) {
        warn!(session_id = %session_id, error = %err, "control transition failed");
        let _ = self
            .registry
            .rollback_transition(session_id, &waiter.request_id, &err.to_string());
        let _ = waiter.tx.send(Err(err));
    }
}

/// Rolls back a pending transition whose request future was dropped.
struct PendingGuard<'a> {
    coordinator: &'a HandoffCoordinator,
    session_id: &'a SessionId,
    request_id: &'a RequestId,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(waiter) = self.coordinator.claim(self.session_id, self.request_id) {
            debug!(session_id = %self.session_id, "control request dropped before ack");
            let _ = self.coordinator.registry.rollback_transition(
                self.session_id,
                &waiter.request_id,
                "request cancelled",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use cobrowse_core::protocol::decode;
    use cobrowse_core::session::{ControlPhase, ConnectionState};
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::{RegistryEvent, TransitionOrigin};
    use crate::testing::{MockConnector, ServerEnd, test_connection_settings};

    struct Harness {
        registry: Arc<SessionRegistry>,
        coordinator: Arc<HandoffCoordinator>,
        connection: ConnectionManager,
        servers: mpsc::UnboundedReceiver<ServerEnd>,
    }

    fn harness() -> Harness {
        let (connector, servers) = MockConnector::new([]);
        let connection = ConnectionManager::new(&test_connection_settings(), connector);
        let registry = Arc::new(SessionRegistry::default());
        let coordinator = Arc::new(HandoffCoordinator::new(
            Arc::clone(&registry),
            connection.clone(),
            Duration::from_secs(10),
        ));
        let _ = registry.insert_local(&SessionId::from("s1"), None, None);
        Harness {
            registry,
            coordinator,
            connection,
            servers,
        }
    }

    fn inbound(value: &Value) -> InboundMessage {
        decode(value).unwrap()
    }

    fn spawn_request(
        coordinator: &Arc<HandoffCoordinator>,
        take_control: bool,
    ) -> tokio::task::JoinHandle<Outcome> {
        let coordinator = Arc::clone(coordinator);
        tokio::spawn(async move {
            coordinator
                .request_control_transition(
                    &SessionId::from("s1"),
                    take_control,
                    None,
                    TransitionKind::Handoff,
                )
                .await
        })
    }

    fn owner(h: &Harness) -> ControlOwner {
        h.registry.get(&SessionId::from("s1")).unwrap().control_owner
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_handoff_switches_owner() {
        let mut h = harness();
        let mut events = h.registry.subscribe();
        let task = spawn_request(&h.coordinator, true);

        let mut server = h.servers.recv().await.unwrap();
        let frame = server.next_json().await;
        assert_eq!(frame["type"], "control_toggle");
        assert_eq!(frame["human_control"], true);
        assert_eq!(
            h.registry.get(&SessionId::from("s1")).unwrap().control_phase(),
            ControlPhase::Transition {
                from: ControlOwner::Agent,
                to: ControlOwner::Human
            }
        );

        let ack = inbound(&json!({
            "type": "control_change",
            "session_id": "s1",
            "human_control": true,
            "request_id": frame["request_id"]
        }));
        assert!(h.coordinator.on_message(&ack));

        assert_eq!(task.await.unwrap(), Ok(ControlOwner::Human));
        let s = h.registry.get(&SessionId::from("s1")).unwrap();
        assert_eq!(s.control_owner, ControlOwner::Human);
        assert!(!s.in_transition());
        assert_eq!(h.coordinator.pending(), 0);

        let mut ownership = Vec::new();
        while let Ok(event) = events.try_recv() {
            if !matches!(event, RegistryEvent::Upserted { .. }) {
                ownership.push(event);
            }
        }
        assert_matches!(
            ownership.as_slice(),
            [
                RegistryEvent::TransitionStarted {
                    target: ControlOwner::Human,
                    origin: TransitionOrigin::Local,
                    ..
                },
                RegistryEvent::ControlChanged {
                    owner: ControlOwner::Human,
                    previous: ControlOwner::Agent,
                    ..
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_handoff_times_out_and_rolls_back() {
        let mut h = harness();
        let task = spawn_request(&h.coordinator, true);
        let mut server = h.servers.recv().await.unwrap();
        let _ = server.next_json().await;

        let result = task.await.unwrap();
        assert_matches!(result, Err(TransitionError::Timeout { timeout_ms: 10_000, .. }));
        assert_eq!(owner(&h), ControlOwner::Agent);
        assert!(!h.registry.get(&SessionId::from("s1")).unwrap().in_transition());
        assert_eq!(h.coordinator.pending(), 0);

        // A late ack is not consumed as an acknowledgment
        let late = inbound(&json!({"type": "control_change", "session_id": "s1", "human_control": true}));
        assert!(!h.coordinator.on_message(&late));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_request_is_rejected() {
        let mut h = harness();
        let first = spawn_request(&h.coordinator, true);
        let mut server = h.servers.recv().await.unwrap();
        let frame = server.next_json().await;

        let second = h
            .coordinator
            .request_control_transition(&SessionId::from("s1"), true, None, TransitionKind::Handoff)
            .await;
        assert_matches!(second, Err(TransitionError::AlreadyPending(_)));
        assert!(server.is_quiet());

        let ack = inbound(&json!({
            "type": "control_change", "session_id": "s1", "human_control": true,
            "request_id": frame["request_id"]
        }));
        assert!(h.coordinator.on_message(&ack));
        assert_eq!(first.await.unwrap(), Ok(ControlOwner::Human));
    }

    #[tokio::test(start_paused = true)]
    async fn opposite_owner_is_rejected_and_adopted() {
        let mut h = harness();
        let task = spawn_request(&h.coordinator, true);
        let mut server = h.servers.recv().await.unwrap();
        let _ = server.next_json().await;

        let nack = inbound(&json!({"type": "control_change", "session_id": "s1", "human_control": false}));
        assert!(h.coordinator.on_message(&nack));

        assert_matches!(
            task.await.unwrap(),
            Err(TransitionError::Rejected { owner: ControlOwner::Agent, .. })
        );
        assert_eq!(owner(&h), ControlOwner::Agent);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_for_another_request_is_ignored() {
        let mut h = harness();
        let task = spawn_request(&h.coordinator, true);
        let mut server = h.servers.recv().await.unwrap();
        let frame = server.next_json().await;

        let other = inbound(&json!({
            "type": "control_change", "session_id": "s1", "human_control": true,
            "request_id": "someone-else"
        }));
        assert!(h.coordinator.on_message(&other));
        assert_eq!(h.coordinator.pending(), 1);

        let ack = inbound(&json!({
            "type": "control_change", "session_id": "s1", "human_control": true,
            "request_id": frame["request_id"]
        }));
        assert!(h.coordinator.on_message(&ack));
        assert_eq!(task.await.unwrap(), Ok(ControlOwner::Human));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_error_fails_pending_transition() {
        let mut h = harness();
        let task = spawn_request(&h.coordinator, true);
        let mut server = h.servers.recv().await.unwrap();
        let _ = server.next_json().await;

        let error = inbound(&json!({"type": "error", "session_id": "s1", "message": "agent busy"}));
        // Errors still reach the registry
        assert!(!h.coordinator.on_message(&error));

        assert_matches!(
            task.await.unwrap(),
            Err(TransitionError::Backend { ref message, .. }) if message == "agent busy"
        );
        assert_eq!(owner(&h), ControlOwner::Agent);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_fails_pending_transition() {
        let mut h = harness();
        let task = spawn_request(&h.coordinator, true);
        let mut server = h.servers.recv().await.unwrap();
        let _ = server.next_json().await;

        h.coordinator.on_connection_lost();

        assert_matches!(task.await.unwrap(), Err(TransitionError::ConnectionLost(_)));
        assert!(!h.registry.get(&SessionId::from("s1")).unwrap().in_transition());
    }

    #[tokio::test(start_paused = true)]
    async fn release_returns_control_to_agent() {
        let mut h = harness();
        let _ = h.registry.apply_control_change(&SessionId::from("s1"), ControlOwner::Human);

        let task = spawn_request(&h.coordinator, false);
        let mut server = h.servers.recv().await.unwrap();
        let frame = server.next_json().await;
        assert_eq!(frame["human_control"], false);

        let ack = inbound(&json!({
            "type": "control_change", "session_id": "s1", "human_control": false,
            "request_id": frame["request_id"]
        }));
        assert!(h.coordinator.on_message(&ack));
        assert_eq!(task.await.unwrap(), Ok(ControlOwner::Agent));
        assert_eq!(owner(&h), ControlOwner::Agent);
    }

    #[tokio::test]
    async fn requesting_current_owner_sends_nothing() {
        let h = harness();
        let result = h
            .coordinator
            .request_control_transition(&SessionId::from("s1"), false, None, TransitionKind::Handoff)
            .await;
        assert_eq!(result, Ok(ControlOwner::Agent));
        assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let h = harness();
        let result = h
            .coordinator
            .request_control_transition(&SessionId::from("ghost"), true, None, TransitionKind::Handoff)
            .await;
        assert_matches!(result, Err(TransitionError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn guidance_keeps_owner_and_sends_feedback() {
        let mut h = harness();
        let result = h
            .coordinator
            .request_control_transition(
                &SessionId::from("s1"),
                true,
                Some("use the search box".into()),
                TransitionKind::Guidance,
            )
            .await;
        assert_eq!(result, Ok(ControlOwner::Agent));

        let mut server = h.servers.recv().await.unwrap();
        let frame = server.next_json().await;
        assert_eq!(frame["type"], "user_feedback");
        assert_eq!(frame["action_type"], "guidance");
        assert_eq!(frame["message"], "use the search box");
        assert!(!h.registry.get(&SessionId::from("s1")).unwrap().in_transition());
    }

    #[tokio::test]
    async fn guidance_requires_message() {
        let h = harness();
        let result = h
            .coordinator
            .request_control_transition(
                &SessionId::from("s1"),
                false,
                Some("   ".into()),
                TransitionKind::Guidance,
            )
            .await;
        assert_matches!(result, Err(TransitionError::EmptyGuidance(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn purged_session_fails_pending_transition() {
        let mut h = harness();
        let task = spawn_request(&h.coordinator, true);
        let mut server = h.servers.recv().await.unwrap();
        let _ = server.next_json().await;

        let _ = h.registry.remove(&SessionId::from("s1"));
        h.coordinator.forget_removed();

        // Resolved before the 10s timeout could fire
        assert_matches!(task.await.unwrap(), Err(TransitionError::SessionClosed(_)));
        assert_eq!(h.coordinator.pending(), 0);
        assert!(!h.coordinator.on_session_removed(&SessionId::from("s1")));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_request_rolls_back() {
        let mut h = harness();
        let task = spawn_request(&h.coordinator, true);
        let mut server = h.servers.recv().await.unwrap();
        let _ = server.next_json().await;

        task.abort();
        let _ = task.await;

        assert!(!h.registry.get(&SessionId::from("s1")).unwrap().in_transition());
        assert_eq!(h.coordinator.pending(), 0);
    }
}
