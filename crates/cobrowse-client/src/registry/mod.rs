//! Session registry: the in-memory map of every visible session.
//!
//! Written by the dispatch path (streamed messages and snapshots), by the
//! handoff coordinator (optimistic transitions and their resolution), and by
//! explicit local inserts and removals. Every field write goes through
//! [`merge::apply_patch`]. Observers receive [`RegistryEvent`]s on a
//! broadcast channel, sent after the registry lock is released.

pub mod merge;

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use cobrowse_core::errors::TransitionError;
use cobrowse_core::ids::{ContextId, RequestId, SessionId};
use cobrowse_core::protocol::{InboundMessage, SessionUpdate, StepEvent};
use cobrowse_core::session::{
    ControlOwner, PendingTransition, Session, SessionStatus, StepProgress,
};

pub use merge::{MergeOutcome, Provenance, SessionPatch, apply_patch};

/// Default broadcast buffer for registry events.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// A change observers may care about.
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryEvent {
    /// A session was inserted or changed.
    Upserted {
        /// Affected session.
        session_id: SessionId,
        /// Whether this created the entry.
        created: bool,
    },
    /// A session was purged.
    Removed {
        /// Purged session.
        session_id: SessionId,
    },
    /// Ownership changed.
    ControlChanged {
        /// Affected session.
        session_id: SessionId,
        /// New owner.
        owner: ControlOwner,
        /// Owner before the change.
        previous: ControlOwner,
    },
    /// Ownership entered `transition`. Always precedes the matching
    /// `ControlChanged` or `TransitionFailed`.
    TransitionStarted {
        /// Affected session.
        session_id: SessionId,
        /// Requested owner.
        target: ControlOwner,
        /// Who asked for the change.
        origin: TransitionOrigin,
    },
    /// A handoff failed and was rolled back.
    TransitionFailed {
        /// Affected session.
        session_id: SessionId,
        /// Owner after rollback.
        restored: ControlOwner,
        /// Failure description.
        reason: String,
    },
    /// Agent step progress.
    Step {
        /// Affected session.
        session_id: SessionId,
        /// Latest step.
        step: StepProgress,
    },
}

/// Who initiated an ownership change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOrigin {
    /// A handoff requested by this client, resolved on acknowledgment.
    Local,
    /// Reported by the backend with no local request (e.g. the agent asking
    /// for help). Starts and completes in one step.
    Remote,
}

/// Result of [`SessionRegistry::begin_transition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionStart {
    /// Pending transition recorded; `prior` is the owner to restore on failure.
    Started {
        /// Owner before the transition.
        prior: ControlOwner,
    },
    /// The session already has the requested owner; nothing was recorded.
    AlreadyOwner(ControlOwner),
}

struct Slot {
    seq: u64,
    session: Session,
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Slot>,
    next_seq: u64,
}

impl State {
    /// Get or create, returning whether it was created.
    fn upsert(&mut self, id: &SessionId) -> (&mut Session, bool) {
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(slot) => (&mut slot.into_mut().session, false),
            Entry::Vacant(vacant) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let slot = vacant.insert(Slot {
                    seq,
                    session: Session::new(id.clone()),
                });
                (&mut slot.session, true)
            }
        }
    }

    fn sorted(&self, keep: impl Fn(&Session) -> bool) -> Vec<Session> {
        let mut entries: Vec<&Slot> = self
            .sessions
            .values()
            .filter(|e| keep(&e.session))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.session.clone()).collect()
    }
}

/// Authoritative map of `session_id` to session state.
pub struct SessionRegistry {
    state: RwLock<State>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl SessionRegistry {
    /// Empty registry whose event channel buffers `event_buffer` events.
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            state: RwLock::default(),
            events,
        }
    }

    /// Receive registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Optimistically record a session created locally (e.g. from a start-task
    /// response). Returns whether it was newly inserted.
    pub fn insert_local(
        &self,
        session_id: &SessionId,
        browser_url: Option<String>,
        context_id: Option<ContextId>,
    ) -> bool {
        let patch = SessionPatch {
            browser_url,
            context_id,
            ..SessionPatch::default()
        };
        let (created, _) = self.upsert(session_id, patch, Provenance::Local);
        created
    }

    /// Fold one streamed message into the registry. Returns whether state changed.
    ///
    /// `control_change` is applied directly here; a caller running handoffs
    /// should offer it to the coordinator first.
    pub fn apply_message(&self, message: &InboundMessage) -> bool {
        match message {
            InboundMessage::SessionUpdate(update) => self.apply_update(update),
            InboundMessage::ViewportUpdate(update) => {
                let (created, out) =
                    self.upsert(&update.session_id, update.into(), Provenance::Stream);
                created || out.changed
            }
            InboundMessage::TabUpdate(update) => {
                let (created, out) =
                    self.upsert(&update.session_id, update.into(), Provenance::Stream);
                created || out.changed
            }
            InboundMessage::Status(update) => {
                let Some(status) = update.status.live() else {
                    return self.remove(&update.session_id).is_some();
                };
                let patch = SessionPatch {
                    status: Some(status),
                    ..SessionPatch::default()
                };
                let (created, out) = self.upsert(&update.session_id, patch, Provenance::Stream);
                if status == SessionStatus::Error {
                    if let Some(message) = &update.message {
                        let _ = self.record_error(&update.session_id, message);
                    }
                }
                created || out.changed
            }
            InboundMessage::ControlChange(change) => self.apply_control_change(
                &change.session_id,
                ControlOwner::from_human_control(change.human_control),
            ),
            InboundMessage::StepStart(step) => self.apply_step(step, false),
            InboundMessage::StepEnd(step) => self.apply_step(step, true),
            InboundMessage::Error(event) => match &event.session_id {
                Some(id) => self.record_error(id, &event.message),
                None => {
                    warn!(error = %event.message, code = ?event.code, "backend error");
                    false
                }
            },
        }
    }

    /// Fold a backend snapshot (polling fallback) into the registry.
    pub fn apply_snapshot(&self, snapshot: &SessionUpdate) -> bool {
        self.apply_update(snapshot)
    }

    /// Set the owner reported by the backend. Skipped while a transition is
    /// pending for the session. A change is published as a remote
    /// transition. Returns whether the owner changed.
    pub fn apply_control_change(&self, session_id: &SessionId, owner: ControlOwner) -> bool {
        let patch = SessionPatch {
            control_owner: Some(owner),
            ..SessionPatch::default()
        };
        let (created, out) = self.upsert(session_id, patch, Provenance::Stream);
        if !created && out.owner_changed.is_none() {
            debug!(session_id = %session_id, %owner, "control change left owner unchanged");
        }
        out.owner_changed.is_some()
    }

    /// Purge a session.
    pub fn remove(&self, session_id: &SessionId) -> Option<Session> {
        let removed = self.state.write().sessions.remove(session_id).map(|e| e.session);
        if removed.is_some() {
            info!(session_id = %session_id, "session removed");
            self.emit(RegistryEvent::Removed {
                session_id: session_id.clone(),
            });
        }
        removed
    }

    /// Purge every session.
    pub fn clear(&self) {
        let ids: Vec<SessionId> = {
            let mut state = self.state.write();
            state.sessions.drain().map(|(id, _)| id).collect()
        };
        for session_id in ids {
            self.emit(RegistryEvent::Removed { session_id });
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a pending transition toward `target`.
    pub fn begin_transition(
        &self,
        session_id: &SessionId,
        target: ControlOwner,
        request_id: RequestId,
    ) -> Result<TransitionStart, TransitionError> {
        let start = {
            let mut state = self.state.write();
            let entry = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| TransitionError::SessionNotFound(session_id.clone()))?;
            let session = &mut entry.session;
            if session.pending_transition.is_some() {
                return Err(TransitionError::AlreadyPending(session_id.clone()));
            }
            if session.control_owner == target {
                return Ok(TransitionStart::AlreadyOwner(target));
            }
            session.pending_transition = Some(PendingTransition {
                target,
                request_id,
                started_at: Utc::now(),
            });
            TransitionStart::Started {
                prior: session.control_owner,
            }
        };
        self.emit(RegistryEvent::TransitionStarted {
            session_id: session_id.clone(),
            target,
            origin: TransitionOrigin::Local,
        });
        Ok(start)
    }

    /// Resolve the pending transition identified by `request_id` with the
    /// acknowledged owner. Returns `false` if no such transition is pending.
    pub fn complete_transition(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
        owner: ControlOwner,
    ) -> bool {
        let previous = {
            let mut state = self.state.write();
            let Some(session) = pending_session(&mut state, session_id, request_id) else {
                return false;
            };
            session.pending_transition = None;
            let previous = session.control_owner;
            session.control_owner = owner;
            previous
        };
        info!(session_id = %session_id, %owner, "control transition acknowledged");
        if previous != owner {
            self.emit(RegistryEvent::ControlChanged {
                session_id: session_id.clone(),
                owner,
                previous,
            });
        }
        true
    }

    /// Clear the pending transition identified by `request_id`, keeping the
    /// prior owner. Returns the restored owner, or `None` if no such
    /// transition is pending.
    pub fn rollback_transition(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
        reason: &str,
    ) -> Option<ControlOwner> {
        let restored = {
            let mut state = self.state.write();
            let session = pending_session(&mut state, session_id, request_id)?;
            session.pending_transition = None;
            session.control_owner
        };
        warn!(session_id = %session_id, %restored, reason, "control transition rolled back");
        self.emit(RegistryEvent::TransitionFailed {
            session_id: session_id.clone(),
            restored,
            reason: reason.to_owned(),
        });
        Some(restored)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot of one session.
    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.state
            .read()
            .sessions
            .get(session_id)
            .map(|e| e.session.clone())
    }

    /// Whether the session is known.
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.state.read().sessions.contains_key(session_id)
    }

    /// Every session, in first-seen order.
    pub fn list(&self) -> Vec<Session> {
        self.state.read().sorted(|_| true)
    }

    /// Sessions whose status is active.
    pub fn active(&self) -> Vec<Session> {
        self.state.read().sorted(Session::is_active)
    }

    /// Sessions owned by `context`.
    pub fn for_context(&self, context: &ContextId) -> Vec<Session> {
        self.state.read().sorted(|s| s.belongs_to(context))
    }

    /// Active sessions owned by `context`.
    pub fn active_for_context(&self, context: &ContextId) -> Vec<Session> {
        self.state
            .read()
            .sorted(|s| s.is_active() && s.belongs_to(context))
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.state.read().sessions.len()
    }

    /// Whether no sessions are known.
    pub fn is_empty(&self) -> bool {
        self.state.read().sessions.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn apply_update(&self, update: &SessionUpdate) -> bool {
        if update.status.is_some_and(|s| s.live().is_none()) {
            return self.remove(&update.session_id).is_some();
        }
        let (created, out) = self.upsert(&update.session_id, update.into(), Provenance::Stream);
        created || out.changed
    }

    fn upsert(
        &self,
        session_id: &SessionId,
        patch: SessionPatch,
        provenance: Provenance,
    ) -> (bool, MergeOutcome) {
        let (created, out) = {
            let mut state = self.state.write();
            let (session, created) = state.upsert(session_id);
            (created, apply_patch(session, patch, provenance))
        };

        if out.stale {
            debug!(session_id = %session_id, "skipped stale live fields");
        }
        if created {
            debug!(session_id = %session_id, ?provenance, "session inserted");
        }
        if created || out.changed {
            self.emit(RegistryEvent::Upserted {
                session_id: session_id.clone(),
                created,
            });
        }
        if let Some((previous, owner)) = out.owner_changed {
            info!(session_id = %session_id, %previous, %owner, "remote control transition");
            self.emit(RegistryEvent::TransitionStarted {
                session_id: session_id.clone(),
                target: owner,
                origin: TransitionOrigin::Remote,
            });
            self.emit(RegistryEvent::ControlChanged {
                session_id: session_id.clone(),
                owner,
                previous,
            });
        }
        (created, out)
    }

    fn apply_step(&self, event: &StepEvent, finished: bool) -> bool {
        let step = StepProgress {
            number: event.step,
            description: event.description.clone(),
            finished,
        };
        let created = {
            let mut state = self.state.write();
            let (session, created) = state.upsert(&event.session_id);
            session.step = Some(step.clone());
            created
        };
        if created {
            self.emit(RegistryEvent::Upserted {
                session_id: event.session_id.clone(),
                created,
            });
        }
        self.emit(RegistryEvent::Step {
            session_id: event.session_id.clone(),
            step,
        });
        true
    }

    fn record_error(&self, session_id: &SessionId, message: &str) -> bool {
        let recorded = {
            let mut state = self.state.write();
            match state.sessions.get_mut(session_id) {
                Some(entry) => {
                    entry.session.last_error = Some(message.to_owned());
                    true
                }
                None => false,
            }
        };
        warn!(session_id = %session_id, error = message, "backend error for session");
        if recorded {
            self.emit(RegistryEvent::Upserted {
                session_id: session_id.clone(),
                created: false,
            });
        }
        recorded
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

fn pending_session<'a>(
    state: &'a mut State,
    session_id: &SessionId,
    request_id: &RequestId,
) -> Option<&'a mut Session> {
    let session = &mut state.sessions.get_mut(session_id)?.session;
    let matches = session
        .pending_transition
        .as_ref()
        .is_some_and(|p| &p.request_id == request_id);
    matches.then_some(session)
}
