//! Session data model.
//!
//! A [`Session`] is one remote browser-automation instance as seen by the
//! client. Live fields (screenshot, URL, title, tabs, status) arrive from the
//! stream; ownership is tracked as a single [`ControlOwner`] plus an optional
//! [`PendingTransition`], so a session can never have two owners.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ContextId, PageId, RequestId, SessionId};

/// The actor currently permitted to drive a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlOwner {
    /// The human operator.
    Human,
    /// The autonomous agent.
    #[default]
    Agent,
}

impl ControlOwner {
    /// Owner implied by the wire `human_control` flag.
    pub fn from_human_control(human_control: bool) -> Self {
        if human_control { Self::Human } else { Self::Agent }
    }

    /// Wire `human_control` flag for this owner.
    pub fn is_human(self) -> bool {
        self == Self::Human
    }

    /// The other owner.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Human => Self::Agent,
            Self::Agent => Self::Human,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for ControlOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The agent (or human) is working in the browser.
    #[default]
    Active,
    /// Execution is suspended.
    Paused,
    /// The backend reported a failure.
    Error,
    /// The task finished.
    Completed,
}

impl SessionStatus {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A browser tab. Owned by its session and replaced wholesale on update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    /// Backend page identifier.
    pub page_id: PageId,
    /// Tab URL.
    #[serde(default)]
    pub url: String,
    /// Tab title.
    #[serde(default)]
    pub title: String,
    /// Whether this is the focused tab.
    #[serde(default)]
    pub active: bool,
}

/// Latest agent step reported via `step_start` / `step_end`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    /// Step number, when the backend numbers them.
    pub number: Option<u32>,
    /// Human-readable description of the action.
    pub description: Option<String>,
    /// Whether `step_end` has been seen for this step.
    pub finished: bool,
}

/// An in-flight control handoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransition {
    /// Owner requested by the transition.
    pub target: ControlOwner,
    /// Request identifier sent with the `control_toggle` frame.
    pub request_id: RequestId,
    /// When the transition was started locally.
    pub started_at: DateTime<Utc>,
}

/// Derived control state machine position of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlPhase {
    /// The agent drives the session.
    AgentActive,
    /// The human drives the session.
    HumanActive,
    /// A handoff is awaiting acknowledgment.
    Transition {
        /// Owner before the handoff.
        from: ControlOwner,
        /// Owner requested.
        to: ControlOwner,
    },
}

/// Client-side view of one remote browser session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Backend-assigned identifier. Immutable.
    pub session_id: SessionId,
    /// URL of the live browser view (e.g. a VNC/devtools page).
    pub browser_url: Option<String>,
    /// URL of the page the browser is on.
    pub current_url: Option<String>,
    /// Title of the page the browser is on.
    pub current_title: Option<String>,
    /// Latest screenshot (base64 image data). Latest wins.
    pub screenshot: Option<String>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Current owner. Unchanged while a transition is pending.
    pub control_owner: ControlOwner,
    /// Open tabs, in backend order.
    pub tabs: Vec<Tab>,
    /// Timestamp of the newest applied live update.
    pub last_update: Option<DateTime<Utc>>,
    /// Owning context (conversation) if known.
    pub context_id: Option<ContextId>,
    /// In-flight handoff, if any.
    pub pending_transition: Option<PendingTransition>,
    /// Latest agent step.
    pub step: Option<StepProgress>,
    /// Latest backend error message for this session.
    pub last_error: Option<String>,
    /// Whether a streamed event has written live fields.
    pub live_seen: bool,
}

impl Session {
    /// A fresh active session driven by the agent.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            browser_url: None,
            current_url: None,
            current_title: None,
            screenshot: None,
            status: SessionStatus::Active,
            control_owner: ControlOwner::Agent,
            tabs: Vec::new(),
            last_update: None,
            context_id: None,
            pending_transition: None,
            step: None,
            last_error: None,
            live_seen: false,
        }
    }

    /// Whether the session counts toward the active view.
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Whether a handoff is awaiting acknowledgment.
    pub fn in_transition(&self) -> bool {
        self.pending_transition.is_some()
    }

    /// Position in the `agent_active → transition → human_active` cycle.
    pub fn control_phase(&self) -> ControlPhase {
        match (&self.pending_transition, self.control_owner) {
            (Some(pending), from) => ControlPhase::Transition {
                from,
                to: pending.target,
            },
            (None, ControlOwner::Agent) => ControlPhase::AgentActive,
            (None, ControlOwner::Human) => ControlPhase::HumanActive,
        }
    }

    /// Whether the session belongs to `context`.
    pub fn belongs_to(&self, context: &ContextId) -> bool {
        self.context_id.as_ref() == Some(context)
    }
}

/// State of the shared real-time connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport is open.
    #[default]
    Disconnected,
    /// A transport is being opened.
    Connecting,
    /// The transport is open.
    Connected,
    /// A clean shutdown is in progress.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        })
    }
}

/// Classification of a human-originated control request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// A message for the agent; ownership is unchanged.
    Guidance,
    /// A transfer of ownership.
    #[default]
    Handoff,
}

impl TransitionKind {
    /// Wire `action_type` value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guidance => "guidance",
            Self::Handoff => "handoff",
        }
    }
}

/// A request to change (or advise) the owner of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlTransitionRequest {
    /// Target session.
    pub session_id: SessionId,
    /// Owner the caller wants.
    pub desired_owner: ControlOwner,
    /// Optional message for the agent.
    pub message: Option<String>,
    /// Guidance or handoff.
    pub kind: TransitionKind,
    /// Identifier sent on the wire.
    pub request_id: RequestId,
}

impl ControlTransitionRequest {
    /// Build a request; `take_control` selects the human as desired owner.
    pub fn new(
        session_id: SessionId,
        take_control: bool,
        message: Option<String>,
        kind: TransitionKind,
    ) -> Self {
        Self {
            session_id,
            desired_owner: ControlOwner::from_human_control(take_control),
            message,
            kind,
            request_id: RequestId::new(),
        }
    }
}
