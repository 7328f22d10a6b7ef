//! Real-time channel wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminator and an optional
//! `session_id`. Inbound frames are decoded in two steps so that the raw
//! value can still be delivered to catch-all listeners when the typed decode
//! fails: [`parse_frame`] yields a `serde_json::Value`, [`decode`] turns it
//! into an [`InboundMessage`].
//!
//! Timestamps are accepted as epoch milliseconds (integer or float) or as
//! RFC 3339 strings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::{ContextId, RequestId, SessionId};
use crate::session::{SessionStatus, Tab, TransitionKind};

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Discriminator of an inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InboundKind {
    /// Full or partial session state.
    SessionUpdate,
    /// Ownership changed (or a handoff was acknowledged).
    ControlChange,
    /// Screenshot and navigation snapshot.
    ViewportUpdate,
    /// Tab list replacement.
    TabUpdate,
    /// Lifecycle status change.
    Status,
    /// Agent began a step.
    StepStart,
    /// Agent finished a step.
    StepEnd,
    /// Backend error.
    Error,
}

impl InboundKind {
    /// All consumed kinds.
    pub const ALL: [Self; 8] = [
        Self::SessionUpdate,
        Self::ControlChange,
        Self::ViewportUpdate,
        Self::TabUpdate,
        Self::Status,
        Self::StepStart,
        Self::StepEnd,
        Self::Error,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionUpdate => "session_update",
            Self::ControlChange => "control_change",
            Self::ViewportUpdate => "viewport_update",
            Self::TabUpdate => "tab_update",
            Self::Status => "status",
            Self::StepStart => "step_start",
            Self::StepEnd => "step_end",
            Self::Error => "error",
        }
    }

    /// Look up a kind by wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status string as sent by the backend, including the terminal `closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStatus {
    /// Running.
    #[serde(alias = "running")]
    Active,
    /// Suspended.
    Paused,
    /// Failed.
    #[serde(alias = "failed")]
    Error,
    /// Finished.
    #[serde(alias = "finished", alias = "done")]
    Completed,
    /// The backend tore the session down.
    #[serde(alias = "ended")]
    Closed,
}

impl WireStatus {
    /// The session status to store, or `None` when the session should be purged.
    pub fn live(self) -> Option<SessionStatus> {
        match self {
            Self::Active => Some(SessionStatus::Active),
            Self::Paused => Some(SessionStatus::Paused),
            Self::Error => Some(SessionStatus::Error),
            Self::Completed => Some(SessionStatus::Completed),
            Self::Closed => None,
        }
    }
}

/// `session_update`: any subset of session fields.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SessionUpdate {
    /// Target session.
    pub session_id: SessionId,
    /// Live-view URL.
    #[serde(default)]
    pub browser_url: Option<String>,
    /// Current page URL.
    #[serde(default, alias = "url")]
    pub current_url: Option<String>,
    /// Current page title.
    #[serde(default, alias = "title")]
    pub current_title: Option<String>,
    /// Screenshot data.
    #[serde(default)]
    pub screenshot: Option<String>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: Option<WireStatus>,
    /// Current owner flag.
    #[serde(default)]
    pub human_control: Option<bool>,
    /// Full tab list.
    #[serde(default)]
    pub tabs: Option<Vec<Tab>>,
    /// Owning context.
    #[serde(default, alias = "conversation_id")]
    pub context_id: Option<ContextId>,
    /// Event time.
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `viewport_update`: screenshot and navigation snapshot.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ViewportUpdate {
    /// Target session.
    pub session_id: SessionId,
    /// Screenshot data.
    #[serde(default)]
    pub screenshot: Option<String>,
    /// Current page URL.
    #[serde(default, alias = "current_url")]
    pub url: Option<String>,
    /// Current page title.
    #[serde(default, alias = "current_title")]
    pub title: Option<String>,
    /// Full tab list.
    #[serde(default)]
    pub tabs: Option<Vec<Tab>>,
    /// Event time.
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `tab_update`: wholesale tab list replacement.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TabUpdate {
    /// Target session.
    pub session_id: SessionId,
    /// Full tab list.
    pub tabs: Vec<Tab>,
    /// Event time.
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `control_change`: the backend's view of who owns a session.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ControlChange {
    /// Target session.
    pub session_id: SessionId,
    /// Whether the human now owns the session.
    pub human_control: bool,
    /// Optional note from the backend or agent.
    #[serde(default)]
    pub message: Option<String>,
    /// Echo of the `control_toggle` request id, when the backend supports it.
    #[serde(default)]
    pub request_id: Option<RequestId>,
    /// Event time.
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `status`: lifecycle status change.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct StatusUpdate {
    /// Target session.
    pub session_id: SessionId,
    /// New status.
    pub status: WireStatus,
    /// Optional detail.
    #[serde(default)]
    pub message: Option<String>,
    /// Event time.
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `step_start` / `step_end`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct StepEvent {
    /// Target session.
    pub session_id: SessionId,
    /// Step number.
    #[serde(default, alias = "step_number")]
    pub step: Option<u32>,
    /// What the agent is doing.
    #[serde(default, alias = "action", alias = "message")]
    pub description: Option<String>,
    /// Event time.
    #[serde(default, deserialize_with = "de_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `error`: backend-reported failure, optionally scoped to a session.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ErrorEvent {
    /// Session the error concerns, if any.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Error text.
    #[serde(default, alias = "error")]
    pub message: String,
    /// Machine-readable code.
    #[serde(default)]
    pub code: Option<String>,
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    /// `session_update`
    SessionUpdate(SessionUpdate),
    /// `control_change`
    ControlChange(ControlChange),
    /// `viewport_update`
    ViewportUpdate(ViewportUpdate),
    /// `tab_update`
    TabUpdate(TabUpdate),
    /// `status`
    Status(StatusUpdate),
    /// `step_start`
    StepStart(StepEvent),
    /// `step_end`
    StepEnd(StepEvent),
    /// `error`
    Error(ErrorEvent),
}

impl InboundMessage {
    /// Discriminator.
    pub fn kind(&self) -> InboundKind {
        match self {
            Self::SessionUpdate(_) => InboundKind::SessionUpdate,
            Self::ControlChange(_) => InboundKind::ControlChange,
            Self::ViewportUpdate(_) => InboundKind::ViewportUpdate,
            Self::TabUpdate(_) => InboundKind::TabUpdate,
            Self::Status(_) => InboundKind::Status,
            Self::StepStart(_) => InboundKind::StepStart,
            Self::StepEnd(_) => InboundKind::StepEnd,
            Self::Error(_) => InboundKind::Error,
        }
    }

    /// Session this frame concerns, if scoped.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::SessionUpdate(m) => Some(&m.session_id),
            Self::ControlChange(m) => Some(&m.session_id),
            Self::ViewportUpdate(m) => Some(&m.session_id),
            Self::TabUpdate(m) => Some(&m.session_id),
            Self::Status(m) => Some(&m.session_id),
            Self::StepStart(m) | Self::StepEnd(m) => Some(&m.session_id),
            Self::Error(m) => m.session_id.as_ref(),
        }
    }
}

/// Parse a text frame into a JSON value.
pub fn parse_frame(text: &str) -> Result<Value, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

/// Decode a JSON value into a typed inbound message.
pub fn decode(value: &Value) -> Result<InboundMessage, ProtocolError> {
    let name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    let kind =
        InboundKind::from_wire(name).ok_or_else(|| ProtocolError::UnknownType(name.to_owned()))?;

    Ok(match kind {
        InboundKind::SessionUpdate => InboundMessage::SessionUpdate(payload(kind, value)?),
        InboundKind::ControlChange => InboundMessage::ControlChange(payload(kind, value)?),
        InboundKind::ViewportUpdate => InboundMessage::ViewportUpdate(payload(kind, value)?),
        InboundKind::TabUpdate => InboundMessage::TabUpdate(payload(kind, value)?),
        InboundKind::Status => InboundMessage::Status(payload(kind, value)?),
        InboundKind::StepStart => InboundMessage::StepStart(payload(kind, value)?),
        InboundKind::StepEnd => InboundMessage::StepEnd(payload(kind, value)?),
        InboundKind::Error => InboundMessage::Error(payload(kind, value)?),
    })
}

fn payload<T: DeserializeOwned>(kind: InboundKind, value: &Value) -> Result<T, ProtocolError> {
    T::deserialize(value).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.as_str().to_owned(),
        reason: e.to_string(),
    })
}

#[allow(clippy::cast_possible_truncation)]
fn de_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let ms = n
                .as_f64()
                .ok_or_else(|| D::Error::custom("timestamp is not a finite number"))?;
            DateTime::from_timestamp_millis(ms.round() as i64)
                .map(Some)
                .ok_or_else(|| D::Error::custom("timestamp out of range"))
        }
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(D::Error::custom),
        Some(other) => Err(D::Error::custom(format!("invalid timestamp: {other}"))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Subscription channel named in `subscribe` / `unsubscribe` frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Fine-grained updates for one session.
    Session,
    /// Coarse feed of every browser session.
    BrowserSessions,
}

/// A frame the client sends.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Request an ownership change.
    ControlToggle {
        /// Target session.
        session_id: SessionId,
        /// Whether the human should own the session.
        human_control: bool,
        /// Message passed to the agent along with the handoff.
        #[serde(skip_serializing_if = "Option::is_none")]
        additional_prompt: Option<String>,
        /// Client-generated id for deduplication and ack matching.
        request_id: RequestId,
    },
    /// Opt in to a channel for one session.
    Subscribe {
        /// Channel name.
        channel: Channel,
        /// Target session.
        session_id: SessionId,
    },
    /// Opt in to the all-sessions feed.
    SubscribeSessions {
        /// Channel name.
        channel: Channel,
    },
    /// Opt out of a channel.
    Unsubscribe {
        /// Channel name.
        channel: Channel,
        /// Target session, for per-session channels.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    /// Ask for a fresh screenshot.
    GetScreenshot {
        /// Target session.
        session_id: SessionId,
    },
    /// Deliver a human message to the agent.
    UserFeedback {
        /// Target session.
        session_id: SessionId,
        /// Message text.
        message: String,
        /// Guidance or handoff.
        action_type: TransitionKind,
    },
}

impl OutboundMessage {
    /// Wire `type` value.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ControlToggle { .. } => "control_toggle",
            Self::Subscribe { .. } => "subscribe",
            Self::SubscribeSessions { .. } => "subscribe_sessions",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::GetScreenshot { .. } => "get_screenshot",
            Self::UserFeedback { .. } => "user_feedback",
        }
    }

    /// Session this frame concerns, if scoped.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::ControlToggle { session_id, .. }
            | Self::Subscribe { session_id, .. }
            | Self::GetScreenshot { session_id }
            | Self::UserFeedback { session_id, .. } => Some(session_id),
            Self::Unsubscribe { session_id, .. } => session_id.as_ref(),
            Self::SubscribeSessions { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn decode_json(value: &Value) -> Result<InboundMessage, ProtocolError> {
        decode(value)
    }

    #[test]
    fn decodes_viewport_update_with_millis() {
        let msg = decode_json(&json!({
            "type": "viewport_update",
            "session_id": "s1",
            "screenshot": "AAAA",
            "url": "https://example.com",
            "title": "Example",
            "timestamp": 1_707_999_045_123u64
        }))
        .unwrap();
        let InboundMessage::ViewportUpdate(update) = msg else {
            panic!("expected viewport_update");
        };
        assert_eq!(update.session_id.as_str(), "s1");
        assert_eq!(update.url.as_deref(), Some("https://example.com"));
        assert_eq!(
            update.timestamp.unwrap().timestamp_millis(),
            1_707_999_045_123
        );
    }

    #[test]
    fn decodes_rfc3339_timestamp() {
        let msg = decode_json(&json!({
            "type": "tab_update",
            "session_id": "s1",
            "tabs": [{"page_id": "p1", "url": "https://a.test", "title": "A"}],
            "timestamp": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        let InboundMessage::TabUpdate(update) = msg else {
            panic!("expected tab_update");
        };
        assert_eq!(update.tabs.len(), 1);
        assert_eq!(update.timestamp.unwrap().timestamp(), 1_735_689_600);
    }

    #[test]
    fn session_update_accepts_aliases() {
        let msg = decode_json(&json!({
            "type": "session_update",
            "session_id": "s1",
            "url": "https://a.test",
            "title": "A",
            "status": "running",
            "conversation_id": "conv-9"
        }))
        .unwrap();
        let InboundMessage::SessionUpdate(update) = msg else {
            panic!("expected session_update");
        };
        assert_eq!(update.current_url.as_deref(), Some("https://a.test"));
        assert_eq!(update.status, Some(WireStatus::Active));
        assert_eq!(update.context_id.unwrap().as_str(), "conv-9");
        assert!(update.screenshot.is_none());
    }

    #[test]
    fn ended_status_is_terminal() {
        let msg = decode_json(&json!({"type": "status", "session_id": "s1", "status": "ended"}))
            .unwrap();
        let InboundMessage::Status(update) = msg else {
            panic!("expected status");
        };
        assert_eq!(update.status, WireStatus::Closed);
        assert_eq!(update.status.live(), None);
    }

    #[test]
    fn error_without_session() {
        let msg = decode_json(&json!({"type": "error", "message": "boom"})).unwrap();
        assert_eq!(msg.kind(), InboundKind::Error);
        assert!(msg.session_id().is_none());
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = decode_json(&json!({"session_id": "s1"})).unwrap_err();
        assert_eq!(err, ProtocolError::MissingType);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = decode_json(&json!({"type": "heartbeat"})).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("heartbeat".into()));
    }

    #[test]
    fn payload_missing_session_id_is_invalid() {
        let err = decode_json(&json!({"type": "control_change", "human_control": true}))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref kind, .. } if kind == "control_change"));
    }

    #[test]
    fn bad_timestamp_is_invalid_payload() {
        let err = decode_json(&json!({
            "type": "viewport_update",
            "session_id": "s1",
            "timestamp": "yesterday"
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn parse_frame_rejects_garbage() {
        assert!(matches!(
            parse_frame("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn control_toggle_wire_format() {
        let msg = OutboundMessage::ControlToggle {
            session_id: SessionId::from("s1"),
            human_control: true,
            additional_prompt: None,
            request_id: RequestId::from("r1"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "control_toggle",
                "session_id": "s1",
                "human_control": true,
                "request_id": "r1"
            })
        );
        assert_eq!(msg.kind(), "control_toggle");
    }

    #[test]
    fn subscribe_wire_format() {
        let msg = OutboundMessage::Subscribe {
            channel: Channel::Session,
            session_id: SessionId::from("s1"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"type": "subscribe", "channel": "session", "session_id": "s1"})
        );
    }

    #[test]
    fn user_feedback_carries_action_type() {
        let msg = OutboundMessage::UserFeedback {
            session_id: SessionId::from("s1"),
            message: "try the second link".into(),
            action_type: TransitionKind::Guidance,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "user_feedback");
        assert_eq!(json["action_type"], "guidance");
    }

    #[test]
    fn subscribe_sessions_has_no_session() {
        let msg = OutboundMessage::SubscribeSessions {
            channel: Channel::BrowserSessions,
        };
        assert!(msg.session_id().is_none());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["channel"], "browser_sessions");
    }
}
