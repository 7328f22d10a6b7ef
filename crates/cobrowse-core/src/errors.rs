//! Error taxonomy for the session coordinator.
//!
//! - [`ConnectionError`]: the real-time channel could not be opened or written to
//! - [`ProtocolError`]: an inbound frame was malformed or of an unknown type;
//!   always dropped and logged, never propagated into callers
//! - [`TransitionError`]: a control handoff failed or timed out; the session
//!   has already been rolled back when the caller sees it
//! - [`TerminalReconnectError`]: reconnect attempts exhausted; surfaced as a
//!   persistent offline state

use thiserror::Error;

use crate::ids::SessionId;
use crate::session::ControlOwner;

/// The real-time channel could not be opened or written to.
///
/// `Clone` so a single in-flight connect attempt can hand the same outcome
/// to every caller waiting on it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The transport refused or failed the handshake.
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailed {
        /// Endpoint that was dialed.
        url: String,
        /// Transport-level reason.
        reason: String,
    },

    /// The handshake did not complete within the connect timeout.
    #[error("timed out after {timeout_ms}ms connecting to {url}")]
    Timeout {
        /// Endpoint that was dialed.
        url: String,
        /// Configured connect timeout.
        timeout_ms: u64,
    },

    /// The channel was open but a frame could not be written.
    #[error("failed to send frame: {0}")]
    SendFailed(String),

    /// An outbound message could not be serialized.
    #[error("failed to encode outbound message: {0}")]
    Encode(String),

    /// The connection closed while the operation was in progress.
    #[error("connection closed")]
    Closed,
}

/// A malformed or unexpected inbound frame.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(String),

    /// The frame had no string `type` field.
    #[error("frame has no `type` field")]
    MissingType,

    /// The `type` field named a message kind this client does not consume.
    #[error("unknown message type '{0}'")]
    UnknownType(String),

    /// The payload did not match the schema for its `type`.
    #[error("invalid '{kind}' payload: {reason}")]
    InvalidPayload {
        /// The message `type`.
        kind: String,
        /// Deserializer diagnostic.
        reason: String,
    },
}

/// Why a control handoff did not complete.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The session is not in the registry.
    #[error("session '{0}' not found")]
    SessionNotFound(SessionId),

    /// Another transition for this session is still awaiting its ack.
    #[error("session '{0}' already has a control transition in progress")]
    AlreadyPending(SessionId),

    /// Guidance requires a message and none was supplied.
    #[error("guidance for session '{0}' requires a message")]
    EmptyGuidance(SessionId),

    /// No acknowledgment arrived before the transition timeout.
    #[error("control transition for '{session_id}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Session whose transition timed out.
        session_id: SessionId,
        /// Configured transition timeout.
        timeout_ms: u64,
    },

    /// The backend reported the opposite owner instead of acknowledging.
    #[error("backend kept control of '{session_id}' with {owner}")]
    Rejected {
        /// Session whose transition was rejected.
        session_id: SessionId,
        /// Owner reported by the backend.
        owner: ControlOwner,
    },

    /// The backend sent an `error` event for the session while pending.
    #[error("backend error for '{session_id}': {message}")]
    Backend {
        /// Session the error refers to.
        session_id: SessionId,
        /// Backend-provided message.
        message: String,
    },

    /// The connection dropped before an acknowledgment arrived.
    #[error("connection lost during control transition for '{0}'")]
    ConnectionLost(SessionId),

    /// The session was closed or ended while the transition was pending.
    #[error("session '{0}' closed during control transition")]
    SessionClosed(SessionId),

    /// The request frame could not be delivered.
    #[error("failed to send control request: {0}")]
    Send(#[from] ConnectionError),
}

impl TransitionError {
    /// Whether a caller could reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionLost(_) | Self::Send(_) | Self::AlreadyPending(_)
        )
    }
}

/// Reconnect attempts were exhausted; the manager stays offline until the
/// next explicit `connect`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("gave up reconnecting after {attempts} attempts")]
pub struct TerminalReconnectError {
    /// Number of reconnect attempts made.
    pub attempts: u32,
}
