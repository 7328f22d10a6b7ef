//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may specify any subset of fields.

use std::time::Duration;

use cobrowse_core::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CobrowseSettings {
    /// Real-time channel settings.
    pub connection: ConnectionSettings,
    /// Control handoff settings.
    pub handoff: HandoffSettings,
    /// HTTP backend settings.
    pub backend: BackendSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl CobrowseSettings {
    /// Reject values that would make the client unusable.
    pub fn validate(&self) -> Result<()> {
        let ws = &self.connection.ws_url;
        if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "connection.wsUrl must start with ws:// or wss://, got '{ws}'"
            )));
        }
        let api = &self.backend.api_url;
        if !(api.starts_with("http://") || api.starts_with("https://")) {
            return Err(SettingsError::InvalidValue(format!(
                "backend.apiUrl must start with http:// or https://, got '{api}'"
            )));
        }
        if self.handoff.transition_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "handoff.transitionTimeoutMs must be positive".into(),
            ));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.connectTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Real-time channel settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// WebSocket endpoint. A session hint is appended as a path segment.
    pub ws_url: String,
    /// Delay before the first reconnect attempt.
    pub reconnect_base_delay_ms: u64,
    /// Cap on any single reconnect delay.
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempts before going offline.
    pub max_reconnect_attempts: u32,
    /// Bound on each open attempt.
    pub connect_timeout_ms: u64,
    /// Outbound frame queue depth.
    pub outbound_buffer: usize,
    /// Broadcast buffer for async event subscribers.
    pub event_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8000/ws".to_string(),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 10_000,
            outbound_buffer: 64,
            event_buffer: 256,
        }
    }
}

impl ConnectionSettings {
    /// Reconnect backoff policy.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.reconnect_base_delay_ms,
            max_delay_ms: self.reconnect_max_delay_ms,
            max_attempts: self.max_reconnect_attempts,
        }
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Control handoff settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandoffSettings {
    /// How long to wait for a `control_change` acknowledgment.
    pub transition_timeout_ms: u64,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            transition_timeout_ms: 10_000,
        }
    }
}

impl HandoffSettings {
    /// Transition timeout.
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }
}

/// HTTP backend settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Base URL of the session/task API.
    pub api_url: String,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = CobrowseSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.connection.max_reconnect_attempts, 5);
        assert_eq!(settings.handoff.transition_timeout_ms, 10_000);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: CobrowseSettings =
            serde_json::from_str(r#"{"connection": {"wsUrl": "wss://example.test/ws"}}"#).unwrap();
        assert_eq!(settings.connection.ws_url, "wss://example.test/ws");
        assert_eq!(settings.connection.reconnect_base_delay_ms, 1000);
        assert_eq!(settings.backend, BackendSettings::default());
    }

    #[test]
    fn backoff_policy_mirrors_fields() {
        let conn = ConnectionSettings {
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 4000,
            max_reconnect_attempts: 3,
            ..ConnectionSettings::default()
        };
        let policy = conn.backoff_policy();
        assert_eq!(policy.base_delay_ms, 250);
        assert_eq!(policy.max_delay_ms, 4000);
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn rejects_http_ws_url() {
        let mut settings = CobrowseSettings::default();
        settings.connection.ws_url = "http://nope".into();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn rejects_zero_transition_timeout() {
        let mut settings = CobrowseSettings::default();
        settings.handoff.transition_timeout_ms = 0;
        assert!(settings.validate().is_err());
    }
}
