//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CobrowseSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `COBROWSE_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::CobrowseSettings;

/// Default settings file location (`~/.cobrowse/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".cobrowse").join("settings.json")
}

/// Load settings from `path`; a missing file yields defaults plus env overrides.
pub fn load_settings_from_path(path: &Path) -> Result<CobrowseSettings> {
    let defaults = serde_json::to_value(CobrowseSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CobrowseSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge: objects merge per key, everything else is replaced,
/// and `null` in `source` keeps the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COBROWSE_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut CobrowseSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("COBROWSE_WS_URL") {
        settings.connection.ws_url = v;
    }
    if let Some(v) = env.u64("COBROWSE_RECONNECT_BASE_DELAY_MS", 10, 600_000) {
        settings.connection.reconnect_base_delay_ms = v;
    }
    if let Some(v) = env.u64("COBROWSE_RECONNECT_MAX_DELAY_MS", 10, 3_600_000) {
        settings.connection.reconnect_max_delay_ms = v;
    }
    if let Some(v) = env.u64("COBROWSE_MAX_RECONNECT_ATTEMPTS", 0, 1000) {
        #[allow(clippy::cast_possible_truncation)]
        let attempts = v as u32;
        settings.connection.max_reconnect_attempts = attempts;
    }
    if let Some(v) = env.u64("COBROWSE_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.connection.connect_timeout_ms = v;
    }
    if let Some(v) = env.u64("COBROWSE_TRANSITION_TIMEOUT_MS", 100, 600_000) {
        settings.handoff.transition_timeout_ms = v;
    }
    if let Some(v) = env.string("COBROWSE_API_URL") {
        settings.backend.api_url = v;
    }
    if let Some(v) = env.u64("COBROWSE_REQUEST_TIMEOUT_MS", 100, 600_000) {
        settings.backend.request_timeout_ms = v;
    }
    if let Some(v) = env.string("COBROWSE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("COBROWSE_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, min, max, "invalid integer env var, ignoring");
        }
        parsed
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let parsed = parse_bool(&val);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        parsed
    }
}
