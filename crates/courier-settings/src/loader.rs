//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CourierSettings::default()`]
//! 2. If the config file exists, deep-merge its values over defaults
//! 3. Apply `COURIER_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{CourierSettings, NodeSettings};

/// Default config file location (`./config.json`), overridable with `COURIER_CONFIG`.
pub fn default_config_path() -> PathBuf {
    std::env::var("COURIER_CONFIG")
        .ok()
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from("config.json"), PathBuf::from)
}

/// Load settings from the default path with process env overrides.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&default_config_path())
}

/// Load settings from a specific path with process env overrides.
///
/// A missing file yields defaults; invalid JSON or an invalid merged result
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    load_with_env(path, std::env::vars())
}

/// Load settings from `path`, taking overrides from `vars` instead of the process env.
pub fn load_with_env(
    path: &Path,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CourierSettings = serde_json::from_value(merged)?;
    let env: HashMap<String, String> = vars
        .into_iter()
        .filter(|(k, _)| k.starts_with("COURIER_"))
        .collect();
    apply_env_overrides(&mut settings, &env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COURIER_*` overrides from `env`.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut CourierSettings, env: &HashMap<String, String>) {
    let vars = EnvVars(env);

    // ── App ─────────────────────────────────────────────────────────
    if let Some(v) = vars.string("COURIER_HOST") {
        settings.app.host = v;
    }
    if let Some(v) = vars.u16("COURIER_PORT", 0, 65535) {
        settings.app.port = v;
    }

    // ── WebSocket ───────────────────────────────────────────────────
    if let Some(v) = vars.u64("COURIER_WS_TIMEOUT_MS", 100, 3_600_000) {
        settings.ws.timeout_ms = v;
    }
    if let Some(v) = vars.u64("COURIER_WS_PING_INTERVAL_MS", 50, 3_600_000) {
        settings.ws.ping_interval_ms = v;
    }
    if let Some(v) = vars.usize("COURIER_WS_READ_LIMIT", 1, 256 * 1024 * 1024) {
        settings.ws.read_limit = v;
    }
    if let Some(v) = vars.usize("COURIER_WS_BUFFER_SIZE", 1, 1_000_000) {
        settings.ws.buffer_size = v;
    }

    // ── Bus ─────────────────────────────────────────────────────────
    if let Some(v) = vars.string("COURIER_USER_TOPIC") {
        settings.bus.user_topic = v;
    }
    if let Some(v) = vars.string("COURIER_REDIS_HOST") {
        settings.bus.single.get_or_insert_with(NodeSettings::default).host = v;
    }
    if let Some(v) = vars.u16("COURIER_REDIS_PORT", 1, 65535) {
        settings.bus.single.get_or_insert_with(NodeSettings::default).port = v;
    }
    if let Some(cluster) = settings.bus.cluster.as_mut() {
        if let Some(v) = vars.string("COURIER_CONSUL_HOST") {
            cluster.consul.host = v;
        }
        if let Some(v) = vars.u16("COURIER_CONSUL_PORT", 1, 65535) {
            cluster.consul.port = v;
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = vars.string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = vars.bool("COURIER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvVars<'a>(&'a HashMap<String, String>);

impl EnvVars<'_> {
    fn raw(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty()).map(str::to_owned)
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = self.raw(name)?;
        let result = parse(val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}
