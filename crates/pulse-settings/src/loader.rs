//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PulseSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `PULSE_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::PulseSettings;

/// Resolve the default settings file path (`~/.pulse/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pulse").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PulseSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields the defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<PulseSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<PulseSettings> {
    let defaults = serde_json::to_value(PulseSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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

/// Apply `PULSE_*` overrides read through `lookup`.
///
/// Integers must parse and fall inside the accepted range, booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Anything else is
/// ignored with a warning and the file/default value stays.
pub fn apply_overrides<F>(settings: &mut PulseSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("PULSE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("PULSE_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("PULSE_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.u64("PULSE_PONG_WAIT_MS", 100, 3_600_000) {
        settings.connection.pong_wait_ms = v;
    }
    if let Some(v) = env.u64("PULSE_PING_INTERVAL_MS", 50, 3_600_000) {
        settings.connection.ping_interval_ms = Some(v);
    }
    if let Some(v) = env.usize("PULSE_READ_LIMIT", 1, 64 * 1024 * 1024) {
        settings.connection.read_limit = v;
    }
    if let Some(v) = env.u64("PULSE_WRITE_WAIT_MS", 0, 3_600_000) {
        settings.connection.write_wait_ms = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("PULSE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("PULSE_LOG_JSON") {
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

/// Parse a string as an unsigned integer within an inclusive range.
pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

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

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.ranged(name, min, max)
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.ranged(name, min, max)
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.ranged(name, min, max)
    }

    fn ranged<T>(&self, name: &str, min: T, max: T) -> Option<T>
    where
        T: std::str::FromStr + PartialOrd,
    {
        let val = self.string(name)?;
        let result = parse_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
