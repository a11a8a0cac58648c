//! Settings loading: compiled defaults, then the JSON file deep-merged over
//! them, then `SLUICE_*` environment overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{expand_home, SluiceSettings};

/// `~/.sluice/settings.json`.
pub fn settings_path() -> PathBuf {
    expand_home("~/.sluice/settings.json")
}

pub fn load_settings() -> Result<SluiceSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<SluiceSettings> {
    let defaults = serde_json::to_value(SluiceSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SluiceSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut SluiceSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from any variable source. Invalid values are ignored
/// with a warning and the file/default value stays.
pub fn apply_overrides_from<F>(settings: &mut SluiceSettings, read: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { read };

    if let Some(v) = env.string("SLUICE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_range("SLUICE_PORT", 1, 65535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.string("SLUICE_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = env.bool("SLUICE_STORE_ENABLED") {
        settings.store.enabled = v;
    }
    if let Some(v) = env.string("SLUICE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("SLUICE_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = env.u64_range("SLUICE_FINISHED_TTL_SECS", 0, 30 * 24 * 3600) {
        settings.hub.finished_ttl_secs = v;
    }
    if let Some(v) = env.u64_range("SLUICE_MAX_FINISHED_JOBS", 0, 1_000_000) {
        settings.hub.max_finished_jobs = v as usize;
    }
}

struct EnvReader<F> {
    read: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.read)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.read)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_range(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.read)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
