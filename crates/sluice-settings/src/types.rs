use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use sluice_core::KeyScope;

use crate::errors::{Result, SettingsError};

/// Top-level settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceSettings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
    pub pipelines: Vec<PipelineSettings>,
}

impl SluiceSettings {
    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(SettingsError::InvalidValue("server.port must be non-zero".into()));
        }
        if self.server.max_error_chars == 0 {
            return Err(SettingsError::InvalidValue(
                "server.max_error_chars must be non-zero".into(),
            ));
        }
        if self.hub.sweep_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.sweep_interval_secs must be non-zero".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for p in &self.pipelines {
            if p.name.trim().is_empty() {
                return Err(SettingsError::InvalidValue("pipeline name is empty".into()));
            }
            if !p.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                return Err(SettingsError::InvalidValue(format!(
                    "pipeline name '{}' may only contain letters, digits, '-' and '_'",
                    p.name
                )));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(SettingsError::InvalidValue(format!(
                    "duplicate pipeline '{}'",
                    p.name
                )));
            }
            if !(p.engine_url.starts_with("http://") || p.engine_url.starts_with("https://")) {
                return Err(SettingsError::InvalidValue(format!(
                    "pipeline '{}': engine_url must be an http(s) URL",
                    p.name
                )));
            }
            if p.label_key.trim().is_empty() {
                return Err(SettingsError::InvalidValue(format!(
                    "pipeline '{}': label_key is empty",
                    p.name
                )));
            }
            if p.idle_timeout_secs == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "pipeline '{}': idle_timeout_secs must be non-zero",
                    p.name
                )));
            }
        }
        Ok(())
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineSettings> {
        self.pipelines.iter().find(|p| p.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Seconds between SSE keep-alive comments; 0 disables them.
    pub keep_alive_secs: u64,
    pub shutdown_grace_secs: u64,
    pub max_error_chars: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9191,
            keep_alive_secs: 15,
            shutdown_grace_secs: 10,
            max_error_chars: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub finished_ttl_secs: u64,
    pub max_finished_jobs: usize,
    pub sweep_interval_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            finished_ttl_secs: 3600,
            max_finished_jobs: 1024,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub enabled: bool,
    /// `~` expands to `$HOME`.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: "~/.sluice/database/runs.db".into(),
        }
    }
}

impl StoreSettings {
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"sluice_engine": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            module_levels: BTreeMap::new(),
        }
    }
}

/// One named pipeline served by the hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub name: String,
    pub engine_url: String,
    pub key_scope: KeyScope,
    /// Field of the completion output to report as the result. The whole
    /// output is reported when unset.
    pub result_field: Option<String>,
    pub label_key: String,
    pub preview_chars: usize,
    pub max_sources: usize,
    pub idle_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            engine_url: String::new(),
            key_scope: KeyScope::Session,
            result_field: None,
            label_key: "task".into(),
            preview_chars: 200,
            max_sources: 8,
            idle_timeout_secs: 90,
        }
    }
}

pub(crate) fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(path),
    }
}
