//! Layered configuration for the sluice server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SluiceSettings::default()`]
//! 2. **User file**: `~/.sluice/settings.json` or `--config PATH`, deep-merged over defaults
//! 3. **Environment variables**: `SLUICE_*` overrides (highest priority)

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{
    HubSettings, LoggingSettings, PipelineSettings, ServerSettings, SluiceSettings, StoreSettings,
};
