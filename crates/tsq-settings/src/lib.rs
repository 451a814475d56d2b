//! # tsq-settings
//!
//! Layered configuration for the tsq client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TsqSettings::default()`]
//! 2. **User file**: `~/.tsq/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TSQ_*` overrides (highest priority)
//!
//! [`TsqSettings::to_connect_options`] turns the result into
//! [`tsq_client::ConnectOptions`]. The client crates never read files or
//! the environment themselves.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_file_layer, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::{ConnectionSettings, LoggingSettings, LoginSettings, TimeoutSettings, TsqSettings};
