//! # courier-settings
//!
//! Configuration for the courier connection service.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`CourierSettings::default()`]
//! 2. **Config file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `COURIER_*` overrides (highest priority)
//!
//! The merged result is validated before it is handed out; there is no
//! global instance, callers pass the settings to the components they build.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, default_config_path, load_settings, load_settings_from_path,
    load_with_env,
};
pub use types::*;
