//! # servdeck-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ServdeckSettings::default()`]
//! 2. **Settings file**: `~/.servdeck/settings.json`, or the path in
//!    `SERVDECK_SETTINGS` (deep-merged over defaults)
//! 3. **Environment variables**: `SERVDECK_*` overrides (highest priority)
//!
//! The managed-server catalog lives in the `servers` array and is the only
//! source of truth for which server ids the process may connect to.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
