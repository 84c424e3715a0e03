//! MumbleChat Settings
//!
//! Relay node configuration shared by the daemon and CLI.
//!
//! ## Usage
//!
//! ```no_run
//! use mumblechat_settings::{Settings, AckMode};
//!
//! // Load or create default settings
//! let mut settings = Settings::load_or_default()?;
//!
//! settings.relay.ack_mode = AckMode::Persisted;
//!
//! settings.save()?;
//! # Ok::<(), mumblechat_settings::SettingsError>(())
//! ```

mod config;

pub use config::{
    AckMode, HubMode, HubSettings, NetworkSettings, NodeSettings, RegistryMode,
    RegistrySettings, RelaySettings, Settings,
};

use std::path::PathBuf;

use mumblechat_keystore::default_config_dir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
