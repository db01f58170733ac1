//! CLI configuration: `<config_dir>/billsync/config.toml`.
//!
//! Sync settings live next to it in `settings.toml` and are owned by the
//! engine; this file only says where things are and how to reach providers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable holding the credential store passphrase.
pub const PASSPHRASE_ENV: &str = "BILLSYNC_PASSPHRASE";

#[derive(Debug, Default, Deserialize)]
pub struct CliConfig {
    /// Owner of the stored credentials. Defaults to `$USER`.
    #[serde(default)]
    pub user: Option<String>,

    /// Engine state, credentials and the bill file. Defaults to the platform data dir.
    #[serde(default)]
    pub data_dir: Option<String>,

    #[serde(default)]
    pub providers: Providers,
}

#[derive(Debug, Default, Deserialize)]
pub struct Providers {
    pub google: Option<GoogleConfig>,
    pub outlook: Option<OutlookConfig>,
    pub caldav: Option<CalDavConfig>,
}

/// OAuth client for Google Calendar
#[derive(Debug, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Azure app registration for Microsoft Graph
#[derive(Debug, Deserialize)]
pub struct OutlookConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CalDavConfig {
    /// Calendar collection, e.g. `https://dav.example.com/calendars/me/bills/`
    #[serde(default)]
    pub calendar_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl CliConfig {
    /// Load from the default location. A missing file means defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(CliConfig::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }

    pub fn user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(expand_path(dir)),
            None => Ok(dirs::data_dir()
                .context("Could not determine data directory")?
                .join("billsync")),
        }
    }
}

/// `~/.config/billsync` (platform equivalent)
pub fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("Could not determine config directory")?
        .join("billsync"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn settings_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("settings.toml"))
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}
