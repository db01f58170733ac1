pub mod conflicts;
pub mod connect;
pub mod notify;
pub mod status;
pub mod sync;
pub mod watch;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use billsync_core::{EncryptedFileStore, EngineConfig, SyncCoordinator, SyncSettings};
use serde::Serialize;

use crate::bills::JsonBillStore;
use crate::config::{self, CliConfig, PASSPHRASE_ENV};
use crate::provider;

/// Everything a command needs: the engine, the bill file and the output mode.
pub struct App {
    pub engine: SyncCoordinator,
    pub bills: Arc<JsonBillStore>,
    pub config: CliConfig,
    pub json: bool,
}

impl App {
    pub fn open(json: bool) -> Result<Self> {
        let config = CliConfig::load()?;
        let data_dir = config.data_dir()?;
        let settings_path = config::settings_path()?;
        let settings = SyncSettings::load(&settings_path)
            .with_context(|| format!("Failed to load {}", settings_path.display()))?;

        let passphrase = read_passphrase()?;
        let credentials = EncryptedFileStore::open(data_dir.join("credentials"), &passphrase)
            .context("Failed to open credential store")?;
        let bills = Arc::new(
            JsonBillStore::open(data_dir.join("bills.json")).context("Failed to open bill store")?,
        );

        let engine = SyncCoordinator::open(
            EngineConfig::new(config.user()).with_data_dir(data_dir),
            settings,
            provider::build_registry(&config),
            Arc::new(credentials),
            bills.clone(),
        )
        .context("Failed to start sync engine")?;

        Ok(App {
            engine,
            bills,
            config,
            json,
        })
    }

    /// Print `value` as pretty JSON on stdout.
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
        println!("{out}");
        Ok(())
    }
}

fn read_passphrase() -> Result<String> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Ok(passphrase);
    }
    prompt_password("Credential store passphrase")
}

pub fn prompt_text(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub fn prompt_password(label: &str) -> Result<String> {
    let prompt = format!("{label}: ");
    rpassword::prompt_password(&prompt).context("Failed to read password")
}
