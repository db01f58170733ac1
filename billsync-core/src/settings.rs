//! Per-user sync settings.
//!
//! Owned by the settings surface outside the engine; the coordinator only
//! receives validated copies through `open` / `update_settings`.

use std::path::Path;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::bill::{BillId, BillSnapshot};
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::template::EventTemplate;

pub const MAX_SYNC_INTERVAL_MINUTES: u32 = 10_080;
pub const MAX_SYNC_AGE_DAYS: u32 = 3_650;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LocalWins,
    RemoteWins,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Provider names, lowercase.
    pub enabled_providers: Vec<String>,
    /// Opted-in categories. Empty means every category.
    pub sync_categories: Vec<String>,
    /// Bills always mirrored regardless of category.
    pub included_bills: Vec<BillId>,
    /// Bills never mirrored. Wins over `included_bills`.
    pub excluded_bills: Vec<BillId>,
    pub template: EventTemplate,
    pub sync_interval_minutes: u32,
    pub mode: SyncMode,
    pub sync_on_bill_change: bool,
    pub remove_on_pay: bool,
    pub conflict_strategy: ConflictStrategy,
    pub delete_remote_on_disconnect: bool,
    pub max_sync_age_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            enabled_providers: Vec::new(),
            sync_categories: Vec::new(),
            included_bills: Vec::new(),
            excluded_bills: Vec::new(),
            template: EventTemplate::default(),
            sync_interval_minutes: 60,
            mode: SyncMode::Automatic,
            sync_on_bill_change: true,
            remove_on_pay: false,
            conflict_strategy: ConflictStrategy::LocalWins,
            delete_remote_on_disconnect: false,
            max_sync_age_days: 365,
        }
    }
}

impl SyncSettings {
    /// Load settings from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            return Ok(SyncSettings::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let settings: SyncSettings = toml::from_str(&contents).map_err(|e| {
            EngineError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| EngineError::Serialization(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> EngineResult<()> {
        for name in &self.enabled_providers {
            if name.is_empty() || name.chars().any(|c| !c.is_ascii_lowercase()) {
                return Err(config_error(
                    "enabled_providers",
                    format!("'{name}' must be a lowercase provider name"),
                ));
            }
        }
        let mut sorted = self.enabled_providers.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.enabled_providers.len() {
            return Err(config_error("enabled_providers", "contains duplicates"));
        }
        if let Some(id) = self
            .included_bills
            .iter()
            .chain(&self.excluded_bills)
            .find(|id| **id <= 0)
        {
            return Err(config_error(
                "included_bills",
                format!("bill ids must be positive, got {id}"),
            ));
        }
        if !(1..=MAX_SYNC_INTERVAL_MINUTES).contains(&self.sync_interval_minutes) {
            return Err(config_error(
                "sync_interval_minutes",
                format!("must be between 1 and {MAX_SYNC_INTERVAL_MINUTES}"),
            ));
        }
        if !(1..=MAX_SYNC_AGE_DAYS).contains(&self.max_sync_age_days) {
            return Err(config_error(
                "max_sync_age_days",
                format!("must be between 1 and {MAX_SYNC_AGE_DAYS}"),
            ));
        }
        self.template.validate()?;
        Ok(())
    }

    pub fn is_provider_enabled(&self, name: &str) -> bool {
        self.enabled_providers.iter().any(|p| p == name)
    }

    /// Whether the bill should currently be mirrored as an event.
    pub fn wants_event(&self, bill: &BillSnapshot, today: NaiveDate) -> bool {
        if bill.sync_enabled != Some(true) {
            return false;
        }
        if bill.paid && self.remove_on_pay {
            return false;
        }
        if let Some(due) = bill.due_date
            && due < today - Duration::days(i64::from(self.max_sync_age_days))
        {
            return false;
        }
        self.is_bill_selected(bill)
    }

    fn is_bill_selected(&self, bill: &BillSnapshot) -> bool {
        if self.excluded_bills.contains(&bill.id) {
            return false;
        }
        if self.included_bills.contains(&bill.id) {
            return true;
        }
        if self.sync_categories.is_empty() {
            return true;
        }
        match &bill.category {
            Some(category) => self
                .sync_categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(category)),
            None => false,
        }
    }

    pub fn sync_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.sync_interval_minutes) * 60)
    }
}

fn config_error(field: &str, message: impl Into<String>) -> EngineError {
    EngineError::Config(ValidationError::new(field, message).to_string())
}
