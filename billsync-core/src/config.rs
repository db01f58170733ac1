//! Engine construction parameters.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Provider calls are bounded by this unless configured otherwise.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HISTORY_CAPACITY: usize = 200;
/// Days on either side of the event window scanned for conflicts.
pub const DEFAULT_CONFLICT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Owner of the credentials this engine uses.
    pub user_id: String,
    /// Where engine state is persisted. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub provider_timeout: Duration,
    pub history_capacity: usize,
    pub conflict_window_days: i64,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn new(user_id: impl Into<String>) -> Self {
        EngineConfig {
            user_id: user_id.into(),
            data_dir: None,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            conflict_window_days: DEFAULT_CONFLICT_WINDOW_DAYS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn state_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("sync-state.json"))
    }
}
