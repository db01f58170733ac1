//! Units of sync work.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bill::{BillId, BillSnapshot};

/// Operation kind. Declaration order is dispatch priority: lower value first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Create = 0,
    Update = 1,
    Delete = 2,
}

impl OperationKind {
    pub fn priority(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        OperationId(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The (bill, provider) pair an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    pub bill_id: BillId,
    pub provider: String,
}

impl OperationKey {
    pub fn new(bill_id: BillId, provider: impl Into<String>) -> Self {
        OperationKey {
            bill_id,
            provider: provider.into(),
        }
    }
}

/// A payload the provider refused as invalid. Nothing is re-derived for the
/// key until the bill changes after `bill_modified`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub bill_id: BillId,
    pub provider: String,
    pub bill_modified: DateTime<Utc>,
}

impl Rejection {
    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.bill_id, self.provider.clone())
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bill {} on {}", self.bill_id, self.provider)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub bill_id: BillId,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Earliest time the retry scheduler allows dispatch. `None` means now.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Bill as it was when the operation was enqueued. Absent for deletes
    /// re-derived for bills that no longer exist.
    #[serde(default)]
    pub snapshot: Option<BillSnapshot>,
    /// External id known at enqueue time, used by deletes without a marker.
    #[serde(default)]
    pub external_id: Option<String>,
}

impl SyncOperation {
    pub fn new(
        kind: OperationKind,
        bill_id: BillId,
        provider: impl Into<String>,
        snapshot: Option<BillSnapshot>,
    ) -> Self {
        SyncOperation {
            id: OperationId::new(),
            kind,
            bill_id,
            provider: provider.into(),
            created_at: Utc::now(),
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
            snapshot,
            external_id: None,
        }
    }

    pub fn with_external_id(mut self, external_id: Option<String>) -> Self {
        self.external_id = external_id;
        self
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.bill_id, self.provider.clone())
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|t| t <= now)
    }
}
