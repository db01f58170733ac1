//! Read-only bill snapshots handed to the engine by the bill-management side.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub type BillId = i64;

/// Lifecycle change reported through `notify_bill_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Paid,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Paid => "paid",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(ChangeKind::Created),
            "updated" => Ok(ChangeKind::Updated),
            "deleted" => Ok(ChangeKind::Deleted),
            "paid" => Ok(ChangeKind::Paid),
            other => Err(format!(
                "Unknown change kind '{other}'. Expected created, updated, deleted or paid"
            )),
        }
    }
}

/// Snapshot of a bill at the moment it changed.
///
/// `due_date` and `sync_enabled` are optional here only so that incomplete
/// snapshots can be represented and rejected by [`BillSnapshot::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillSnapshot {
    pub id: BillId,
    pub name: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub sync_enabled: Option<bool>,
    #[serde(default)]
    pub paid: bool,
    pub last_modified: DateTime<Utc>,
    /// External event ids already known to the bill store, keyed by provider.
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,
}

impl BillSnapshot {
    /// Check the fields the engine cannot work without and return the due date.
    pub fn validate(&self) -> EngineResult<NaiveDate> {
        if self.id <= 0 {
            return Err(EngineError::InvalidSnapshot(format!(
                "bill id must be positive, got {}",
                self.id
            )));
        }
        if self.sync_enabled.is_none() {
            return Err(EngineError::InvalidSnapshot(format!(
                "bill {} is missing its sync eligibility flag",
                self.id
            )));
        }
        self.due_date.ok_or_else(|| {
            EngineError::InvalidSnapshot(format!("bill {} is missing a due date", self.id))
        })
    }

    pub fn external_id(&self, provider: &str) -> Option<&str> {
        self.external_ids.get(provider).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_bill() -> BillSnapshot {
        BillSnapshot {
            id: 7,
            name: "Electric".into(),
            amount: Some(84.5),
            category: Some("Utilities".into()),
            due_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            sync_enabled: Some(true),
            paid: false,
            last_modified: Utc::now(),
            external_ids: BTreeMap::new(),
        }
    }

    #[test]
    fn complete_snapshot_validates() {
        let bill = make_test_bill();
        assert_eq!(bill.validate().unwrap(), NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mut bill = make_test_bill();
        bill.due_date = None;
        assert!(matches!(bill.validate(), Err(EngineError::InvalidSnapshot(_))));

        let mut bill = make_test_bill();
        bill.sync_enabled = None;
        assert!(matches!(bill.validate(), Err(EngineError::InvalidSnapshot(_))));

        let mut bill = make_test_bill();
        bill.id = 0;
        assert!(bill.validate().is_err());
    }

    #[test]
    fn change_kind_parses_case_insensitively() {
        assert_eq!("PAID".parse::<ChangeKind>().unwrap(), ChangeKind::Paid);
        assert!("archived".parse::<ChangeKind>().is_err());
    }
}
