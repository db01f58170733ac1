//! JSON file bill store.
//!
//! Stands in for the bill-management application: bills are kept as a JSON
//! array of snapshots and rewritten whenever the engine writes back an event
//! id or a remote edit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use billsync_core::{BillId, BillSnapshot, BillStore, EngineError, EngineResult, RemoteEdit};
use chrono::Utc;
use parking_lot::RwLock;

#[derive(Debug)]
pub struct JsonBillStore {
    path: PathBuf,
    bills: RwLock<BTreeMap<BillId, BillSnapshot>>,
}

impl JsonBillStore {
    /// Open the store. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let bills = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let list: Vec<BillSnapshot> = serde_json::from_str(&contents).map_err(|e| {
                EngineError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            list.into_iter().map(|b| (b.id, b)).collect()
        } else {
            BTreeMap::new()
        };
        Ok(JsonBillStore {
            path,
            bills: RwLock::new(bills),
        })
    }

    pub fn get(&self, bill_id: BillId) -> Option<BillSnapshot> {
        self.bills.read().get(&bill_id).cloned()
    }

    pub fn upsert(&self, bill: BillSnapshot) -> EngineResult<()> {
        let mut bills = self.bills.write();
        bills.insert(bill.id, bill);
        save(&self.path, &bills)
    }

    pub fn remove(&self, bill_id: BillId) -> EngineResult<Option<BillSnapshot>> {
        let mut bills = self.bills.write();
        let removed = bills.remove(&bill_id);
        if removed.is_some() {
            save(&self.path, &bills)?;
        }
        Ok(removed)
    }

    /// Apply `f` to a bill, stamp it modified and persist.
    pub fn modify(
        &self,
        bill_id: BillId,
        f: impl FnOnce(&mut BillSnapshot),
    ) -> EngineResult<Option<BillSnapshot>> {
        let mut bills = self.bills.write();
        let Some(bill) = bills.get_mut(&bill_id) else {
            return Ok(None);
        };
        f(bill);
        bill.last_modified = Utc::now();
        let updated = bill.clone();
        save(&self.path, &bills)?;
        Ok(Some(updated))
    }
}

/// Write via a temp file and rename.
fn save(path: &Path, bills: &BTreeMap<BillId, BillSnapshot>) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let list: Vec<&BillSnapshot> = bills.values().collect();
    let contents = serde_json::to_vec_pretty(&list)
        .map_err(|e| EngineError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl BillStore for JsonBillStore {
    fn load_bill_snapshot(&self, bill_id: BillId) -> EngineResult<Option<BillSnapshot>> {
        Ok(self.get(bill_id))
    }

    fn list_bill_snapshots(&self) -> EngineResult<Vec<BillSnapshot>> {
        Ok(self.bills.read().values().cloned().collect())
    }

    fn record_external_event_id(
        &self,
        bill_id: BillId,
        provider: &str,
        external_id: Option<&str>,
    ) -> EngineResult<()> {
        let mut bills = self.bills.write();
        let Some(bill) = bills.get_mut(&bill_id) else {
            return Ok(());
        };
        match external_id {
            Some(id) => {
                bill.external_ids.insert(provider.to_string(), id.to_string());
            }
            None => {
                bill.external_ids.remove(provider);
            }
        }
        save(&self.path, &bills)
    }

    fn apply_remote_edit(&self, bill_id: BillId, edit: &RemoteEdit) -> EngineResult<()> {
        let updated = self.modify(bill_id, |bill| bill.due_date = Some(edit.due_date))?;
        if updated.is_none() {
            tracing::warn!(bill_id, "Remote edit for a bill that no longer exists");
        }
        Ok(())
    }
}
