//! Hooks into the bill-management side, which owns the bill records.

use crate::bill::{BillId, BillSnapshot};
use crate::conflict::RemoteEdit;
use crate::error::EngineResult;

pub trait BillStore: Send + Sync {
    /// Current snapshot of a bill, or `None` if it no longer exists.
    fn load_bill_snapshot(&self, bill_id: BillId) -> EngineResult<Option<BillSnapshot>>;

    /// Every bill, used by the reconciliation pass.
    fn list_bill_snapshots(&self) -> EngineResult<Vec<BillSnapshot>>;

    /// Write-back of the provider event id (`None` clears it).
    fn record_external_event_id(
        &self,
        bill_id: BillId,
        provider: &str,
        external_id: Option<&str>,
    ) -> EngineResult<()>;

    /// Pull remote edits back into the bill when the remote side wins a conflict.
    fn apply_remote_edit(&self, bill_id: BillId, edit: &RemoteEdit) -> EngineResult<()>;
}
