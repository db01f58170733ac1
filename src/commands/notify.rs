use anyhow::{Context, Result, bail};
use billsync_core::{BillId, ChangeKind};

use super::App;

/// Tell the engine a bill changed. Only enqueues; `sync` (or a running
/// `watch`) does the network work.
pub fn run(app: &App, bill_id: BillId, change: ChangeKind) -> Result<()> {
    let snapshot = match change {
        ChangeKind::Deleted => app.bills.remove(bill_id)?,
        ChangeKind::Paid => app.bills.modify(bill_id, |bill| bill.paid = true)?,
        ChangeKind::Created | ChangeKind::Updated => app.bills.get(bill_id),
    };
    let Some(snapshot) = snapshot else {
        bail!("Bill {bill_id} not found in the bill store");
    };

    app.engine
        .notify_bill_changed(&snapshot, change)
        .with_context(|| format!("Failed to record {change} for bill {bill_id}"))?;

    let pending = app.engine.get_status().pending;
    if app.json {
        return app.print_json(&serde_json::json!({
            "bill_id": bill_id,
            "change": change.to_string(),
            "pending": pending,
        }));
    }
    println!("Recorded {change} for bill {bill_id} ({pending} pending)");
    Ok(())
}
