use anyhow::Result;
use billsync_core::{BillId, Outcome, SyncResult};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use super::App;
use crate::render::{Render, pluralize};

/// Drain the queue once, or only one bill's operations.
///
/// Ctrl-C stops dispatching new operations; whatever completed is still
/// reported.
pub async fn run(app: &App, bill: Option<BillId>) -> Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let results = match bill {
        Some(id) => app.engine.sync_bill_with(id, &cancel).await,
        None => app.engine.sync_all_with(&cancel).await,
    };
    watcher.abort();

    report(app, &results, cancel.is_cancelled())
}

/// Requeue permanently failed operations, then sync them.
pub async fn retry(app: &App, bill: Option<BillId>) -> Result<()> {
    let requeued = app.engine.retry_failed(bill)?;
    if !app.json {
        println!(
            "Requeued {} failed {}",
            requeued,
            pluralize("operation", requeued)
        );
    }
    run(app, bill).await
}

fn report(app: &App, results: &[SyncResult], interrupted: bool) -> Result<()> {
    if app.json {
        return app.print_json(results);
    }

    if results.is_empty() {
        println!("{}", "Nothing to sync".dimmed());
    }
    for result in results {
        println!("{}", result.render());
    }

    let count = |outcome: Outcome| results.iter().filter(|r| r.outcome == outcome).count();
    let succeeded = count(Outcome::Succeeded);
    let conflicts = count(Outcome::Conflict);
    if !results.is_empty() {
        println!(
            "\n{} of {} {} succeeded",
            succeeded,
            results.len(),
            pluralize("operation", results.len())
        );
    }
    if conflicts > 0 {
        let noun = pluralize("conflict", conflicts);
        println!(
            "{}",
            format!("{conflicts} {noun} need a decision: run `billsync conflicts`").magenta()
        );
    }
    if interrupted {
        println!("{}", "Interrupted; remaining operations stay queued".yellow());
    }
    Ok(())
}
