use std::time::Duration;

use anyhow::Result;
use billsync_core::{OperationId, SyncMode, SyncResult};
use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use super::App;
use crate::render::Render;

/// How often new results are printed.
const REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// Run the background worker until Ctrl-C, printing results as they land.
pub async fn run(app: &App) -> Result<()> {
    let shutdown = CancellationToken::new();
    let worker = app.engine.spawn_worker(shutdown.clone());

    let settings = app.engine.settings();
    if !app.json {
        let schedule = match settings.mode {
            SyncMode::Automatic => format!("every {} min", settings.sync_interval_minutes),
            SyncMode::Manual => "manual mode".to_string(),
        };
        println!("Watching ({schedule}). Press Ctrl-C to stop.");
    }

    let mut last_seen: Option<(OperationId, DateTime<Utc>)> = app
        .engine
        .get_status()
        .recent
        .last()
        .map(|r| (r.operation_id, r.timestamp));
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let recent = app.engine.get_status().recent;
                for result in unseen(&recent, last_seen) {
                    if app.json {
                        println!("{}", serde_json::to_string(result)?);
                    } else {
                        println!("{}", result.render());
                    }
                }
                if let Some(last) = recent.last() {
                    last_seen = Some((last.operation_id, last.timestamp));
                }
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = worker.await {
        tracing::warn!(error = %e, "Sync worker ended abnormally");
    }
    if !app.json {
        println!("{}", "Stopped".dimmed());
    }
    Ok(())
}

/// Results recorded after the last one printed. When that one has already
/// rotated out of the bounded history, fall back to its timestamp.
fn unseen(
    recent: &[SyncResult],
    last_seen: Option<(OperationId, DateTime<Utc>)>,
) -> &[SyncResult] {
    let Some((id, at)) = last_seen else {
        return recent;
    };
    let start = match recent.iter().rposition(|r| r.operation_id == id) {
        Some(i) => i + 1,
        None => recent.partition_point(|r| r.timestamp <= at),
    };
    &recent[start..]
}
