//! Colored terminal rendering for engine types.

use billsync_core::{
    Conflict, ConflictKind, ConnectionResult, ConnectionStatus, Outcome, SyncOperation, SyncResult,
    SyncStatus,
};
use chrono::{DateTime, Local, Utc};
use owo_colors::OwoColorize;

pub trait Render {
    fn render(&self) -> String;
}

impl Render for Outcome {
    fn render(&self) -> String {
        match self {
            Outcome::Succeeded => "✓".green().to_string(),
            Outcome::Retrying => "↻".yellow().to_string(),
            Outcome::Failed => "✗".red().to_string(),
            Outcome::Dropped => "-".red().to_string(),
            Outcome::Conflict => "!".magenta().to_string(),
            Outcome::Discarded => "~".dimmed().to_string(),
        }
    }
}

impl Render for SyncResult {
    fn render(&self) -> String {
        let mut line = format!(
            "{} {} bill {} on {}",
            self.outcome.render(),
            self.kind,
            self.bill_id,
            self.provider
        );
        if let Some(id) = &self.external_id {
            line.push_str(&format!(" {}", format!("({id})").dimmed()));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(": {}", error.red()));
        }
        if let Some(at) = self.next_attempt_at {
            line.push_str(&format!(" {}", format!("retry at {}", local_time(at)).dimmed()));
        }
        line
    }
}

impl Render for SyncOperation {
    fn render(&self) -> String {
        let error = self.last_error.as_deref().unwrap_or("unknown error");
        format!(
            "{} {} bill {} on {} after {} attempts: {}",
            "✗".red(),
            self.kind,
            self.bill_id,
            self.provider,
            self.retry_count,
            error.red()
        )
    }
}

impl Render for Conflict {
    fn render(&self) -> String {
        let detail = match (&self.kind, &self.remote) {
            (ConflictKind::RemoteMissing, _) => "event deleted in calendar".to_string(),
            (ConflictKind::RemoteModified, Some(remote)) => format!(
                "calendar has {} on {}, bill has {}",
                remote.title,
                remote.start.format("%Y-%m-%d"),
                self.local.start.format("%Y-%m-%d")
            ),
            (ConflictKind::RemoteModified, None) => "event edited in calendar".to_string(),
        };
        format!(
            "{} {} bill {} on {}: {}",
            "!".magenta(),
            self.id.dimmed(),
            self.bill_id,
            self.provider,
            detail
        )
    }
}

impl Render for ConnectionResult {
    fn render(&self) -> String {
        let account = self
            .account
            .as_deref()
            .map(|a| format!(" as {a}"))
            .unwrap_or_default();
        let timing = format!("({} ms)", self.response_time_ms);
        match self.status {
            ConnectionStatus::Connected => format!(
                "{} {}{}: {} {}",
                "✓".green(),
                self.provider,
                account,
                self.message,
                timing.dimmed()
            ),
            ConnectionStatus::Failed => format!(
                "{} {}{}: {} {}",
                "✗".red(),
                self.provider,
                account,
                self.message.red(),
                timing.dimmed()
            ),
        }
    }
}

impl Render for SyncStatus {
    fn render(&self) -> String {
        let mut lines = Vec::new();

        let last = self
            .last_full_sync
            .map(local_time)
            .unwrap_or_else(|| "never".to_string());
        lines.push(format!("Last full sync: {last}"));
        lines.push(format!("Pending:        {}", self.pending));

        if self.permanently_failed > 0 {
            lines.push(format!(
                "Failed:         {}",
                self.permanently_failed.to_string().red()
            ));
        }
        if !self.conflicts.is_empty() {
            lines.push(format!(
                "Conflicts:      {}",
                self.conflicts.len().to_string().magenta()
            ));
        }
        if self.consecutive_failures > 0 {
            lines.push(format!(
                "Consecutive failures: {}",
                self.consecutive_failures.to_string().yellow()
            ));
        }
        for provider in &self.disconnected_providers {
            lines.push(format!("{} {} is disconnected", "!".yellow(), provider));
        }

        let c = &self.counters;
        lines.push(
            format!(
                "{} succeeded, {} retried, {} failed, {} dropped, {} conflicts",
                c.succeeded, c.retried, c.failed, c.dropped, c.conflicts
            )
            .dimmed()
            .to_string(),
        );
        lines.join("\n")
    }
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

pub fn pluralize(word: &str, count: usize) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}
