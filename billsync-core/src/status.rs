//! Sync status monitor: per-operation results, bounded history, counters.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bill::BillId;
use crate::conflict::Conflict;
use crate::error::ErrorKind;
use crate::operation::{OperationId, OperationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Failed transiently; requeued with backoff.
    Retrying,
    /// Retries exhausted, or rejected credentials. Needs a manual retry.
    Failed,
    /// Invalid payload; the operation was discarded.
    Dropped,
    /// Parked for manual conflict resolution.
    Conflict,
    /// Discarded in favour of the remote state.
    Discarded,
}

/// Result of one dispatched operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub operation_id: OperationId,
    pub bill_id: BillId,
    pub provider: String,
    pub kind: OperationKind,
    pub outcome: Outcome,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub external_id: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub dropped: u64,
    pub conflicts: u64,
}

/// Aggregate snapshot for external inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_result: Option<SyncResult>,
    pub consecutive_failures: u32,
    pub pending: usize,
    pub permanently_failed: usize,
    pub conflicts: Vec<Conflict>,
    pub disconnected_providers: BTreeSet<String>,
    pub counters: Counters,
    /// Most recent results, newest last.
    pub recent: Vec<SyncResult>,
}

#[derive(Debug)]
struct MonitorState {
    history: VecDeque<SyncResult>,
    counters: Counters,
    consecutive_failures: u32,
    last_full_sync: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct StatusMonitor {
    capacity: usize,
    state: RwLock<MonitorState>,
}

impl StatusMonitor {
    pub fn new(capacity: usize, last_full_sync: Option<DateTime<Utc>>) -> Self {
        StatusMonitor {
            capacity: capacity.max(1),
            state: RwLock::new(MonitorState {
                history: VecDeque::with_capacity(capacity.max(1)),
                counters: Counters::default(),
                consecutive_failures: 0,
                last_full_sync,
            }),
        }
    }

    pub fn record(&self, result: &SyncResult) {
        match result.outcome {
            Outcome::Succeeded | Outcome::Discarded => tracing::info!(
                operation_id = %result.operation_id,
                bill_id = result.bill_id,
                provider = %result.provider,
                operation = %result.kind,
                outcome = ?result.outcome,
                external_id = result.external_id.as_deref(),
                "sync_operation_succeeded"
            ),
            Outcome::Retrying => tracing::warn!(
                operation_id = %result.operation_id,
                bill_id = result.bill_id,
                provider = %result.provider,
                operation = %result.kind,
                retry_count = result.retry_count,
                next_attempt_at = ?result.next_attempt_at,
                error = result.error.as_deref(),
                "sync_operation_retrying"
            ),
            Outcome::Conflict => tracing::warn!(
                operation_id = %result.operation_id,
                bill_id = result.bill_id,
                provider = %result.provider,
                operation = %result.kind,
                "sync_operation_conflict"
            ),
            Outcome::Failed | Outcome::Dropped => tracing::error!(
                operation_id = %result.operation_id,
                bill_id = result.bill_id,
                provider = %result.provider,
                operation = %result.kind,
                error_kind = ?result.error_kind,
                error = result.error.as_deref(),
                outcome = ?result.outcome,
                "sync_operation_failed"
            ),
        }

        let mut state = self.state.write();
        match result.outcome {
            Outcome::Succeeded | Outcome::Discarded => {
                state.counters.succeeded += 1;
                state.consecutive_failures = 0;
            }
            Outcome::Retrying => {
                state.counters.retried += 1;
                state.consecutive_failures += 1;
            }
            Outcome::Failed => {
                state.counters.failed += 1;
                state.consecutive_failures += 1;
            }
            Outcome::Dropped => {
                state.counters.dropped += 1;
                state.consecutive_failures += 1;
            }
            Outcome::Conflict => state.counters.conflicts += 1,
        }
        if state.history.len() == self.capacity {
            state.history.pop_front();
        }
        state.history.push_back(result.clone());
    }

    pub fn mark_full_sync(&self, at: DateTime<Utc>) {
        self.state.write().last_full_sync = Some(at);
        tracing::info!(at = %at, "full_sync_completed");
    }

    pub fn last_full_sync(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_full_sync
    }

    /// Combine monitor data with queue-derived figures into a status snapshot.
    pub fn snapshot(
        &self,
        pending: usize,
        permanently_failed: usize,
        conflicts: Vec<Conflict>,
        disconnected_providers: BTreeSet<String>,
    ) -> SyncStatus {
        let state = self.state.read();
        SyncStatus {
            last_full_sync: state.last_full_sync,
            last_result: state.history.back().cloned(),
            consecutive_failures: state.consecutive_failures,
            pending,
            permanently_failed,
            conflicts,
            disconnected_providers,
            counters: state.counters,
            recent: state.history.iter().cloned().collect(),
        }
    }
}
