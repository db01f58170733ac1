//! Priority-ordered, deduplicating queue of sync operations.
//!
//! The queue is an arena keyed by [`OperationId`] with a secondary index of
//! the single pending operation per (bill, provider) pair. Entries move through
//! `Pending -> InFlight -> (removed | Pending | Failed)`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bill::BillId;
use crate::operation::{OperationId, OperationKey, OperationKind, SyncOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
    /// Retries exhausted; waits for an explicit manual retry.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub op: SyncOperation,
    pub state: EntryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added(OperationId),
    /// The older pending operation was dropped in favour of the new one.
    Superseded { replaced: OperationId, by: OperationId },
    /// A pending create absorbed an update; the create now carries the newer snapshot.
    Merged(OperationId),
    /// A pending delete outranks the newer create/update, which was discarded.
    RejectedByPendingDelete(OperationId),
}

#[derive(Debug, Default)]
pub struct SyncQueue {
    entries: HashMap<OperationId, QueueEntry>,
    pending: HashMap<OperationKey, OperationId>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. Duplicate pending entries for one key
    /// (only possible from a hand-edited state file) keep the newest.
    pub fn from_entries(mut entries: Vec<QueueEntry>) -> Self {
        let mut queue = SyncQueue::new();
        entries.sort_by_key(|e| e.op.created_at);

        for entry in entries {
            let id = entry.op.id;
            if entry.state == EntryState::Pending
                && let Some(old) = queue.pending.insert(entry.op.key(), id)
            {
                queue.entries.remove(&old);
            }
            queue.entries.insert(id, entry);
        }
        queue
    }

    pub fn to_entries(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.op.created_at
                .cmp(&b.op.created_at)
                .then(a.op.id.cmp(&b.op.id))
        });
        entries
    }

    /// Add an operation, applying the supersession rule for its key.
    pub fn enqueue(&mut self, op: SyncOperation) -> EnqueueOutcome {
        let key = op.key();

        let outcome = match self.pending.get(&key).copied() {
            Some(existing_id) => {
                let Some(existing) = self.entries.get_mut(&existing_id) else {
                    self.pending.remove(&key);
                    return self.enqueue(op);
                };
                match (existing.op.kind, op.kind) {
                    (OperationKind::Delete, OperationKind::Create | OperationKind::Update) => {
                        return EnqueueOutcome::RejectedByPendingDelete(existing_id);
                    }
                    (OperationKind::Create, OperationKind::Update) => {
                        existing.op.snapshot = op.snapshot;
                        if op.external_id.is_some() {
                            existing.op.external_id = op.external_id;
                        }
                        EnqueueOutcome::Merged(existing_id)
                    }
                    _ => {
                        self.entries.remove(&existing_id);
                        let by = op.id;
                        self.insert_pending(op);
                        EnqueueOutcome::Superseded {
                            replaced: existing_id,
                            by,
                        }
                    }
                }
            }
            None => {
                let id = op.id;
                self.insert_pending(op);
                EnqueueOutcome::Added(id)
            }
        };

        // Fresh intent for the key replaces an operation parked as failed.
        self.entries
            .retain(|_, e| !(e.state == EntryState::Failed && e.op.key() == key));

        outcome
    }

    fn insert_pending(&mut self, op: SyncOperation) {
        self.pending.insert(op.key(), op.id);
        self.entries.insert(
            op.id,
            QueueEntry {
                op,
                state: EntryState::Pending,
            },
        );
    }

    /// Highest-priority, earliest-created ready operation, marked in flight.
    pub fn dequeue_next(&mut self) -> Option<SyncOperation> {
        self.dequeue_where(Some(Utc::now()), |_| true)
    }

    /// Like [`dequeue_next`](Self::dequeue_next) with a caller filter.
    /// `ready_at` of `None` ignores per-operation backoff.
    pub fn dequeue_where(
        &mut self,
        ready_at: Option<DateTime<Utc>>,
        filter: impl Fn(&SyncOperation) -> bool,
    ) -> Option<SyncOperation> {
        let id = self
            .pending
            .values()
            .filter_map(|id| self.entries.get(id))
            .map(|e| &e.op)
            .filter(|op| ready_at.is_none_or(|now| op.is_ready(now)))
            .filter(|op| filter(op))
            .min_by(|a, b| {
                a.kind
                    .priority()
                    .cmp(&b.kind.priority())
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|op| op.id)?;

        let entry = self.entries.get_mut(&id)?;
        self.pending.remove(&entry.op.key());
        entry.state = EntryState::InFlight;
        Some(entry.op.clone())
    }

    /// Remove a finished operation.
    pub fn complete(&mut self, id: OperationId) -> Option<SyncOperation> {
        let entry = self.entries.remove(&id)?;
        if self.pending.get(&entry.op.key()) == Some(&id) {
            self.pending.remove(&entry.op.key());
        }
        Some(entry.op)
    }

    /// Return an in-flight operation to the queue for a later attempt.
    ///
    /// Returns `false` (and drops the operation) if a newer operation for the
    /// same key was enqueued while this one was in flight.
    pub fn reschedule(&mut self, op: SyncOperation) -> bool {
        let key = op.key();
        if self.pending.contains_key(&key) {
            self.entries.remove(&op.id);
            return false;
        }
        self.pending.insert(key, op.id);
        self.entries.insert(
            op.id,
            QueueEntry {
                op,
                state: EntryState::Pending,
            },
        );
        true
    }

    /// Park an in-flight operation as permanently failed. A newer pending
    /// operation for the key makes the failure moot and the entry is dropped.
    pub fn park_failed(&mut self, op: SyncOperation) -> bool {
        if self.pending.contains_key(&op.key()) {
            self.entries.remove(&op.id);
            return false;
        }
        self.entries.insert(
            op.id,
            QueueEntry {
                op,
                state: EntryState::Failed,
            },
        );
        true
    }

    /// Re-enqueue permanently failed operations with a fresh retry budget.
    pub fn retry_failed(&mut self, bill_id: Option<BillId>) -> Vec<OperationId> {
        let ids: Vec<OperationId> = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::Failed)
            .filter(|e| bill_id.is_none_or(|b| e.op.bill_id == b))
            .map(|e| e.op.id)
            .collect();

        let mut requeued = Vec::new();
        for id in ids {
            let Some(mut entry) = self.entries.remove(&id) else {
                continue;
            };
            entry.op.retry_count = 0;
            entry.op.next_attempt_at = None;
            entry.op.last_error = None;
            if self.reschedule(entry.op) {
                requeued.push(id);
            }
        }
        requeued
    }

    /// Drop every entry for `provider`. Returns how many were removed.
    pub fn purge_provider(&mut self, provider: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.op.provider != provider);
        self.pending.retain(|k, _| k.provider != provider);
        before - self.entries.len()
    }

    /// After a restart nothing is actually in flight; put such entries back.
    pub fn recover_in_flight(&mut self) -> usize {
        let stranded: Vec<SyncOperation> = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::InFlight)
            .map(|e| e.op.clone())
            .collect();
        let count = stranded.len();
        for op in stranded {
            self.reschedule(op);
        }
        count
    }

    /// Pending plus in-flight operations.
    pub fn peek_depth(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state != EntryState::Failed)
            .count()
    }

    pub fn failed(&self) -> Vec<&SyncOperation> {
        let mut failed: Vec<&SyncOperation> = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::Failed)
            .map(|e| &e.op)
            .collect();
        failed.sort_by_key(|op| op.created_at);
        failed
    }

    pub fn pending(&self) -> impl Iterator<Item = &SyncOperation> {
        self.pending
            .values()
            .filter_map(|id| self.entries.get(id))
            .map(|e| &e.op)
    }

    pub fn pending_for(&self, key: &OperationKey) -> Option<&SyncOperation> {
        let id = self.pending.get(key)?;
        self.entries.get(id).map(|e| &e.op)
    }

    /// Whether any entry, in any state, exists for the key.
    pub fn tracks(&self, key: &OperationKey) -> bool {
        self.entries.values().any(|e| &e.op.key() == key)
    }

    pub fn has_pending(&self, filter: impl Fn(&SyncOperation) -> bool) -> bool {
        self.pending
            .values()
            .filter_map(|id| self.entries.get(id))
            .any(|e| filter(&e.op))
    }

    /// Earliest instant at which some pending operation becomes ready.
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.pending
            .values()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.op.next_attempt_at.unwrap_or(e.op.created_at))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn op(kind: OperationKind, bill_id: BillId, provider: &str) -> SyncOperation {
        SyncOperation::new(kind, bill_id, provider, None)
    }

    #[test]
    fn newer_operation_supersedes_pending_one() {
        let mut queue = SyncQueue::new();
        let first = op(OperationKind::Update, 1, "google");
        let second = op(OperationKind::Update, 1, "google");
        let (first_id, second_id) = (first.id, second.id);

        queue.enqueue(first);
        let outcome = queue.enqueue(second);

        assert_eq!(
            outcome,
            EnqueueOutcome::Superseded {
                replaced: first_id,
                by: second_id
            }
        );
        assert_eq!(queue.peek_depth(), 1);
        assert_eq!(queue.dequeue_next().unwrap().id, second_id);
    }

    #[test]
    fn pending_delete_is_not_superseded_by_update() {
        let mut queue = SyncQueue::new();
        let delete = op(OperationKind::Delete, 1, "google");
        let delete_id = delete.id;

        queue.enqueue(delete);
        let outcome = queue.enqueue(op(OperationKind::Update, 1, "google"));

        assert_eq!(outcome, EnqueueOutcome::RejectedByPendingDelete(delete_id));
        assert_eq!(queue.dequeue_next().unwrap().kind, OperationKind::Delete);
    }

    #[test]
    fn dispatched_delete_allows_later_create() {
        let mut queue = SyncQueue::new();
        queue.enqueue(op(OperationKind::Delete, 1, "google"));
        let delete = queue.dequeue_next().unwrap();

        let outcome = queue.enqueue(op(OperationKind::Create, 1, "google"));
        assert!(matches!(outcome, EnqueueOutcome::Added(_)));

        queue.complete(delete.id);
        assert_eq!(queue.dequeue_next().unwrap().kind, OperationKind::Create);
    }

    #[test]
    fn update_merges_into_pending_create() {
        let mut queue = SyncQueue::new();
        let create = op(OperationKind::Create, 1, "google");
        let create_id = create.id;
        queue.enqueue(create);

        let mut update = op(OperationKind::Update, 1, "google");
        update.external_id = Some("evt-1".into());
        assert_eq!(queue.enqueue(update), EnqueueOutcome::Merged(create_id));

        let next = queue.dequeue_next().unwrap();
        assert_eq!(next.kind, OperationKind::Create);
        assert_eq!(next.external_id.as_deref(), Some("evt-1"));
    }

    #[test]
    fn one_pending_operation_per_pair() {
        let mut queue = SyncQueue::new();
        for bill in 1..=3 {
            for provider in ["google", "outlook"] {
                queue.enqueue(op(OperationKind::Create, bill, provider));
                queue.enqueue(op(OperationKind::Update, bill, provider));
                queue.enqueue(op(OperationKind::Update, bill, provider));
            }
        }
        assert_eq!(queue.peek_depth(), 6);
    }

    #[test]
    fn dequeues_by_priority_then_age() {
        let mut queue = SyncQueue::new();
        let delete = op(OperationKind::Delete, 1, "google");
        let mut update_old = op(OperationKind::Update, 2, "google");
        update_old.created_at = Utc::now() - Duration::minutes(5);
        let update_new = op(OperationKind::Update, 3, "google");
        let create = op(OperationKind::Create, 4, "google");

        let expected = [create.id, update_old.id, update_new.id, delete.id];
        for o in [delete, update_new, create, update_old] {
            queue.enqueue(o);
        }

        let order: Vec<OperationId> = std::iter::from_fn(|| queue.dequeue_next())
            .map(|o| o.id)
            .collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn backoff_hides_operation_until_ready() {
        let mut queue = SyncQueue::new();
        let mut delayed = op(OperationKind::Update, 1, "google");
        delayed.next_attempt_at = Some(Utc::now() + Duration::seconds(60));
        queue.enqueue(delayed);

        assert!(queue.dequeue_next().is_none());
        assert!(queue.dequeue_where(None, |_| true).is_some());
    }

    #[test]
    fn reschedule_loses_to_newer_pending() {
        let mut queue = SyncQueue::new();
        queue.enqueue(op(OperationKind::Update, 1, "google"));
        let in_flight = queue.dequeue_next().unwrap();

        let newer = op(OperationKind::Update, 1, "google");
        let newer_id = newer.id;
        queue.enqueue(newer);

        assert!(!queue.reschedule(in_flight));
        assert_eq!(queue.peek_depth(), 1);
        assert_eq!(queue.dequeue_next().unwrap().id, newer_id);
    }

    #[test]
    fn failed_operations_wait_for_manual_retry() {
        let mut queue = SyncQueue::new();
        queue.enqueue(op(OperationKind::Create, 1, "google"));
        let mut in_flight = queue.dequeue_next().unwrap();
        in_flight.retry_count = 5;
        queue.park_failed(in_flight);

        assert!(queue.dequeue_next().is_none());
        assert_eq!(queue.failed().len(), 1);
        assert_eq!(queue.peek_depth(), 0);

        assert_eq!(queue.retry_failed(Some(2)).len(), 0);
        assert_eq!(queue.retry_failed(Some(1)).len(), 1);
        let retried = queue.dequeue_next().unwrap();
        assert_eq!(retried.retry_count, 0);
        assert!(queue.failed().is_empty());
    }

    #[test]
    fn new_intent_clears_failed_entry() {
        let mut queue = SyncQueue::new();
        queue.enqueue(op(OperationKind::Create, 1, "google"));
        let in_flight = queue.dequeue_next().unwrap();
        queue.park_failed(in_flight);

        queue.enqueue(op(OperationKind::Update, 1, "google"));
        assert!(queue.failed().is_empty());
    }

    #[test]
    fn purge_removes_only_that_provider() {
        let mut queue = SyncQueue::new();
        queue.enqueue(op(OperationKind::Create, 1, "google"));
        queue.enqueue(op(OperationKind::Create, 2, "google"));
        queue.enqueue(op(OperationKind::Create, 1, "outlook"));

        assert_eq!(queue.purge_provider("google"), 2);
        assert_eq!(queue.peek_depth(), 1);
        assert_eq!(queue.dequeue_next().unwrap().provider, "outlook");
    }

    #[test]
    fn restores_from_entries_and_recovers_in_flight() {
        let mut queue = SyncQueue::new();
        queue.enqueue(op(OperationKind::Create, 1, "google"));
        queue.enqueue(op(OperationKind::Update, 2, "google"));
        let in_flight = queue.dequeue_next().unwrap();

        let mut restored = SyncQueue::from_entries(queue.to_entries());
        assert_eq!(restored.recover_in_flight(), 1);
        assert_eq!(restored.peek_depth(), 2);
        assert_eq!(restored.dequeue_next().unwrap().id, in_flight.id);
    }
}
