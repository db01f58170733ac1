//! Queue draining and per-operation dispatch.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::SyncCoordinator;
use crate::adapter::{ProviderAdapter, bounded};
use crate::bill::{BillId, BillSnapshot};
use crate::conflict::{
    Conflict, Divergence, RemoteEdit, Resolution, SyncMarker, detect, detection_window, resolve,
};
use crate::credentials::Credential;
use crate::error::{ErrorKind, ProviderError, ValidationError};
use crate::event::CalendarEvent;
use crate::operation::{OperationId, OperationKey, OperationKind, SyncOperation};
use crate::retry::RetryDecision;
use crate::status::{Outcome, SyncResult};
use crate::template::generate_event;

/// Which operations a drain may pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainScope {
    pub bill: Option<BillId>,
    /// Skip operations whose backoff has not elapsed. Manual syncs ignore it.
    pub honor_backoff: bool,
}

impl DrainScope {
    pub fn background() -> Self {
        DrainScope {
            bill: None,
            honor_backoff: true,
        }
    }

    pub fn manual(bill: Option<BillId>) -> Self {
        DrainScope {
            bill,
            honor_backoff: false,
        }
    }
}

/// What a successful dispatch did on the remote side.
enum Applied {
    Written {
        external_id: String,
        remote_updated: Option<DateTime<Utc>>,
        event_start: DateTime<Utc>,
        bill_modified: DateTime<Utc>,
    },
    Deleted,
    /// The remote edit is already in the bill.
    AcceptedRemote {
        edit: RemoteEdit,
        remote_updated: Option<DateTime<Utc>>,
        bill_modified: Option<DateTime<Utc>>,
    },
    AcceptedRemoteDeletion {
        bill_modified: DateTime<Utc>,
    },
    Parked(Box<Conflict>),
}

impl SyncCoordinator {
    /// Drain every enabled provider concurrently, one operation at a time
    /// per provider.
    pub(super) async fn drain(
        &self,
        scope: DrainScope,
        cancel: &CancellationToken,
    ) -> Vec<SyncResult> {
        let enabled: Vec<String> = {
            let settings = self.inner.settings.read();
            self.inner
                .adapters
                .names()
                .filter(|name| settings.is_provider_enabled(name))
                .map(String::from)
                .collect()
        };

        join_all(
            enabled
                .iter()
                .map(|provider| self.drain_provider(provider, scope, cancel)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn drain_provider(
        &self,
        provider: &str,
        scope: DrainScope,
        cancel: &CancellationToken,
    ) -> Vec<SyncResult> {
        let lane = self.inner.lane(provider);
        let _lane = lane.lock().await;

        // Each operation is attempted at most once per drain.
        let mut attempted = HashSet::new();
        let mut results = Vec::new();
        while !cancel.is_cancelled() {
            let Some(op) = self.next_operation(provider, scope, &attempted) else {
                break;
            };
            attempted.insert(op.id);
            self.inner.persist_logged();
            results.push(self.dispatch(op).await);
        }
        if cancel.is_cancelled() {
            tracing::info!(provider, completed = results.len(), "Drain cancelled");
        }
        results
    }

    fn next_operation(
        &self,
        provider: &str,
        scope: DrainScope,
        attempted: &HashSet<OperationId>,
    ) -> Option<SyncOperation> {
        if !self.inner.settings.read().is_provider_enabled(provider) {
            return None;
        }
        let now = Utc::now();
        let mut st = self.inner.state.lock();
        if st.disconnected.contains(provider) {
            return None;
        }
        if st
            .rate_limited_until
            .get(provider)
            .is_some_and(|until| *until > now)
        {
            return None;
        }
        st.queue
            .dequeue_where(scope.honor_backoff.then_some(now), |op| {
                op.provider == provider
                    && scope.bill.is_none_or(|bill| op.bill_id == bill)
                    && !attempted.contains(&op.id)
            })
    }

    async fn dispatch(&self, op: SyncOperation) -> SyncResult {
        tracing::debug!(
            operation_id = %op.id,
            bill_id = op.bill_id,
            provider = %op.provider,
            operation = %op.kind,
            retry_count = op.retry_count,
            "Dispatching sync operation"
        );
        let result = match self.apply(&op).await {
            Ok(applied) => self.settle_success(op, applied),
            Err(error) => self.settle_failure(op, error),
        };
        self.inner.persist_logged();
        self.inner.status.record(&result);
        result
    }

    /// Marker and external id to act on for `op`.
    fn lookup_marker(
        &self,
        key: &OperationKey,
        op: &SyncOperation,
    ) -> (Option<SyncMarker>, Option<String>) {
        let st = self.inner.state.lock();
        match st.markers.get(key) {
            Some(marker) if marker.detached => (None, None),
            Some(marker) => (Some(marker.clone()), Some(marker.external_id.clone())),
            None => {
                let from_snapshot = op
                    .snapshot
                    .as_ref()
                    .and_then(|b| b.external_id(&op.provider))
                    .map(String::from);
                (None, op.external_id.clone().or(from_snapshot))
            }
        }
    }

    async fn apply(&self, op: &SyncOperation) -> Result<Applied, ProviderError> {
        let adapter = self.inner.adapters.get(&op.provider).ok_or_else(|| {
            ProviderError::Validation(ValidationError::new(
                "provider",
                format!("no adapter registered for {}", op.provider),
            ))
        })?;
        let (marker, known_id) = self.lookup_marker(&op.key(), op);

        if op.kind == OperationKind::Delete {
            return self.apply_delete(adapter.as_ref(), known_id).await;
        }

        let snapshot = match &op.snapshot {
            Some(snapshot) => snapshot.clone(),
            None => match self.inner.bills.load_bill_snapshot(op.bill_id) {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => return self.apply_delete(adapter.as_ref(), known_id).await,
                Err(e) => return Err(ProviderError::Transient(format!("bill store: {e}"))),
            },
        };

        let (template, strategy) = {
            let settings = self.inner.settings.read();
            (settings.template.clone(), settings.conflict_strategy)
        };
        let event = generate_event(&snapshot, &template).with_external_id(known_id.clone());
        event.validate()?;

        let credential = self.inner.sessions.load_valid(adapter.as_ref()).await?;
        let Some(external_id) = known_id else {
            return self.create(adapter.as_ref(), &credential, &event, &snapshot).await;
        };

        if let Some(marker) = &marker {
            let window = detection_window(marker, &event, self.inner.config.conflict_window_days);
            let remote = self
                .call(adapter.list_events(&credential, &window))
                .await?;
            let divergence = detect(marker, &remote);
            if divergence != Divergence::None {
                tracing::warn!(
                    bill_id = op.bill_id,
                    provider = %op.provider,
                    external_id = %external_id,
                    divergence = divergence_label(&divergence),
                    strategy = ?strategy,
                    "Remote event diverged since last sync"
                );
            }
            match resolve(strategy, &divergence) {
                Resolution::Proceed | Resolution::Overwrite => {}
                resolution => {
                    return self
                        .settle_divergence(
                            resolution,
                            &divergence,
                            op,
                            adapter.as_ref(),
                            &credential,
                            event,
                            &snapshot,
                        )
                        .await;
                }
            }
        }

        match self
            .call(adapter.update_event(&credential, &external_id, &event))
            .await
        {
            Ok(written) => Ok(Applied::Written {
                external_id: written.external_id,
                remote_updated: written.updated,
                event_start: event.start,
                bill_modified: snapshot.last_modified,
            }),
            Err(ProviderError::NotFound(_)) if marker.is_some() => {
                let divergence = Divergence::RemoteMissing;
                let resolution = resolve(strategy, &divergence);
                self.settle_divergence(
                    resolution,
                    &divergence,
                    op,
                    adapter.as_ref(),
                    &credential,
                    event,
                    &snapshot,
                )
                .await
            }
            // Stale id from the bill record with nothing to compare against.
            Err(ProviderError::NotFound(_)) => {
                self.create(adapter.as_ref(), &credential, &event, &snapshot).await
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_divergence(
        &self,
        resolution: Resolution,
        divergence: &Divergence,
        op: &SyncOperation,
        adapter: &dyn ProviderAdapter,
        credential: &Credential,
        event: CalendarEvent,
        snapshot: &BillSnapshot,
    ) -> Result<Applied, ProviderError> {
        match resolution {
            Resolution::Recreate => {
                let fresh = event.with_external_id(None);
                self.create(adapter, credential, &fresh, snapshot).await
            }
            Resolution::AcceptRemote(edit) => {
                let remote_updated = match divergence {
                    Divergence::RemoteModified(remote) => remote.updated,
                    _ => None,
                };
                // Until the bill holds the edit the local operation stays
                // queued and the marker keeps the old remote baseline.
                self.inner
                    .bills
                    .apply_remote_edit(op.bill_id, &edit)
                    .map_err(|e| {
                        ProviderError::Transient(format!("remote edit not applied to bill: {e}"))
                    })?;
                let bill_modified = self
                    .inner
                    .bills
                    .load_bill_snapshot(op.bill_id)
                    .map_err(|e| {
                        ProviderError::Transient(format!("bill reload after remote edit: {e}"))
                    })?
                    .map(|b| b.last_modified);
                Ok(Applied::AcceptedRemote {
                    edit,
                    remote_updated,
                    bill_modified,
                })
            }
            Resolution::AcceptRemoteDeletion => Ok(Applied::AcceptedRemoteDeletion {
                bill_modified: snapshot.last_modified,
            }),
            Resolution::Park => match Conflict::new(op.clone(), event, divergence) {
                Some(conflict) => Ok(Applied::Parked(Box::new(conflict))),
                None => Err(ProviderError::Conflict(format!(
                    "bill {} has no divergence to park",
                    op.bill_id
                ))),
            },
            Resolution::Proceed | Resolution::Overwrite => Err(ProviderError::Conflict(format!(
                "bill {} cannot overwrite a missing event",
                op.bill_id
            ))),
        }
    }

    async fn create(
        &self,
        adapter: &dyn ProviderAdapter,
        credential: &Credential,
        event: &CalendarEvent,
        snapshot: &BillSnapshot,
    ) -> Result<Applied, ProviderError> {
        let written = self.call(adapter.create_event(credential, event)).await?;
        Ok(Applied::Written {
            external_id: written.external_id,
            remote_updated: written.updated,
            event_start: event.start,
            bill_modified: snapshot.last_modified,
        })
    }

    async fn apply_delete(
        &self,
        adapter: &dyn ProviderAdapter,
        known_id: Option<String>,
    ) -> Result<Applied, ProviderError> {
        let Some(external_id) = known_id else {
            return Ok(Applied::Deleted);
        };
        let credential = self.inner.sessions.load_valid(adapter).await?;
        match self
            .call(adapter.delete_event(&credential, &external_id))
            .await
        {
            Ok(()) | Err(ProviderError::NotFound(_)) => Ok(Applied::Deleted),
            Err(e) => Err(e),
        }
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        bounded(self.inner.config.provider_timeout, fut).await
    }

    fn settle_success(&self, op: SyncOperation, applied: Applied) -> SyncResult {
        let key = op.key();
        let now = Utc::now();

        match applied {
            Applied::Written {
                external_id,
                remote_updated,
                event_start,
                bill_modified,
            } => {
                {
                    let mut st = self.inner.state.lock();
                    st.queue.complete(op.id);
                    st.conflicts.remove_key(&key);
                    st.rejected.remove(&key);
                    st.markers.insert(
                        key,
                        SyncMarker {
                            bill_id: op.bill_id,
                            provider: op.provider.clone(),
                            external_id: external_id.clone(),
                            bill_modified,
                            synced_at: now,
                            remote_updated,
                            event_start,
                            detached: false,
                        },
                    );
                }
                let warning = self
                    .inner
                    .record_external_id(op.bill_id, &op.provider, Some(&external_id));
                make_result(&op, Outcome::Succeeded, warning, Some(external_id))
            }
            Applied::Deleted => {
                {
                    let mut st = self.inner.state.lock();
                    st.queue.complete(op.id);
                    st.conflicts.remove_key(&key);
                    st.rejected.remove(&key);
                    st.markers.remove(&key);
                }
                let warning = self.inner.record_external_id(op.bill_id, &op.provider, None);
                make_result(&op, Outcome::Succeeded, warning, None)
            }
            Applied::AcceptedRemote {
                edit,
                remote_updated,
                bill_modified,
            } => {
                let mut st = self.inner.state.lock();
                st.queue.complete(op.id);
                let external_id = st.markers.get_mut(&key).map(|marker| {
                    marker.remote_updated = remote_updated.max(marker.remote_updated);
                    marker.synced_at = now;
                    marker.event_start = edit.start;
                    if let Some(modified) = bill_modified {
                        marker.bill_modified = modified;
                    }
                    marker.external_id.clone()
                });
                make_result(&op, Outcome::Discarded, None, external_id)
            }
            Applied::AcceptedRemoteDeletion { bill_modified } => {
                {
                    let mut st = self.inner.state.lock();
                    st.queue.complete(op.id);
                    if let Some(marker) = st.markers.get_mut(&key) {
                        marker.detached = true;
                        marker.synced_at = now;
                        marker.bill_modified = marker.bill_modified.max(bill_modified);
                    }
                }
                let warning = self.inner.record_external_id(op.bill_id, &op.provider, None);
                make_result(&op, Outcome::Discarded, warning, None)
            }
            Applied::Parked(conflict) => {
                let conflict_id = conflict.id;
                {
                    let mut st = self.inner.state.lock();
                    st.queue.complete(op.id);
                    st.conflicts.park(*conflict);
                }
                let mut result = make_result(
                    &op,
                    Outcome::Conflict,
                    Some(format!("parked as conflict {conflict_id}")),
                    None,
                );
                result.error_kind = Some(ErrorKind::Conflict);
                result
            }
        }
    }

    fn settle_failure(&self, mut op: SyncOperation, error: ProviderError) -> SyncResult {
        let now = Utc::now();
        let message = error.to_string();
        let decision = self.inner.config.retry.decide(op.retry_count, &error, now);
        op.last_error = Some(message.clone());

        let mut st = self.inner.state.lock();
        let (outcome, kind) = match decision {
            RetryDecision::RetryAt {
                at,
                delay,
                rate_limited,
            } => {
                op.retry_count += 1;
                op.next_attempt_at = Some(at);
                if rate_limited {
                    tracing::warn!(
                        provider = %op.provider,
                        delay_secs = delay.as_secs(),
                        "Provider rate limited"
                    );
                    st.rate_limited_until.insert(op.provider.clone(), at);
                }
                if !st.queue.reschedule(op.clone()) {
                    tracing::debug!(
                        operation_id = %op.id,
                        "Failed operation superseded while in flight"
                    );
                }
                (Outcome::Retrying, error.kind())
            }
            RetryDecision::GiveUp => {
                op.retry_count += 1;
                st.queue.park_failed(op.clone());
                (Outcome::Failed, ErrorKind::PermanentFailure)
            }
            RetryDecision::Reject => {
                st.queue.park_failed(op.clone());
                if st.disconnected.insert(op.provider.clone()) {
                    tracing::warn!(
                        provider = %op.provider,
                        error = %message,
                        "Credential rejected, provider marked disconnected"
                    );
                }
                (Outcome::Failed, ErrorKind::AuthError)
            }
            RetryDecision::Drop => {
                st.queue.complete(op.id);
                let bill_modified = op.snapshot.as_ref().map_or(now, |b| b.last_modified);
                st.rejected.insert(op.key(), bill_modified);
                (Outcome::Dropped, ErrorKind::ValidationError)
            }
        };
        drop(st);

        let mut result = make_result(&op, outcome, Some(message), op.external_id.clone());
        result.error_kind = Some(kind);
        result
    }
}

fn divergence_label(divergence: &Divergence) -> &'static str {
    match divergence {
        Divergence::None => "none",
        Divergence::RemoteMissing => "remote_missing",
        Divergence::RemoteModified(_) => "remote_modified",
    }
}

fn make_result(
    op: &SyncOperation,
    outcome: Outcome,
    error: Option<String>,
    external_id: Option<String>,
) -> SyncResult {
    SyncResult {
        operation_id: op.id,
        bill_id: op.bill_id,
        provider: op.provider.clone(),
        kind: op.kind,
        outcome,
        error,
        error_kind: None,
        external_id,
        next_attempt_at: op.next_attempt_at,
        retry_count: op.retry_count,
        timestamp: Utc::now(),
    }
}
