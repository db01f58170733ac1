//! Sync coordinator: the single owner and consumer of the sync queue.
//!
//! `notify_bill_changed` only validates and enqueues. Draining happens on the
//! background worker (see [`SyncCoordinator::spawn_worker`]) or through the
//! manual `sync_*` calls, which share the same per-provider lanes so an
//! operation is never dispatched twice concurrently.

mod dispatch;
mod recovery;
mod worker;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::adapter::{
    AdapterRegistry, ConnectionResult, ConnectionStatus, ProviderAdapter, bounded,
};
use crate::bill::{BillId, BillSnapshot, ChangeKind};
use crate::config::EngineConfig;
use crate::conflict::{
    Conflict, ConflictChoice, ConflictId, ConflictKind, ConflictList, RemoteEdit, SyncMarker,
};
use crate::credentials::{Credential, CredentialStore};
use crate::error::{EngineError, EngineResult};
use crate::hooks::BillStore;
use crate::operation::{OperationKey, OperationKind, Rejection, SyncOperation};
use crate::queue::{EnqueueOutcome, SyncQueue};
use crate::session::SessionManager;
use crate::settings::SyncSettings;
use crate::status::{StatusMonitor, SyncResult, SyncStatus};
use crate::store::{PersistedState, StateStore};

pub use dispatch::DrainScope;

/// Handle to the engine. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("user", &self.inner.config.user_id)
            .field("adapters", &self.inner.adapters)
            .finish()
    }
}

struct Inner {
    config: EngineConfig,
    settings: RwLock<SyncSettings>,
    state: Mutex<EngineState>,
    persist_lock: Mutex<()>,
    store: StateStore,
    adapters: AdapterRegistry,
    sessions: SessionManager,
    bills: Arc<dyn BillStore>,
    status: StatusMonitor,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    wake: Notify,
}

#[derive(Debug, Default)]
struct EngineState {
    queue: SyncQueue,
    conflicts: ConflictList,
    markers: HashMap<OperationKey, SyncMarker>,
    /// Bill `last_modified` of the payload last rejected as invalid.
    rejected: HashMap<OperationKey, DateTime<Utc>>,
    /// Provider-wide gate set by rate-limit responses.
    rate_limited_until: HashMap<String, DateTime<Utc>>,
    disconnected: BTreeSet<String>,
}

impl EngineState {
    fn from_persisted(persisted: PersistedState) -> Self {
        EngineState {
            queue: SyncQueue::from_entries(persisted.queue),
            conflicts: persisted.conflicts,
            markers: persisted
                .markers
                .into_iter()
                .map(|m| (m.key(), m))
                .collect(),
            rejected: persisted
                .rejected
                .into_iter()
                .map(|r| (r.key(), r.bill_modified))
                .collect(),
            rate_limited_until: HashMap::new(),
            disconnected: persisted.disconnected,
        }
    }

    fn to_persisted(&self, last_full_sync: Option<DateTime<Utc>>) -> PersistedState {
        let mut markers: Vec<SyncMarker> = self.markers.values().cloned().collect();
        markers.sort_by(|a, b| a.key().cmp(&b.key()));
        let mut rejected: Vec<Rejection> = self
            .rejected
            .iter()
            .map(|(key, at)| Rejection {
                bill_id: key.bill_id,
                provider: key.provider.clone(),
                bill_modified: *at,
            })
            .collect();
        rejected.sort_by(|a, b| a.key().cmp(&b.key()));
        PersistedState {
            version: 0,
            queue: self.queue.to_entries(),
            conflicts: self.conflicts.clone(),
            markers,
            rejected,
            disconnected: self.disconnected.clone(),
            last_full_sync,
        }
    }

    /// The bill has not changed since its last payload for `key` was rejected.
    fn still_rejected(&self, key: &OperationKey, bill: &BillSnapshot) -> bool {
        self.rejected
            .get(key)
            .is_some_and(|rejected_at| bill.last_modified <= *rejected_at)
    }

    /// External id to act on: the marker is authoritative when present.
    fn known_external_id(&self, key: &OperationKey, bill: Option<&BillSnapshot>) -> Option<String> {
        match self.markers.get(key) {
            Some(marker) if marker.detached => None,
            Some(marker) => Some(marker.external_id.clone()),
            None => bill
                .and_then(|b| b.external_id(&key.provider))
                .map(String::from),
        }
    }
}

impl Inner {
    fn persist(&self) -> EngineResult<()> {
        let _ordered = self.persist_lock.lock();
        let snapshot = self
            .state
            .lock()
            .to_persisted(self.status.last_full_sync());
        self.store.save(&snapshot)
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            tracing::error!(error = %e, "Failed to persist sync state");
        }
    }

    fn lane(&self, provider: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lanes
            .lock()
            .entry(provider.to_string())
            .or_default()
            .clone()
    }

    fn adapter(&self, name: &str) -> EngineResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(name)
            .ok_or_else(|| EngineError::UnknownProvider(name.to_string()))
    }

    fn check_providers(&self, settings: &SyncSettings) -> EngineResult<()> {
        match settings
            .enabled_providers
            .iter()
            .find(|p| self.adapters.get(p).is_none())
        {
            Some(unknown) => Err(EngineError::UnknownProvider(unknown.clone())),
            None => Ok(()),
        }
    }

    /// Write the external id back to the bill. The marker stays
    /// authoritative, so a failure is logged and returned as a message.
    fn record_external_id(
        &self,
        bill_id: BillId,
        provider: &str,
        external_id: Option<&str>,
    ) -> Option<String> {
        let e = self
            .bills
            .record_external_event_id(bill_id, provider, external_id)
            .err()?;
        tracing::warn!(bill_id, provider, error = %e, "Failed to write back external event id");
        Some(format!("external id not written back to bill: {e}"))
    }
}

impl SyncCoordinator {
    /// Build the engine, restore persisted state and re-derive lost work.
    pub fn open(
        config: EngineConfig,
        settings: SyncSettings,
        adapters: AdapterRegistry,
        credentials: Arc<dyn CredentialStore>,
        bills: Arc<dyn BillStore>,
    ) -> EngineResult<Self> {
        settings.validate()?;

        let store = StateStore::new(config.state_path());
        let persisted = store.load()?;
        let last_full_sync = persisted.last_full_sync;
        let mut state = EngineState::from_persisted(persisted);
        let stranded = state.queue.recover_in_flight();
        if stranded > 0 {
            tracing::info!(count = stranded, "Requeued operations interrupted by shutdown");
        }

        let inner = Inner {
            sessions: SessionManager::new(
                config.user_id.clone(),
                credentials,
                config.provider_timeout,
            ),
            status: StatusMonitor::new(config.history_capacity, last_full_sync),
            settings: RwLock::new(settings),
            state: Mutex::new(state),
            persist_lock: Mutex::new(()),
            store,
            adapters,
            bills,
            lanes: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            config,
        };
        inner.check_providers(&inner.settings.read())?;

        let coordinator = SyncCoordinator {
            inner: Arc::new(inner),
        };
        let derived = coordinator.reconcile()?;
        tracing::info!(
            user = %coordinator.inner.config.user_id,
            pending = coordinator.inner.state.lock().queue.peek_depth(),
            derived,
            "Sync engine ready"
        );
        Ok(coordinator)
    }

    /// Record a bill lifecycle change. Validates and enqueues only; never
    /// touches the network.
    pub fn notify_bill_changed(&self, bill: &BillSnapshot, change: ChangeKind) -> EngineResult<()> {
        bill.validate()?;

        let settings = self.inner.settings.read().clone();
        let today = Utc::now().date_naive();
        let wants_event = change != ChangeKind::Deleted && settings.wants_event(bill, today);

        {
            let mut st = self.inner.state.lock();
            for provider in &settings.enabled_providers {
                if st.disconnected.contains(provider) {
                    tracing::debug!(
                        bill_id = bill.id,
                        provider = %provider,
                        "Skipping disconnected provider"
                    );
                    continue;
                }
                let key = OperationKey::new(bill.id, provider.clone());
                let external_id = st.known_external_id(&key, Some(bill));
                let pending_write = st
                    .queue
                    .pending_for(&key)
                    .is_some_and(|op| op.kind != OperationKind::Delete);

                let kind = if wants_event {
                    if external_id.is_some() || pending_write {
                        OperationKind::Update
                    } else {
                        OperationKind::Create
                    }
                } else if external_id.is_some() || pending_write {
                    OperationKind::Delete
                } else {
                    continue;
                };
                if kind != OperationKind::Delete && st.still_rejected(&key, bill) {
                    tracing::debug!(
                        bill_id = bill.id,
                        provider = %provider,
                        "Bill unchanged since its payload was rejected"
                    );
                    continue;
                }
                st.rejected.remove(&key);

                let op = SyncOperation::new(kind, bill.id, provider.clone(), Some(bill.clone()))
                    .with_external_id(external_id);
                let outcome = st.queue.enqueue(op);
                match outcome {
                    EnqueueOutcome::RejectedByPendingDelete(pending) => tracing::info!(
                        bill_id = bill.id,
                        provider = %provider,
                        pending_delete = %pending,
                        "Pending delete outranks newer change"
                    ),
                    _ => tracing::debug!(
                        bill_id = bill.id,
                        provider = %provider,
                        operation = %kind,
                        change = %change,
                        outcome = ?outcome,
                        "Enqueued sync operation"
                    ),
                }
            }
        }

        self.inner.persist()?;
        if settings.sync_on_bill_change {
            self.wake();
        }
        Ok(())
    }

    /// Drain queued operations for one bill, ignoring per-operation backoff.
    pub async fn sync_bill(&self, bill_id: BillId) -> Vec<SyncResult> {
        self.sync_bill_with(bill_id, &CancellationToken::new()).await
    }

    pub async fn sync_bill_with(
        &self,
        bill_id: BillId,
        cancel: &CancellationToken,
    ) -> Vec<SyncResult> {
        self.drain(DrainScope::manual(Some(bill_id)), cancel).await
    }

    /// Drain the whole queue once, ignoring per-operation backoff.
    /// Provider failures are reported in the results, never as an abort.
    pub async fn sync_all(&self) -> Vec<SyncResult> {
        self.sync_all_with(&CancellationToken::new()).await
    }

    /// Like [`sync_all`](Self::sync_all); stops pulling new operations once
    /// `cancel` fires and returns what has completed.
    pub async fn sync_all_with(&self, cancel: &CancellationToken) -> Vec<SyncResult> {
        let results = self.drain(DrainScope::manual(None), cancel).await;
        if !cancel.is_cancelled() {
            self.inner.status.mark_full_sync(Utc::now());
            self.inner.persist_logged();
        }
        results
    }

    pub fn get_status(&self) -> SyncStatus {
        let st = self.inner.state.lock();
        self.inner.status.snapshot(
            st.queue.peek_depth(),
            st.queue.failed().len(),
            st.conflicts.iter().cloned().collect(),
            st.disconnected.clone(),
        )
    }

    pub fn settings(&self) -> SyncSettings {
        self.inner.settings.read().clone()
    }

    /// Replace the settings and reconcile the queue against them.
    pub fn update_settings(&self, settings: SyncSettings) -> EngineResult<()> {
        settings.validate()?;
        self.inner.check_providers(&settings)?;
        *self.inner.settings.write() = settings;
        tracing::info!("Sync settings updated");
        self.reconcile()?;
        self.wake();
        Ok(())
    }

    /// Store a credential, verify it and resume syncing for the provider.
    pub async fn connect_provider(
        &self,
        name: &str,
        credential: Credential,
    ) -> EngineResult<ConnectionResult> {
        let adapter = self.inner.adapter(name)?;
        let result = self
            .inner
            .sessions
            .connect(adapter.as_ref(), credential)
            .await?;

        if result.status == ConnectionStatus::Connected {
            self.inner.state.lock().disconnected.remove(name);
            tracing::info!(
                provider = name,
                account = result.account.as_deref(),
                "Provider connected"
            );
            self.reconcile()?;
            self.wake();
        }
        Ok(result)
    }

    pub async fn test_connection(&self, name: &str) -> EngineResult<ConnectionResult> {
        let adapter = self.inner.adapter(name)?;
        self.inner.sessions.test_connection(adapter.as_ref()).await
    }

    /// Revoke the provider's credential and purge its queued work.
    ///
    /// With `delete_remote_on_disconnect`, events this engine created are
    /// deleted first (best-effort). Returns the number of purged operations.
    pub async fn disconnect_provider(&self, name: &str) -> EngineResult<usize> {
        let adapter = self.inner.adapter(name)?;
        let lane = self.inner.lane(name);
        let _lane = lane.lock().await;

        let (purged, markers) = {
            let mut st = self.inner.state.lock();
            let purged = st.queue.purge_provider(name);
            st.conflicts.purge_provider(name);
            st.rate_limited_until.remove(name);
            st.rejected.retain(|key, _| key.provider != name);
            let keys: Vec<OperationKey> = st
                .markers
                .keys()
                .filter(|k| k.provider == name)
                .cloned()
                .collect();
            let markers: Vec<SyncMarker> = keys
                .iter()
                .filter_map(|k| st.markers.remove(k))
                .collect();
            st.disconnected.insert(name.to_string());
            (purged, markers)
        };
        self.inner.persist()?;

        let delete_remote = self.inner.settings.read().delete_remote_on_disconnect;
        if delete_remote {
            self.delete_remote_events(adapter.as_ref(), &markers).await;
        }
        for marker in &markers {
            self.inner.record_external_id(marker.bill_id, name, None);
        }

        let revoked = self.inner.sessions.revoke(adapter.as_ref()).await?;
        tracing::info!(provider = name, purged, revoked, "Provider disconnected");
        Ok(purged)
    }

    async fn delete_remote_events(&self, adapter: &dyn ProviderAdapter, markers: &[SyncMarker]) {
        let credential = match self.inner.sessions.load_valid(adapter).await {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(
                    provider = adapter.name(),
                    error = %e,
                    "Cannot delete remote events without a valid credential"
                );
                return;
            }
        };
        let timeout = self.inner.config.provider_timeout;
        for marker in markers.iter().filter(|m| !m.detached) {
            let deleted = bounded(timeout, adapter.delete_event(&credential, &marker.external_id));
            if let Err(e) = deleted.await {
                tracing::warn!(
                    provider = adapter.name(),
                    bill_id = marker.bill_id,
                    external_id = %marker.external_id,
                    error = %e,
                    "Failed to delete remote event on disconnect"
                );
            }
        }
    }

    /// Re-enqueue permanently failed operations. Returns how many were requeued.
    pub fn retry_failed(&self, bill_id: Option<BillId>) -> EngineResult<usize> {
        let requeued = self.inner.state.lock().queue.retry_failed(bill_id);
        self.inner.persist()?;
        tracing::info!(count = requeued.len(), bill_id, "Requeued failed operations");
        self.wake();
        Ok(requeued.len())
    }

    pub fn failed_operations(&self) -> Vec<SyncOperation> {
        self.inner
            .state
            .lock()
            .queue
            .failed()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.inner.state.lock().conflicts.iter().cloned().collect()
    }

    /// Settle a parked conflict.
    ///
    /// `KeepLocal` acknowledges the remote state and requeues the local
    /// operation; `KeepRemote` pulls the remote edit into the bill (or accepts
    /// the remote deletion) and drops the local operation.
    pub fn resolve_conflict(&self, id: ConflictId, choice: ConflictChoice) -> EngineResult<()> {
        // Stays parked until the bill side has been updated.
        let conflict = self
            .inner
            .state
            .lock()
            .conflicts
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::ConflictNotFound(id.to_string()))?;
        let key = conflict.key();
        let now = Utc::now();

        let bill_modified = match (choice, conflict.kind) {
            (ConflictChoice::KeepRemote, ConflictKind::RemoteModified) => {
                let Some(remote) = &conflict.remote else {
                    return Err(EngineError::Config(format!(
                        "conflict {id} has no remote event to keep"
                    )));
                };
                self.inner
                    .bills
                    .apply_remote_edit(conflict.bill_id, &RemoteEdit::from(remote))?;
                self.inner
                    .bills
                    .load_bill_snapshot(conflict.bill_id)?
                    .map(|b| b.last_modified)
            }
            _ => None,
        };

        {
            let mut st = self.inner.state.lock();
            if st.conflicts.take(id).is_none() {
                return Err(EngineError::ConflictNotFound(id.to_string()));
            }
            match (choice, conflict.kind) {
                (ConflictChoice::KeepLocal, kind) => {
                    if let Some(marker) = st.markers.get_mut(&key) {
                        match kind {
                            ConflictKind::RemoteModified => {
                                let seen = conflict.remote.as_ref().and_then(|r| r.updated);
                                marker.remote_updated = seen.max(marker.remote_updated);
                            }
                            ConflictKind::RemoteMissing => marker.detached = true,
                        }
                    }
                    if st.queue.pending_for(&key).is_none() {
                        let mut op = conflict.operation.clone();
                        op.retry_count = 0;
                        op.next_attempt_at = None;
                        op.last_error = None;
                        st.queue.enqueue(op);
                    }
                }
                (ConflictChoice::KeepRemote, ConflictKind::RemoteModified) => {
                    if let (Some(marker), Some(remote)) =
                        (st.markers.get_mut(&key), conflict.remote.as_ref())
                    {
                        marker.remote_updated = remote.updated.max(marker.remote_updated);
                        marker.synced_at = now;
                        marker.event_start = remote.start;
                        if let Some(modified) = bill_modified {
                            marker.bill_modified = modified;
                        }
                    }
                }
                (ConflictChoice::KeepRemote, ConflictKind::RemoteMissing) => {
                    if let Some(marker) = st.markers.get_mut(&key) {
                        marker.detached = true;
                        if let Some(snapshot) = &conflict.operation.snapshot {
                            marker.bill_modified = marker.bill_modified.max(snapshot.last_modified);
                        }
                    }
                }
            }
        }
        if (choice, conflict.kind) == (ConflictChoice::KeepRemote, ConflictKind::RemoteMissing) {
            self.inner
                .record_external_id(conflict.bill_id, &conflict.provider, None);
        }

        tracing::info!(
            conflict_id = %id,
            bill_id = conflict.bill_id,
            provider = %conflict.provider,
            choice = ?choice,
            "Conflict resolved"
        );
        self.inner.persist()?;
        self.wake();
        Ok(())
    }

    /// Nudge the background worker.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }
}
