//! Re-derivation of queued work from bills and sync markers.
//!
//! Runs at startup, after settings or connection changes, and on every
//! cadence tick, so a lost notification or a crash between a bill change and
//! its enqueue heals on the next pass.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;

use super::SyncCoordinator;
use crate::bill::BillId;
use crate::conflict::SyncMarker;
use crate::error::EngineResult;
use crate::operation::{OperationKey, OperationKind, SyncOperation};

impl SyncCoordinator {
    /// Enqueue whatever the bills and markers say is missing.
    /// Returns the number of operations derived.
    pub fn reconcile(&self) -> EngineResult<usize> {
        let settings = self.inner.settings.read().clone();
        let bills = self.inner.bills.list_bill_snapshots()?;
        let today = Utc::now().date_naive();
        let mut derived = 0;

        {
            let mut st = self.inner.state.lock();

            let dropped: BTreeSet<String> = st
                .queue
                .to_entries()
                .into_iter()
                .map(|e| e.op.provider)
                .filter(|p| !settings.is_provider_enabled(p))
                .collect();
            for provider in &dropped {
                let purged = st.queue.purge_provider(provider);
                tracing::info!(
                    provider = %provider,
                    purged,
                    "Purged queue for provider no longer enabled"
                );
            }

            for provider in &settings.enabled_providers {
                if st.disconnected.contains(provider) {
                    continue;
                }
                for bill in bills.iter().filter(|b| b.validate().is_ok()) {
                    let key = OperationKey::new(bill.id, provider.clone());
                    if st.queue.tracks(&key) || st.conflicts.contains_key(&key) {
                        continue;
                    }

                    let eligible = settings.wants_event(bill, today);
                    let has_remote_id = bill.external_id(provider).is_some();
                    let kind = match (st.markers.get(&key), eligible) {
                        (Some(marker), true) => (bill.last_modified > marker.bill_modified)
                            .then_some(if marker.detached {
                                OperationKind::Create
                            } else {
                                OperationKind::Update
                            }),
                        (Some(marker), false) => {
                            (!marker.detached).then_some(OperationKind::Delete)
                        }
                        (None, true) if has_remote_id => Some(OperationKind::Update),
                        (None, true) => Some(OperationKind::Create),
                        (None, false) => has_remote_id.then_some(OperationKind::Delete),
                    };
                    let Some(kind) = kind else {
                        continue;
                    };
                    if kind != OperationKind::Delete && st.still_rejected(&key, bill) {
                        continue;
                    }

                    let external_id = st.known_external_id(&key, Some(bill));
                    st.queue.enqueue(
                        SyncOperation::new(kind, bill.id, provider.clone(), Some(bill.clone()))
                            .with_external_id(external_id),
                    );
                    tracing::debug!(
                        bill_id = bill.id,
                        provider = %provider,
                        operation = %kind,
                        "Re-derived sync operation"
                    );
                    derived += 1;
                }
            }

            let live: HashSet<BillId> = bills.iter().map(|b| b.id).collect();
            st.rejected.retain(|key, _| live.contains(&key.bill_id));
            let orphaned: Vec<SyncMarker> = st
                .markers
                .values()
                .filter(|m| !live.contains(&m.bill_id))
                .cloned()
                .collect();
            for marker in orphaned {
                let key = marker.key();
                if marker.detached {
                    st.markers.remove(&key);
                    continue;
                }
                if !settings.is_provider_enabled(&marker.provider)
                    || st.disconnected.contains(&marker.provider)
                    || st.queue.tracks(&key)
                {
                    continue;
                }
                let delete = SyncOperation::new(
                    OperationKind::Delete,
                    marker.bill_id,
                    marker.provider.clone(),
                    None,
                );
                st.queue
                    .enqueue(delete.with_external_id(Some(marker.external_id.clone())));
                derived += 1;
            }
        }

        self.inner.persist()?;
        if derived > 0 {
            tracing::info!(count = derived, "Reconciliation enqueued missing operations");
        }
        Ok(derived)
    }
}
