//! Conflict detection and resolution between local bills and remote events.
//!
//! Detection is best-effort: before an update is dispatched the remote event
//! is looked up in a window around the event and compared against the
//! [`SyncMarker`] captured at the previous successful sync. A remote
//! `updated` timestamp newer than the one observed then counts as divergence.
//! This only guards against races with direct edits in the external
//! calendar; it is not a linearizable protocol.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bill::BillId;
use crate::date_range::DateRange;
use crate::event::CalendarEvent;
use crate::operation::{OperationKey, SyncOperation};
use crate::settings::ConflictStrategy;

/// What the engine last knew about a mirrored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub bill_id: BillId,
    pub provider: String,
    pub external_id: String,
    /// `last_modified` of the bill snapshot that was pushed.
    pub bill_modified: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
    /// Remote `updated` timestamp reported at that sync, if the provider has one.
    pub remote_updated: Option<DateTime<Utc>>,
    pub event_start: DateTime<Utc>,
    /// The remote event is gone and that was accepted; nothing to update
    /// until the bill changes again.
    #[serde(default)]
    pub detached: bool,
}

impl SyncMarker {
    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.bill_id, self.provider.clone())
    }

    /// Remote timestamps at or before this are considered our own writes.
    pub fn baseline(&self) -> DateTime<Utc> {
        self.remote_updated.unwrap_or(self.synced_at)
    }
}

/// Listing window for conflict detection: covers where the event was and
/// where it is about to move, padded by `days`.
pub fn detection_window(marker: &SyncMarker, local: &CalendarEvent, days: i64) -> DateRange {
    DateRange::around(marker.event_start.date_naive(), days)
        .union(DateRange::around(local.start.date_naive(), days))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Divergence {
    None,
    RemoteMissing,
    RemoteModified(CalendarEvent),
}

pub fn detect(marker: &SyncMarker, remote_events: &[CalendarEvent]) -> Divergence {
    let Some(remote) = remote_events
        .iter()
        .find(|e| e.external_id.as_deref() == Some(marker.external_id.as_str()))
    else {
        return Divergence::RemoteMissing;
    };

    match remote.updated {
        Some(updated) if updated > marker.baseline() => Divergence::RemoteModified(remote.clone()),
        _ => Divergence::None,
    }
}

/// User-editable fields pulled back into the bill when the remote side wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEdit {
    pub title: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub location: Option<String>,
}

impl From<&CalendarEvent> for RemoteEdit {
    fn from(event: &CalendarEvent) -> Self {
        RemoteEdit {
            title: event.title.clone(),
            description: event.description.clone(),
            due_date: event.start.date_naive(),
            start: event.start,
            end: event.end,
            all_day: event.all_day,
            location: event.location.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// No divergence; dispatch as planned.
    Proceed,
    /// Remote was edited: write the local representation over it.
    Overwrite,
    /// Remote was deleted: create a fresh event.
    Recreate,
    /// Remote was edited: discard the local operation and adopt the edit.
    AcceptRemote(RemoteEdit),
    /// Remote was deleted: discard the local operation and forget the event.
    AcceptRemoteDeletion,
    /// Hold the operation until the user decides.
    Park,
}

pub fn resolve(strategy: ConflictStrategy, divergence: &Divergence) -> Resolution {
    match (strategy, divergence) {
        (_, Divergence::None) => Resolution::Proceed,
        (ConflictStrategy::Manual, _) => Resolution::Park,
        (ConflictStrategy::LocalWins, Divergence::RemoteMissing) => Resolution::Recreate,
        (ConflictStrategy::LocalWins, Divergence::RemoteModified(_)) => Resolution::Overwrite,
        (ConflictStrategy::RemoteWins, Divergence::RemoteMissing) => {
            Resolution::AcceptRemoteDeletion
        }
        (ConflictStrategy::RemoteWins, Divergence::RemoteModified(remote)) => {
            Resolution::AcceptRemote(RemoteEdit::from(remote))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(pub Uuid);

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ConflictId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    RemoteMissing,
    RemoteModified,
}

/// How the user settled a parked conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    KeepLocal,
    KeepRemote,
}

/// A parked conflict awaiting a manual decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub bill_id: BillId,
    pub provider: String,
    pub detected_at: DateTime<Utc>,
    pub kind: ConflictKind,
    pub local: CalendarEvent,
    pub remote: Option<CalendarEvent>,
    pub operation: SyncOperation,
}

impl Conflict {
    pub fn new(
        operation: SyncOperation,
        local: CalendarEvent,
        divergence: &Divergence,
    ) -> Option<Self> {
        let (kind, remote) = match divergence {
            Divergence::None => return None,
            Divergence::RemoteMissing => (ConflictKind::RemoteMissing, None),
            Divergence::RemoteModified(remote) => {
                (ConflictKind::RemoteModified, Some(remote.clone()))
            }
        };
        Some(Conflict {
            id: ConflictId(Uuid::new_v4()),
            bill_id: operation.bill_id,
            provider: operation.provider.clone(),
            detected_at: Utc::now(),
            kind,
            local,
            remote,
            operation,
        })
    }

    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.bill_id, self.provider.clone())
    }
}

/// Parked conflicts, at most one per (bill, provider).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictList(Vec<Conflict>);

impl ConflictList {
    pub fn park(&mut self, conflict: Conflict) {
        let key = conflict.key();
        self.0.retain(|c| c.key() != key);
        self.0.push(conflict);
    }

    pub fn get(&self, id: ConflictId) -> Option<&Conflict> {
        self.0.iter().find(|c| c.id == id)
    }

    pub fn take(&mut self, id: ConflictId) -> Option<Conflict> {
        let index = self.0.iter().position(|c| c.id == id)?;
        Some(self.0.remove(index))
    }

    pub fn remove_key(&mut self, key: &OperationKey) -> Option<Conflict> {
        let index = self.0.iter().position(|c| &c.key() == key)?;
        Some(self.0.remove(index))
    }

    pub fn contains_key(&self, key: &OperationKey) -> bool {
        self.0.iter().any(|c| &c.key() == key)
    }

    pub fn purge_provider(&mut self, provider: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|c| c.provider != provider);
        before - self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;
    use chrono::{Duration, TimeZone};

    fn make_test_marker(remote_updated: Option<DateTime<Utc>>) -> SyncMarker {
        SyncMarker {
            bill_id: 1,
            provider: "google".into(),
            external_id: "evt-1".into(),
            bill_modified: Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap(),
            synced_at: Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 5).unwrap(),
            remote_updated,
            event_start: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            detached: false,
        }
    }

    fn make_test_event(external_id: &str, updated: Option<DateTime<Utc>>) -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        CalendarEvent {
            bill_id: 1,
            external_id: Some(external_id.into()),
            title: "[Bill] Rent - $1200.00".into(),
            description: String::new(),
            start,
            end: start + Duration::days(1),
            all_day: true,
            reminders: vec![],
            color: None,
            location: None,
            updated,
        }
    }

    #[test]
    fn missing_remote_event_is_divergence() {
        let marker = make_test_marker(None);
        let remote = vec![make_test_event("other", None)];
        assert_eq!(detect(&marker, &remote), Divergence::RemoteMissing);
    }

    #[test]
    fn newer_remote_timestamp_is_divergence() {
        let observed = Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 4).unwrap();
        let marker = make_test_marker(Some(observed));

        let same = vec![make_test_event("evt-1", Some(observed))];
        assert_eq!(detect(&marker, &same), Divergence::None);

        let edited = make_test_event("evt-1", Some(observed + Duration::minutes(3)));
        assert_eq!(
            detect(&marker, std::slice::from_ref(&edited)),
            Divergence::RemoteModified(edited)
        );
    }

    #[test]
    fn falls_back_to_sync_time_without_remote_timestamp() {
        let marker = make_test_marker(None);
        let before = vec![make_test_event("evt-1", Some(marker.synced_at))];
        assert_eq!(detect(&marker, &before), Divergence::None);

        let after = vec![make_test_event(
            "evt-1",
            Some(marker.synced_at + Duration::seconds(1)),
        )];
        assert!(matches!(detect(&marker, &after), Divergence::RemoteModified(_)));
    }

    #[test]
    fn strategies_map_to_resolutions() {
        let edited = make_test_event("evt-1", None);
        let modified = Divergence::RemoteModified(edited.clone());

        assert_eq!(
            resolve(ConflictStrategy::LocalWins, &Divergence::RemoteMissing),
            Resolution::Recreate
        );
        assert_eq!(resolve(ConflictStrategy::LocalWins, &modified), Resolution::Overwrite);
        assert_eq!(
            resolve(ConflictStrategy::RemoteWins, &modified),
            Resolution::AcceptRemote(RemoteEdit::from(&edited))
        );
        assert_eq!(
            resolve(ConflictStrategy::RemoteWins, &Divergence::RemoteMissing),
            Resolution::AcceptRemoteDeletion
        );
        assert_eq!(resolve(ConflictStrategy::Manual, &modified), Resolution::Park);
        assert_eq!(
            resolve(ConflictStrategy::Manual, &Divergence::None),
            Resolution::Proceed
        );
    }

    #[test]
    fn window_covers_old_and_new_dates() {
        let marker = make_test_marker(None);
        let mut moved = make_test_event("evt-1", None);
        moved.start = Utc.with_ymd_and_hms(2025, 4, 15, 0, 0, 0).unwrap();

        let window = detection_window(&marker, &moved, 7);
        assert!(window.contains(marker.event_start));
        assert!(window.contains(moved.start));
    }

    #[test]
    fn one_parked_conflict_per_pair() {
        let mut list = ConflictList::default();
        let op = SyncOperation::new(OperationKind::Update, 1, "google", None);
        let local = make_test_event("evt-1", None);

        let first = Conflict::new(op.clone(), local.clone(), &Divergence::RemoteMissing).unwrap();
        let second = Conflict::new(op, local, &Divergence::RemoteMissing).unwrap();
        let second_id = second.id;
        list.park(first);
        list.park(second);

        assert_eq!(list.len(), 1);
        assert!(list.take(second_id).is_some());
        assert!(list.is_empty());
    }
}
