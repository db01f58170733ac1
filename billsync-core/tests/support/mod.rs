//! Scriptable in-memory provider and bill store for engine tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use billsync_core::{
    AdapterRegistry, BillId, BillSnapshot, BillStore, CalendarEvent, ConnectionResult,
    ConnectionStatus, Credential, CredentialKey, CredentialStore, DateRange, EngineConfig,
    EngineError, EngineResult, EventResult, MemoryCredentialStore, ProviderAdapter, ProviderError,
    RemoteEdit, SyncCoordinator, SyncSettings,
};
use chrono::{Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub const USER: &str = "household";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Create,
    Update,
    Delete,
    List,
    Refresh,
}

/// A calendar that lives in memory. Failures can be scripted per method and
/// are consumed in order before the real behaviour kicks in.
pub struct FakeCalendar {
    name: String,
    events: Mutex<BTreeMap<String, CalendarEvent>>,
    failures: Mutex<HashMap<Method, VecDeque<ProviderError>>>,
    calls: Mutex<HashMap<Method, usize>>,
    next_id: AtomicUsize,
    cancel_on_create: Mutex<Option<CancellationToken>>,
}

impl FakeCalendar {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(FakeCalendar {
            name: name.to_string(),
            events: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            cancel_on_create: Mutex::new(None),
        })
    }

    pub fn fail_next(&self, method: Method, error: ProviderError) {
        self.fail_times(method, 1, error);
    }

    pub fn fail_times(&self, method: Method, times: usize, error: ProviderError) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(method).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Fire `token` during the next create call, after the event is stored.
    pub fn cancel_during_create(&self, token: CancellationToken) {
        *self.cancel_on_create.lock() = Some(token);
    }

    pub fn calls(&self, method: Method) -> usize {
        self.calls.lock().get(&method).copied().unwrap_or(0)
    }

    pub fn event(&self, external_id: &str) -> Option<CalendarEvent> {
        self.events.lock().get(external_id).cloned()
    }

    pub fn events_for(&self, bill_id: BillId) -> Vec<CalendarEvent> {
        self.events
            .lock()
            .values()
            .filter(|e| e.bill_id == bill_id)
            .cloned()
            .collect()
    }

    /// Simulate the user deleting the event in the calendar UI.
    pub fn remove_remote(&self, external_id: &str) {
        self.events.lock().remove(external_id);
    }

    /// Simulate the user editing the event in the calendar UI.
    pub fn edit_remote(&self, external_id: &str, edit: impl FnOnce(&mut CalendarEvent)) {
        if let Some(event) = self.events.lock().get_mut(external_id) {
            edit(event);
            event.updated = Some(Utc::now() + Duration::seconds(1));
        }
    }

    fn enter(&self, method: Method) -> Result<(), ProviderError> {
        *self.calls.lock().entry(method).or_default() += 1;
        match self
            .failures
            .lock()
            .get_mut(&method)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for FakeCalendar {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh_token(&self, credential: &Credential) -> Result<Credential, ProviderError> {
        self.enter(Method::Refresh)?;
        let mut fresh = credential.clone();
        fresh.access_token = "refreshed".into();
        fresh.expires_at = Some(Utc::now() + Duration::hours(1));
        Ok(fresh)
    }

    async fn create_event(
        &self,
        _credential: &Credential,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        self.enter(Method::Create)?;
        let id = format!("{}-evt-{}", self.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        let updated = Utc::now();
        let mut stored = event.clone();
        stored.external_id = Some(id.clone());
        stored.updated = Some(updated);
        self.events.lock().insert(id.clone(), stored);

        if let Some(token) = self.cancel_on_create.lock().take() {
            token.cancel();
        }
        Ok(EventResult {
            external_id: id,
            updated: Some(updated),
        })
    }

    async fn update_event(
        &self,
        _credential: &Credential,
        external_id: &str,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError> {
        self.enter(Method::Update)?;
        let mut events = self.events.lock();
        let Some(stored) = events.get_mut(external_id) else {
            return Err(ProviderError::NotFound(external_id.to_string()));
        };
        let updated = Utc::now();
        *stored = event.clone();
        stored.external_id = Some(external_id.to_string());
        stored.updated = Some(updated);
        Ok(EventResult {
            external_id: external_id.to_string(),
            updated: Some(updated),
        })
    }

    async fn delete_event(
        &self,
        _credential: &Credential,
        external_id: &str,
    ) -> Result<(), ProviderError> {
        self.enter(Method::Delete)?;
        self.events.lock().remove(external_id);
        Ok(())
    }

    async fn list_events(
        &self,
        _credential: &Credential,
        range: &DateRange,
    ) -> Result<Vec<CalendarEvent>, ProviderError> {
        self.enter(Method::List)?;
        Ok(self
            .events
            .lock()
            .values()
            .filter(|e| range.contains(e.start))
            .cloned()
            .collect())
    }

    async fn test_connection(
        &self,
        credential: &Credential,
    ) -> Result<ConnectionResult, ProviderError> {
        Ok(ConnectionResult {
            provider: self.name.clone(),
            status: ConnectionStatus::Connected,
            account: Some(credential.account.clone()),
            response_time_ms: 0,
            message: "ok".into(),
        })
    }
}

/// `BillStore` entry points whose failure a test can switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Load,
    List,
    RecordId,
    RemoteEdit,
}

/// Bill records owned by the "application". Any hook can be made to fail
/// until it is healed again.
#[derive(Default)]
pub struct MemoryBills {
    bills: Mutex<BTreeMap<BillId, BillSnapshot>>,
    failing: Mutex<HashSet<Hook>>,
    pub remote_edits: Mutex<Vec<(BillId, RemoteEdit)>>,
}

impl MemoryBills {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryBills::default())
    }

    pub fn upsert(&self, bill: BillSnapshot) {
        self.bills.lock().insert(bill.id, bill);
    }

    pub fn remove(&self, bill_id: BillId) {
        self.bills.lock().remove(&bill_id);
    }

    pub fn get(&self, bill_id: BillId) -> Option<BillSnapshot> {
        self.bills.lock().get(&bill_id).cloned()
    }

    /// Apply `change` to the stored bill, bump its modification time and
    /// return the new snapshot.
    pub fn modify(
        &self,
        bill_id: BillId,
        change: impl FnOnce(&mut BillSnapshot),
    ) -> BillSnapshot {
        let mut bills = self.bills.lock();
        let bill = bills.get_mut(&bill_id).expect("bill exists");
        change(bill);
        bill.last_modified = Utc::now();
        bill.clone()
    }

    pub fn fail_hook(&self, hook: Hook) {
        self.failing.lock().insert(hook);
    }

    pub fn heal_hook(&self, hook: Hook) {
        self.failing.lock().remove(&hook);
    }

    fn check(&self, hook: Hook) -> EngineResult<()> {
        if self.failing.lock().contains(&hook) {
            return Err(EngineError::BillStore(format!("{hook:?}: database is locked")));
        }
        Ok(())
    }
}

impl BillStore for MemoryBills {
    fn load_bill_snapshot(&self, bill_id: BillId) -> EngineResult<Option<BillSnapshot>> {
        self.check(Hook::Load)?;
        Ok(self.get(bill_id))
    }

    fn list_bill_snapshots(&self) -> EngineResult<Vec<BillSnapshot>> {
        self.check(Hook::List)?;
        Ok(self.bills.lock().values().cloned().collect())
    }

    fn record_external_event_id(
        &self,
        bill_id: BillId,
        provider: &str,
        external_id: Option<&str>,
    ) -> EngineResult<()> {
        self.check(Hook::RecordId)?;
        if let Some(bill) = self.bills.lock().get_mut(&bill_id) {
            match external_id {
                Some(id) => bill.external_ids.insert(provider.to_string(), id.to_string()),
                None => bill.external_ids.remove(provider),
            };
        }
        Ok(())
    }

    fn apply_remote_edit(&self, bill_id: BillId, edit: &RemoteEdit) -> EngineResult<()> {
        self.check(Hook::RemoteEdit)?;
        if let Some(bill) = self.bills.lock().get_mut(&bill_id) {
            bill.due_date = Some(edit.due_date);
            bill.last_modified = Utc::now();
        }
        self.remote_edits.lock().push((bill_id, edit.clone()));
        Ok(())
    }
}

pub fn make_test_bill(id: BillId, name: &str, due: NaiveDate) -> BillSnapshot {
    BillSnapshot {
        id,
        name: name.to_string(),
        amount: Some(120.0),
        category: Some("Utilities".into()),
        due_date: Some(due),
        sync_enabled: Some(true),
        paid: false,
        last_modified: Utc::now(),
        external_ids: BTreeMap::new(),
    }
}

pub fn due(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub fn make_test_settings(providers: &[&str]) -> SyncSettings {
    SyncSettings {
        enabled_providers: providers.iter().map(|p| p.to_string()).collect(),
        // Fixed test dates lie in the past relative to the wall clock.
        max_sync_age_days: 3650,
        ..SyncSettings::default()
    }
}

pub struct Harness {
    pub engine: SyncCoordinator,
    pub bills: Arc<MemoryBills>,
    pub credentials: Arc<MemoryCredentialStore>,
}

/// Engine with in-memory state and a valid credential for every calendar.
pub fn make_test_engine(settings: SyncSettings, calendars: &[Arc<FakeCalendar>]) -> Harness {
    make_test_engine_with(EngineConfig::new(USER), settings, calendars, MemoryBills::new())
}

pub fn make_test_engine_with(
    config: EngineConfig,
    settings: SyncSettings,
    calendars: &[Arc<FakeCalendar>],
    bills: Arc<MemoryBills>,
) -> Harness {
    let credentials = Arc::new(MemoryCredentialStore::new());
    let mut registry = AdapterRegistry::new();
    for calendar in calendars {
        credentials
            .put(
                &CredentialKey::new(USER, calendar.name()),
                &Credential::new("me@example.com", "token"),
            )
            .expect("store credential");
        registry.register(calendar.clone());
    }

    let engine =
        SyncCoordinator::open(config, settings, registry, credentials.clone(), bills.clone())
            .expect("engine opens");
    Harness {
        engine,
        bills,
        credentials,
    }
}
