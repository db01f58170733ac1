//! Calendar synchronization engine for household bills.
//!
//! Mirrors bill due dates as events in external calendar services:
//! - `coordinator` owns the sync queue and drives provider adapters
//! - `adapter` is the trait each calendar service implements
//! - `hooks` is the narrow interface back into the bill records

pub mod adapter;
pub mod bill;
pub mod cipher;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod credentials;
pub mod date_range;
pub mod error;
pub mod event;
pub mod hooks;
pub mod operation;
pub mod queue;
pub mod retry;
pub mod session;
pub mod settings;
pub mod status;
pub mod store;
pub mod template;

pub use adapter::{
    AdapterRegistry, AuthResult, ConnectionResult, ConnectionStatus, EventResult, ProviderAdapter,
};
pub use bill::{BillId, BillSnapshot, ChangeKind};
pub use config::EngineConfig;
pub use conflict::{Conflict, ConflictChoice, ConflictId, ConflictKind, RemoteEdit};
pub use coordinator::{DrainScope, SyncCoordinator};
pub use credentials::{
    Credential, CredentialKey, CredentialStore, EncryptedFileStore, MemoryCredentialStore,
};
pub use date_range::DateRange;
pub use error::{EngineError, EngineResult, ErrorKind, ProviderError, ValidationError};
pub use event::{CalendarEvent, Reminder, ReminderMethod};
pub use hooks::BillStore;
pub use operation::{OperationId, OperationKind, Rejection, SyncOperation};
pub use settings::{ConflictStrategy, SyncMode, SyncSettings};
pub use status::{Outcome, SyncResult, SyncStatus};
pub use template::{EventTemplate, EventTiming, generate_event};
