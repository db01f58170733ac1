//! Provider adapter interface.
//!
//! One implementation per external calendar service. Adapters are flat,
//! independent structs behind this trait and are looked up by name in an
//! [`AdapterRegistry`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::Credential;
use crate::date_range::DateRange;
use crate::error::{ErrorKind, ProviderError};
use crate::event::CalendarEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthResult {
    /// Credential to use for subsequent calls (refreshed if `refreshed`).
    pub credential: Credential,
    pub refreshed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResult {
    pub external_id: String,
    /// Provider's last-modified timestamp for the written event, if reported.
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResult {
    pub provider: String,
    pub status: ConnectionStatus,
    pub account: Option<String>,
    pub response_time_ms: u64,
    pub message: String,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Lowercase provider name used in settings and credential keys.
    fn name(&self) -> &str;

    /// Validate a credential, refreshing it when expired.
    ///
    /// A refresh rejected by the provider surfaces as
    /// [`ProviderError::AuthExpired`].
    async fn authenticate(&self, credential: &Credential) -> Result<AuthResult, ProviderError> {
        if !credential.is_expired() {
            return Ok(AuthResult {
                credential: credential.clone(),
                refreshed: false,
            });
        }
        match self.refresh_token(credential).await {
            Ok(credential) => Ok(AuthResult {
                credential,
                refreshed: true,
            }),
            Err(e) if e.kind() == ErrorKind::AuthError => {
                Err(ProviderError::AuthExpired(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh_token(&self, credential: &Credential) -> Result<Credential, ProviderError>;

    /// Revoke the credential at the provider. Best-effort; the default does nothing.
    async fn revoke(&self, _credential: &Credential) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Create the event and return the provider-assigned id.
    async fn create_event(
        &self,
        credential: &Credential,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError>;

    async fn update_event(
        &self,
        credential: &Credential,
        external_id: &str,
        event: &CalendarEvent,
    ) -> Result<EventResult, ProviderError>;

    /// Delete the event. Succeeds if it is already gone.
    async fn delete_event(
        &self,
        credential: &Credential,
        external_id: &str,
    ) -> Result<(), ProviderError>;

    /// Events created by this engine within `range`, with `external_id` and
    /// `updated` populated.
    async fn list_events(
        &self,
        credential: &Credential,
        range: &DateRange,
    ) -> Result<Vec<CalendarEvent>, ProviderError>;

    async fn test_connection(
        &self,
        credential: &Credential,
    ) -> Result<ConnectionResult, ProviderError>;
}

/// Adapters keyed by provider name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

/// Run a provider call with an upper bound on its duration.
/// Elapsed time maps to [`ProviderError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ProviderError::Timeout(limit.as_secs()))?
}
