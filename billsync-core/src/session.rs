//! Authenticated sessions: loads credentials, refreshes them through the
//! adapter when expired, and persists the result.
//!
//! Refresh is a critical section per (user, provider). Concurrent callers
//! queue on the same lock and find the already-refreshed credential.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::adapter::{ConnectionResult, ProviderAdapter, bounded};
use crate::credentials::{Credential, CredentialKey, CredentialStore};
use crate::error::{EngineResult, ProviderError};

pub struct SessionManager {
    user: String,
    store: Arc<dyn CredentialStore>,
    timeout: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SessionManager {
    pub fn new(
        user: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        timeout: Duration,
    ) -> Self {
        SessionManager {
            user: user.into(),
            store,
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, provider: &str) -> CredentialKey {
        CredentialKey::new(self.user.clone(), provider)
    }

    fn lock_for(&self, provider: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(provider.to_string())
            .or_default()
            .clone()
    }

    /// A credential ready for use with `adapter`, refreshed if needed.
    pub async fn load_valid(
        &self,
        adapter: &dyn ProviderAdapter,
    ) -> Result<Credential, ProviderError> {
        let provider = adapter.name();
        let lock = self.lock_for(provider);
        let _guard = lock.lock().await;

        let key = self.key(provider);
        let credential = self
            .store
            .get(&key)
            .map_err(|e| ProviderError::Transient(format!("credential store: {e}")))?
            .ok_or_else(|| {
                ProviderError::Auth(format!("no stored credential for {provider}"))
            })?;

        let auth = bounded(self.timeout, adapter.authenticate(&credential)).await?;
        if auth.refreshed {
            tracing::info!(
                provider,
                account = %auth.credential.account,
                "Refreshed provider credential"
            );
            self.store
                .put(&key, &auth.credential)
                .map_err(|e| ProviderError::Transient(format!("credential store: {e}")))?;
        }
        Ok(auth.credential)
    }

    /// Store a credential obtained elsewhere and check that it works.
    pub async fn connect(
        &self,
        adapter: &dyn ProviderAdapter,
        credential: Credential,
    ) -> EngineResult<ConnectionResult> {
        let key = self.key(adapter.name());
        {
            let lock = self.lock_for(adapter.name());
            let _guard = lock.lock().await;
            self.store.put(&key, &credential)?;
        }
        self.test_connection(adapter).await
    }

    pub async fn test_connection(
        &self,
        adapter: &dyn ProviderAdapter,
    ) -> EngineResult<ConnectionResult> {
        let credential = self.load_valid(adapter).await?;
        let result = bounded(self.timeout, adapter.test_connection(&credential)).await?;
        Ok(result)
    }

    /// Revoke at the provider (best-effort) and delete the stored credential.
    pub async fn revoke(&self, adapter: &dyn ProviderAdapter) -> EngineResult<bool> {
        let provider = adapter.name();
        let lock = self.lock_for(provider);
        let _guard = lock.lock().await;

        let key = self.key(provider);
        let Some(credential) = self.store.get(&key)? else {
            return Ok(false);
        };
        if let Err(e) = bounded(self.timeout, adapter.revoke(&credential)).await {
            tracing::warn!(
                provider,
                error = %e,
                "Provider revoke failed, deleting credential anyway"
            );
        }
        self.store.delete(&key)
    }

    pub fn has_credential(&self, provider: &str) -> EngineResult<bool> {
        Ok(self.store.get(&self.key(provider))?.is_some())
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AuthResult, ConnectionStatus, EventResult};
    use crate::credentials::MemoryCredentialStore;
    use crate::date_range::DateRange;
    use crate::event::CalendarEvent;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts refreshes; each refresh takes a while so callers overlap.
    struct SlowRefresh {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for SlowRefresh {
        fn name(&self) -> &str {
            "slow"
        }

        async fn refresh_token(
            &self,
            credential: &Credential,
        ) -> Result<Credential, ProviderError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut fresh = credential.clone();
            fresh.access_token = "fresh".into();
            fresh.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
            Ok(fresh)
        }

        async fn create_event(
            &self,
            _: &Credential,
            _: &CalendarEvent,
        ) -> Result<EventResult, ProviderError> {
            unimplemented!()
        }

        async fn update_event(
            &self,
            _: &Credential,
            _: &str,
            _: &CalendarEvent,
        ) -> Result<EventResult, ProviderError> {
            unimplemented!()
        }

        async fn delete_event(&self, _: &Credential, _: &str) -> Result<(), ProviderError> {
            unimplemented!()
        }

        async fn list_events(
            &self,
            _: &Credential,
            _: &DateRange,
        ) -> Result<Vec<CalendarEvent>, ProviderError> {
            Ok(vec![])
        }

        async fn test_connection(
            &self,
            credential: &Credential,
        ) -> Result<ConnectionResult, ProviderError> {
            Ok(ConnectionResult {
                provider: "slow".into(),
                status: ConnectionStatus::Connected,
                account: Some(credential.account.clone()),
                response_time_ms: 1,
                message: "ok".into(),
            })
        }
    }

    fn expired_credential() -> Credential {
        let mut credential = Credential::new("me", "stale");
        credential.refresh_token = Some("r".into());
        credential.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));
        credential
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce() {
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .put(&CredentialKey::new("u", "slow"), &expired_credential())
            .unwrap();
        let sessions = SessionManager::new("u", store.clone(), Duration::from_secs(5));
        let adapter = SlowRefresh {
            refreshes: AtomicUsize::new(0),
        };

        let results =
            futures::future::join_all((0..8).map(|_| sessions.load_valid(&adapter))).await;

        assert!(results.iter().all(|r| r.as_ref().unwrap().access_token == "fresh"));
        assert_eq!(adapter.refreshes.load(Ordering::SeqCst), 1);
        let stored = store.get(&CredentialKey::new("u", "slow")).unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh");
    }

    #[tokio::test]
    async fn missing_credential_is_auth_error() {
        let store = Arc::new(MemoryCredentialStore::new());
        let sessions = SessionManager::new("u", store, Duration::from_secs(5));
        let adapter = SlowRefresh {
            refreshes: AtomicUsize::new(0),
        };
        assert!(matches!(sessions.load_valid(&adapter).await, Err(ProviderError::Auth(_))));
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_surfaces_auth_expired() {
        struct NoRefresh;

        #[async_trait]
        impl ProviderAdapter for NoRefresh {
            fn name(&self) -> &str {
                "none"
            }
            async fn refresh_token(&self, _: &Credential) -> Result<Credential, ProviderError> {
                Err(ProviderError::Auth("invalid_grant".into()))
            }
            async fn create_event(
                &self,
                _: &Credential,
                _: &CalendarEvent,
            ) -> Result<EventResult, ProviderError> {
                unimplemented!()
            }
            async fn update_event(
                &self,
                _: &Credential,
                _: &str,
                _: &CalendarEvent,
            ) -> Result<EventResult, ProviderError> {
                unimplemented!()
            }
            async fn delete_event(&self, _: &Credential, _: &str) -> Result<(), ProviderError> {
                unimplemented!()
            }
            async fn list_events(
                &self,
                _: &Credential,
                _: &DateRange,
            ) -> Result<Vec<CalendarEvent>, ProviderError> {
                unimplemented!()
            }
            async fn test_connection(
                &self,
                _: &Credential,
            ) -> Result<ConnectionResult, ProviderError> {
                unimplemented!()
            }
        }

        let auth: Result<AuthResult, _> = NoRefresh.authenticate(&expired_credential()).await;
        assert!(matches!(auth, Err(ProviderError::AuthExpired(_))));
    }

    #[tokio::test]
    async fn revoke_deletes_stored_credential() {
        let store = Arc::new(MemoryCredentialStore::new());
        let key = CredentialKey::new("u", "slow");
        store.put(&key, &expired_credential()).unwrap();
        let sessions = SessionManager::new("u", store.clone(), Duration::from_secs(5));
        let adapter = SlowRefresh {
            refreshes: AtomicUsize::new(0),
        };

        assert!(sessions.revoke(&adapter).await.unwrap());
        assert!(store.get(&key).unwrap().is_none());
        assert!(!sessions.revoke(&adapter).await.unwrap());
    }
}
