//! Credential store: per-(user, provider) token material.
//!
//! The coordinator never reads credentials directly; they flow through
//! [`SessionManager`](crate::session::SessionManager) into a provider
//! adapter's `authenticate` call.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cipher::{CredentialCipher, EncryptedData};
use crate::error::{EngineError, EngineResult};

/// Tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey {
    pub user: String,
    pub provider: String,
}

impl CredentialKey {
    pub fn new(user: impl Into<String>, provider: impl Into<String>) -> Self {
        CredentialKey {
            user: user.into(),
            provider: provider.into(),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Account label shown to the user (e-mail, username).
    pub account: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-specific values (calendar id, CalDAV username, ...).
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("account", &self.account)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Credential {
    pub fn new(account: impl Into<String>, access_token: impl Into<String>) -> Self {
        Credential {
            account: account.into(),
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|t| Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) >= t)
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }
}

pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &CredentialKey) -> EngineResult<Option<Credential>>;
    fn put(&self, key: &CredentialKey, credential: &Credential) -> EngineResult<()>;
    /// Returns whether a credential existed.
    fn delete(&self, key: &CredentialKey) -> EngineResult<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<CredentialKey, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &CredentialKey) -> EngineResult<Option<Credential>> {
        Ok(self.credentials.read().get(key).cloned())
    }

    fn put(&self, key: &CredentialKey, credential: &Credential) -> EngineResult<()> {
        self.credentials
            .write()
            .insert(key.clone(), credential.clone());
        Ok(())
    }

    fn delete(&self, key: &CredentialKey) -> EngineResult<bool> {
        Ok(self.credentials.write().remove(key).is_some())
    }
}

/// One encrypted JSON file per credential under `dir/<user>/<provider>.json`.
#[derive(Debug)]
pub struct EncryptedFileStore {
    dir: PathBuf,
    cipher: CredentialCipher,
}

impl EncryptedFileStore {
    /// Open (or initialise) a store. The key salt is created on first use
    /// and kept in `dir/salt`.
    pub fn open(dir: impl Into<PathBuf>, passphrase: &str) -> EngineResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let salt_path = dir.join("salt");
        let salt = if salt_path.exists() {
            std::fs::read_to_string(&salt_path)?.trim().to_string()
        } else {
            let salt = CredentialCipher::generate_salt();
            write_private(&salt_path, salt.as_bytes())?;
            salt
        };

        let cipher = CredentialCipher::from_passphrase(passphrase, &salt)?;
        Ok(EncryptedFileStore { dir, cipher })
    }

    fn path_for(&self, key: &CredentialKey) -> PathBuf {
        let user = key.user.replace(['/', '\\', ':', '.'], "_");
        let provider = key.provider.replace(['/', '\\', ':', '.'], "_");
        self.dir.join(user).join(format!("{provider}.json"))
    }
}

impl CredentialStore for EncryptedFileStore {
    fn get(&self, key: &CredentialKey) -> EngineResult<Option<Credential>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let sealed: EncryptedData = serde_json::from_str(&contents).map_err(|e| {
            EngineError::Credentials(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        let plaintext = self.cipher.decrypt(&sealed)?;
        let credential = serde_json::from_slice(&plaintext)
            .map_err(|e| EngineError::Credentials(format!("Corrupt credential: {e}")))?;
        Ok(Some(credential))
    }

    fn put(&self, key: &CredentialKey, credential: &Credential) -> EngineResult<()> {
        let plaintext = serde_json::to_vec(credential)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;
        let sealed = self.cipher.encrypt(&plaintext)?;
        let contents = serde_json::to_vec_pretty(&sealed)
            .map_err(|e| EngineError::Serialization(e.to_string()))?;

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(&path, &contents)
    }

    fn delete(&self, key: &CredentialKey) -> EngineResult<bool> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_private(path: &Path, contents: &[u8]) -> EngineResult<()> {
    std::fs::write(path, contents)?;

    // Owner-only: the file holds token material.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_test_credential() -> Credential {
        let mut credential = Credential::new("me@example.com", "access-1");
        credential.refresh_token = Some("refresh-1".into());
        credential.expires_at = Some(Utc::now() + Duration::hours(1));
        credential
    }

    #[test]
    fn expiry_includes_skew() {
        let mut credential = make_test_credential();
        assert!(!credential.is_expired());

        credential.expires_at = Some(Utc::now() + Duration::seconds(30));
        assert!(credential.is_expired());

        credential.expires_at = None;
        assert!(!credential.is_expired());
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let rendered = format!("{:?}", make_test_credential());
        assert!(!rendered.contains("access-1"));
        assert!(!rendered.contains("refresh-1"));
        assert!(rendered.contains("me@example.com"));
    }

    #[test]
    fn memory_store_get_put_delete() {
        let store = MemoryCredentialStore::new();
        let key = CredentialKey::new("alice", "google");

        assert!(store.get(&key).unwrap().is_none());
        store.put(&key, &make_test_credential()).unwrap();
        assert!(store.get(&key).unwrap().is_some());
        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());
    }

    #[test]
    fn file_store_encrypts_at_rest() {
        let dir = TempDir::new().unwrap();
        let key = CredentialKey::new("alice", "google");
        let credential = make_test_credential();

        let store = EncryptedFileStore::open(dir.path(), "passphrase").unwrap();
        store.put(&key, &credential).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("alice").join("google.json")).unwrap();
        assert!(!raw.contains("access-1"));

        let reopened = EncryptedFileStore::open(dir.path(), "passphrase").unwrap();
        assert_eq!(reopened.get(&key).unwrap(), Some(credential));
    }

    #[test]
    fn file_store_rejects_wrong_passphrase() {
        let dir = TempDir::new().unwrap();
        let key = CredentialKey::new("alice", "outlook");

        EncryptedFileStore::open(dir.path(), "right")
            .unwrap()
            .put(&key, &make_test_credential())
            .unwrap();

        let wrong = EncryptedFileStore::open(dir.path(), "wrong").unwrap();
        assert!(wrong.get(&key).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn file_store_writes_owner_only_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let key = CredentialKey::new("alice", "caldav");
        EncryptedFileStore::open(dir.path(), "pw")
            .unwrap()
            .put(&key, &make_test_credential())
            .unwrap();

        let mode = std::fs::metadata(dir.path().join("alice").join("caldav.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
