//! Credential providers and file-backed provider storage.

use crate::auth::Credentials;
use crate::error::{ClientError, ClientResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tether_core::now_millis;

/// Acquires and maintains credentials, and holds per-user storage.
///
/// Selected once at session construction. Callers interact with the
/// capability surface only; nothing in the SDK branches on a concrete
/// provider type.
pub trait CredentialProvider: Send + Sync {
    /// Exchanges a refresh token for fresh credentials.
    ///
    /// A `CredentialsRejected` error means the refresh token itself is
    /// invalid and the session must log out; any other error is treated
    /// as transient.
    fn refresh(&self, refresh_token: &str) -> ClientResult<Credentials>;

    /// Performs the provider's login flow.
    fn login(&self) -> ClientResult<Credentials>;

    /// Invalidates the session server-side.
    fn logout(&self, token: &str) -> ClientResult<()>;

    /// Reads one user-storage value.
    fn get_storage(&self, token: &str, key: &str) -> ClientResult<Option<Value>>;

    /// Writes one user-storage value.
    fn set_storage(&self, token: &str, key: &str, value: &Value) -> ClientResult<()>;

    /// True if the provider completes logins via a callback URL.
    fn supports_callback(&self) -> bool {
        false
    }

    /// Completes a callback-style login.
    fn process_callback(&self, _url: &str) -> ClientResult<Credentials> {
        Err(ClientError::unsupported("callback login"))
    }
}

/// JSON-per-key storage under a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Opens (creating if needed) a storage directory.
    pub fn new(dir: impl Into<PathBuf>) -> ClientResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ClientError::storage(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// Loads one value. Missing keys are `None`.
    pub fn load(&self, key: &str) -> ClientResult<Option<Value>> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ClientError::storage(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::storage(format!("decode {}: {e}", path.display())))?;
        Ok(Some(value))
    }

    /// Saves one value.
    pub fn save(&self, key: &str, value: &Value) -> ClientResult<()> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| ClientError::storage(format!("encode {key}: {e}")))?;
        fs::write(&path, bytes)
            .map_err(|e| ClientError::storage(format!("write {}: {e}", path.display())))
    }

    /// Removes one value. Removing a missing key is not an error.
    pub fn remove(&self, key: &str) -> ClientResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::storage(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }

    /// Keys are used as file names, so the charset is restricted.
    fn path_for(&self, key: &str) -> ClientResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(ClientError::storage(format!("invalid storage key: {key}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

/// Fixed-credential provider for development and tests.
///
/// `refresh` re-mints the configured access token with a pushed-out
/// expiry when the presented refresh token matches, and rejects it
/// otherwise. Storage lives in memory unless a [`FileStorage`] is
/// attached.
pub struct StaticProvider {
    creds: Credentials,
    ttl: Duration,
    memory: Mutex<BTreeMap<String, Value>>,
    file: Option<FileStorage>,
}

impl StaticProvider {
    /// Creates a provider around fixed credentials.
    pub fn new(creds: Credentials) -> Self {
        Self {
            creds,
            ttl: Duration::from_secs(3600),
            memory: Mutex::new(BTreeMap::new()),
            file: None,
        }
    }

    /// Sets the lifetime stamped onto refreshed credentials.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Persists storage under a directory instead of in memory.
    #[must_use]
    pub fn with_file_storage(mut self, storage: FileStorage) -> Self {
        self.file = Some(storage);
        self
    }

    fn minted(&self) -> Credentials {
        Credentials::new(
            self.creds.access_token.clone(),
            self.creds.refresh_token.clone(),
            now_millis() + self.ttl.as_millis() as u64,
        )
    }
}

impl CredentialProvider for StaticProvider {
    fn refresh(&self, refresh_token: &str) -> ClientResult<Credentials> {
        match self.creds.refresh_token.as_deref() {
            Some(expected) if expected == refresh_token => Ok(self.minted()),
            _ => Err(ClientError::CredentialsRejected(
                "unknown refresh token".into(),
            )),
        }
    }

    fn login(&self) -> ClientResult<Credentials> {
        Ok(self.minted())
    }

    fn logout(&self, _token: &str) -> ClientResult<()> {
        Ok(())
    }

    fn get_storage(&self, _token: &str, key: &str) -> ClientResult<Option<Value>> {
        match &self.file {
            Some(storage) => storage.load(key),
            None => Ok(self.memory.lock().get(key).cloned()),
        }
    }

    fn set_storage(&self, _token: &str, key: &str, value: &Value) -> ClientResult<()> {
        match &self.file {
            Some(storage) => storage.save(key, value),
            None => {
                self.memory.lock().insert(key.to_string(), value.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.load("prefs").unwrap(), None);
        storage.save("prefs", &json!({"theme": "dark"})).unwrap();
        assert_eq!(
            storage.load("prefs").unwrap(),
            Some(json!({"theme": "dark"}))
        );

        storage.remove("prefs").unwrap();
        assert_eq!(storage.load("prefs").unwrap(), None);
        // Removing again is fine.
        storage.remove("prefs").unwrap();
    }

    #[test]
    fn file_storage_rejects_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        assert!(storage.save("../escape", &json!(1)).is_err());
        assert!(storage.save("", &json!(1)).is_err());
        assert!(storage.load("a/b").is_err());
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            storage.save("session", &json!({"n": 1})).unwrap();
        }
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load("session").unwrap(), Some(json!({"n": 1})));
    }

    #[test]
    fn static_provider_refresh() {
        let provider = StaticProvider::new(Credentials::new(
            "access",
            Some("refresh-1".into()),
            0,
        ));

        let creds = provider.refresh("refresh-1").unwrap();
        assert_eq!(creds.access_token, "access");
        assert!(creds.expires_at > now_millis());

        let err = provider.refresh("wrong").unwrap_err();
        assert!(err.is_rejection());
    }

    #[test]
    fn static_provider_memory_storage() {
        let provider = StaticProvider::new(Credentials::new("a", None, 0));
        assert_eq!(provider.get_storage("t", "k").unwrap(), None);
        provider.set_storage("t", "k", &json!([1, 2])).unwrap();
        assert_eq!(provider.get_storage("t", "k").unwrap(), Some(json!([1, 2])));
    }

    #[test]
    fn callback_defaults_off() {
        let provider = StaticProvider::new(Credentials::new("a", None, 0));
        assert!(!provider.supports_callback());
        assert!(matches!(
            provider.process_callback("https://example.com/cb"),
            Err(ClientError::Unsupported(_))
        ));
    }
}
