//! API credential access.
//!
//! The engine never reads keys from the environment itself; it asks an
//! injected [`CredentialStore`]. The CLI wires up [`EnvCredentialStore`],
//! tests use [`MemoryCredentialStore`], and a desktop front end can plug in
//! an OS keychain.

use crate::error::OcrBatchError;
use std::fmt;
use std::sync::RwLock;

/// An opaque API key. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Credential(secret.into())
    }

    /// The raw secret, for building the request header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Source of the single API credential used for a batch.
pub trait CredentialStore: Send + Sync {
    /// Current credential, or `None` if none is stored.
    fn get(&self) -> Result<Option<Credential>, OcrBatchError>;

    /// Replace the stored credential.
    fn set(&self, credential: Credential) -> Result<(), OcrBatchError>;

    /// Guidance shown when no credential is available.
    fn missing_hint(&self) -> String {
        "Store an API key and re-run.".to_string()
    }

    /// `get()`, turning an empty store into [`OcrBatchError::CredentialMissing`].
    fn require(&self) -> Result<Credential, OcrBatchError> {
        match self.get()? {
            Some(c) if !c.expose().trim().is_empty() => Ok(c),
            _ => Err(OcrBatchError::CredentialMissing {
                hint: self.missing_hint(),
            }),
        }
    }
}

/// Reads the key from an environment variable, with an in-process override.
#[derive(Debug)]
pub struct EnvCredentialStore {
    var: String,
    overridden: RwLock<Option<Credential>>,
}

impl EnvCredentialStore {
    pub const DEFAULT_VAR: &'static str = "MISTRAL_API_KEY";

    pub fn new(var: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            overridden: RwLock::new(None),
        }
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl CredentialStore for EnvCredentialStore {
    fn get(&self) -> Result<Option<Credential>, OcrBatchError> {
        let guard = self
            .overridden
            .read()
            .map_err(|e| OcrBatchError::CredentialStore(e.to_string()))?;
        if let Some(c) = guard.as_ref() {
            return Ok(Some(c.clone()));
        }
        Ok(std::env::var(&self.var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(Credential::new))
    }

    fn set(&self, credential: Credential) -> Result<(), OcrBatchError> {
        let mut guard = self
            .overridden
            .write()
            .map_err(|e| OcrBatchError::CredentialStore(e.to_string()))?;
        *guard = Some(credential);
        Ok(())
    }

    fn missing_hint(&self) -> String {
        format!("Set it with: export {}=<your-key>", self.var)
    }
}

/// Holds the credential in memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn with(credential: Credential) -> Self {
        Self {
            inner: RwLock::new(Some(credential)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<Credential>, OcrBatchError> {
        self.inner
            .read()
            .map(|g| g.clone())
            .map_err(|e| OcrBatchError::CredentialStore(e.to_string()))
    }

    fn set(&self, credential: Credential) -> Result<(), OcrBatchError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|e| OcrBatchError::CredentialStore(e.to_string()))?;
        *guard = Some(credential);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let c = Credential::new("sk-very-secret");
        let shown = format!("{c:?}");
        assert!(!shown.contains("secret"), "got {shown}");
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryCredentialStore::default();
        assert!(matches!(
            store.require(),
            Err(OcrBatchError::CredentialMissing { .. })
        ));
        store.set(Credential::new("k1")).unwrap();
        assert_eq!(store.require().unwrap().expose(), "k1");
    }

    #[test]
    fn env_store_reads_variable_and_honours_override() {
        let var = "OCRBATCH_TEST_CREDENTIAL_ENV";
        std::env::remove_var(var);
        let store = EnvCredentialStore::new(var);
        let err = store.require().unwrap_err();
        assert!(err.to_string().contains(var));

        std::env::set_var(var, "from-env");
        assert_eq!(store.require().unwrap().expose(), "from-env");

        store.set(Credential::new("override")).unwrap();
        assert_eq!(store.require().unwrap().expose(), "override");
        std::env::remove_var(var);
    }

    #[test]
    fn blank_credential_counts_as_missing() {
        let store = MemoryCredentialStore::with(Credential::new("   "));
        assert!(store.require().is_err());
    }
}
