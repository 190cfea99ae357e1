use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use sync_core::{SyncError, SyncErrorCategory};
use thiserror::Error;
use tracing::warn;

/// Keyring service name used when none is configured.
pub const DEFAULT_SERVICE: &str = "supportdesk-sync";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential storage unavailable: {0}")]
    Unavailable(String),
    #[error("credential storage failure: {0}")]
    Backend(String),
}

impl From<CredentialError> for SyncError {
    fn from(err: CredentialError) -> Self {
        let code = match err {
            CredentialError::Unavailable(_) => "credential_store_unavailable",
            CredentialError::Backend(_) => "credential_store_failure",
        };
        SyncError::new(SyncErrorCategory::Auth, code, err.to_string())
    }
}

/// Persistent home of API tokens, keyed by account.
///
/// A missing token is `Ok(None)`, never an error; `remove` is idempotent.
pub trait TokenStore: Send + Sync {
    fn load(&self, account: &str) -> Result<Option<String>, CredentialError>;

    fn store(&self, account: &str, token: &str) -> Result<(), CredentialError>;

    fn remove(&self, account: &str) -> Result<(), CredentialError>;
}

/// Process-local token store.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    tokens: Arc<Mutex<HashMap<String, String>>>,
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, account: &str) -> Result<Option<String>, CredentialError> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tokens.get(account).cloned())
    }

    fn store(&self, account: &str, token: &str) -> Result<(), CredentialError> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.to_owned(), token.to_owned());
        Ok(())
    }

    fn remove(&self, account: &str) -> Result<(), CredentialError> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(account);
        Ok(())
    }
}

/// OS keyring entries under one service namespace.
#[cfg(feature = "os-keyring")]
#[derive(Debug, Clone)]
pub struct KeyringTokenStore {
    service: String,
}

#[cfg(feature = "os-keyring")]
impl KeyringTokenStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, account).map_err(map_keyring_error)
    }
}

#[cfg(feature = "os-keyring")]
impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

#[cfg(feature = "os-keyring")]
impl TokenStore for KeyringTokenStore {
    fn load(&self, account: &str) -> Result<Option<String>, CredentialError> {
        match self.entry(account)?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(map_keyring_error(err)),
        }
    }

    fn store(&self, account: &str, token: &str) -> Result<(), CredentialError> {
        self.entry(account)?
            .set_password(token)
            .map_err(map_keyring_error)
    }

    fn remove(&self, account: &str) -> Result<(), CredentialError> {
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(map_keyring_error(err)),
        }
    }
}

#[cfg(feature = "os-keyring")]
fn map_keyring_error(err: keyring::Error) -> CredentialError {
    match err {
        keyring::Error::NoStorageAccess(inner) => CredentialError::Unavailable(inner.to_string()),
        other => CredentialError::Backend(other.to_string()),
    }
}

/// Supplies the auth credential attached to push channels and REST calls.
///
/// Read on every connect so that a token stored after startup is picked up.
pub trait CredentialSource: Send + Sync {
    fn credential(&self) -> Option<String>;
}

/// Fixed credential, mainly for tests and one-shot tools.
#[derive(Debug, Clone, Default)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn missing() -> Self {
        Self(None)
    }
}

impl CredentialSource for StaticCredential {
    fn credential(&self) -> Option<String> {
        self.0.clone().filter(|token| !token.trim().is_empty())
    }
}

/// The token saved for one account of a [`TokenStore`].
#[derive(Debug, Clone)]
pub struct StoredCredential<S> {
    store: S,
    account: String,
}

impl<S: TokenStore> StoredCredential<S> {
    pub fn new(store: S, account: impl Into<String>) -> Self {
        Self {
            store,
            account: account.into(),
        }
    }

    pub fn save(&self, token: &str) -> Result<(), CredentialError> {
        self.store.store(&self.account, token.trim())
    }

    pub fn clear(&self) -> Result<(), CredentialError> {
        self.store.remove(&self.account)
    }
}

impl<S: TokenStore> CredentialSource for StoredCredential<S> {
    fn credential(&self) -> Option<String> {
        match self.store.load(&self.account) {
            Ok(token) => token.filter(|token| !token.trim().is_empty()),
            Err(err) => {
                warn!(account = %self.account, error = %err, "credential lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnreachableStore;

    impl TokenStore for UnreachableStore {
        fn load(&self, _account: &str) -> Result<Option<String>, CredentialError> {
            Err(CredentialError::Unavailable("keychain locked".to_owned()))
        }

        fn store(&self, _account: &str, _token: &str) -> Result<(), CredentialError> {
            Err(CredentialError::Unavailable("keychain locked".to_owned()))
        }

        fn remove(&self, _account: &str) -> Result<(), CredentialError> {
            Err(CredentialError::Unavailable("keychain locked".to_owned()))
        }
    }

    #[test]
    fn stored_credential_reads_saves_and_clears() {
        let credential = StoredCredential::new(MemoryTokenStore::default(), "agent-7");
        assert_eq!(credential.credential(), None);

        credential.save(" tok-1 ").expect("save");
        assert_eq!(credential.credential().as_deref(), Some("tok-1"));

        credential.clear().expect("clear");
        credential.clear().expect("clearing twice is fine");
        assert_eq!(credential.credential(), None);
    }

    #[test]
    fn accounts_do_not_share_tokens() {
        let store = MemoryTokenStore::default();
        let dashboard = StoredCredential::new(store.clone(), "dashboard");
        let widget = StoredCredential::new(store, "widget");

        dashboard.save("one").expect("save");
        assert_eq!(widget.credential(), None);
        widget.save("two").expect("save");
        assert_eq!(dashboard.credential().as_deref(), Some("one"));
    }

    #[test]
    fn blank_credentials_count_as_missing() {
        assert_eq!(StaticCredential::new("  ").credential(), None);
        assert_eq!(StaticCredential::missing().credential(), None);
        assert_eq!(StaticCredential::new("t").credential().as_deref(), Some("t"));
    }

    #[cfg(feature = "os-keyring")]
    #[test]
    fn keyring_store_defaults_to_desk_service() {
        assert_eq!(KeyringTokenStore::default().service(), DEFAULT_SERVICE);
        assert_eq!(KeyringTokenStore::new("desk-staging").service(), "desk-staging");
    }

    #[cfg(feature = "os-keyring")]
    #[test]
    #[ignore = "touches the OS keyring"]
    fn keyring_round_trip() {
        let credential = StoredCredential::new(
            KeyringTokenStore::new("supportdesk-sync-test"),
            "keyring-round-trip",
        );
        credential.save("tok-k").expect("save");
        assert_eq!(credential.credential().as_deref(), Some("tok-k"));
        credential.clear().expect("clear");
        assert_eq!(credential.credential(), None);
    }

    #[test]
    fn unreachable_store_yields_no_credential() {
        let credential = StoredCredential::new(UnreachableStore, "agent-7");
        assert_eq!(credential.credential(), None);

        let err = SyncError::from(credential.save("x").expect_err("save must fail"));
        assert_eq!(err.category, SyncErrorCategory::Auth);
        assert_eq!(err.code, "credential_store_unavailable");
    }
}
