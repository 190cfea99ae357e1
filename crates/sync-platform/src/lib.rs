//! Host-platform collaborators: credential storage and notification
//! surfaces.

mod credential;
mod notify;

#[cfg(feature = "os-keyring")]
pub use credential::KeyringTokenStore;
pub use credential::{
    CredentialError, CredentialSource, DEFAULT_SERVICE, MemoryTokenStore, StaticCredential,
    StoredCredential, TokenStore,
};
pub use notify::{NotificationRecord, TracingSurface};
