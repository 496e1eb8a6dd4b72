//! Secure storage abstraction for identity key material.
//!
//! [`SecureKeyStorage`] is the seam between key custody and the host's
//! credential store. With the `keyring` feature, [`KeyringStorage`] persists
//! the secret in the OS store (Secret Service, Keychain, Credential Manager)
//! through `keyring-core`.

use super::IdentityError;

/// Storage key for the Nostr identity secret bytes.
pub const NOSTR_IDENTITY_KEY: &str = "gnostr.nostr.identity";

/// Secure storage of sensitive key material.
///
/// Implementations must be `Send + Sync`; the identity manager is shared
/// between the presentation layer and the publisher.
pub trait SecureKeyStorage: Send + Sync {
    /// Stores secret bytes under the given key, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn store(&self, key: &str, value: &[u8]) -> Result<(), IdentityError>;

    /// Retrieves secret bytes for the given key.
    ///
    /// Returns `Ok(None)` if nothing is stored under the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, IdentityError>;

    /// Deletes the secret for the given key. Deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    fn delete(&self, key: &str) -> Result<(), IdentityError>;

    /// Checks if a secret exists for the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the check fails.
    fn exists(&self, key: &str) -> Result<bool, IdentityError> {
        Ok(self.retrieve(key)?.is_some())
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod memory {
    use std::collections::HashMap;
    use std::sync::RwLock;

    use super::{IdentityError, SecureKeyStorage};

    /// In-memory storage for tests.
    ///
    /// This implementation is NOT secure and is only compiled with the
    /// `test-utils` feature.
    #[derive(Debug, Default)]
    pub struct MemoryStorage {
        data: RwLock<HashMap<String, Vec<u8>>>,
    }

    impl MemoryStorage {
        /// Creates a new empty storage.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl SecureKeyStorage for MemoryStorage {
        fn store(&self, key: &str, value: &[u8]) -> Result<(), IdentityError> {
            self.data
                .write()
                .map_err(|e| IdentityError::Storage(e.to_string()))?
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, IdentityError> {
            Ok(self
                .data
                .read()
                .map_err(|e| IdentityError::Storage(e.to_string()))?
                .get(key)
                .cloned())
        }

        fn delete(&self, key: &str) -> Result<(), IdentityError> {
            self.data
                .write()
                .map_err(|e| IdentityError::Storage(e.to_string()))?
                .remove(key);
            Ok(())
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryStorage;

#[cfg(feature = "keyring")]
mod host {
    use keyring_core::{Entry, Error as KeyringError};
    use tracing::debug;

    use super::{IdentityError, SecureKeyStorage};

    /// Default keyring service name.
    pub const DEFAULT_SERVICE: &str = "gnostr";

    /// Host credential store backed by `keyring-core`.
    ///
    /// The application must install a platform store with
    /// `keyring_core::set_default_store` before first use.
    #[derive(Debug, Clone)]
    pub struct KeyringStorage {
        service: String,
    }

    impl KeyringStorage {
        /// Creates storage under the given keyring service name.
        #[must_use]
        pub fn new(service: impl Into<String>) -> Self {
            Self {
                service: service.into(),
            }
        }

        fn entry(&self, key: &str) -> Result<Entry, IdentityError> {
            Entry::new(&self.service, key).map_err(|e| IdentityError::Storage(e.to_string()))
        }
    }

    impl Default for KeyringStorage {
        fn default() -> Self {
            Self::new(DEFAULT_SERVICE)
        }
    }

    impl SecureKeyStorage for KeyringStorage {
        fn store(&self, key: &str, value: &[u8]) -> Result<(), IdentityError> {
            self.entry(key)?
                .set_secret(value)
                .map_err(|e| IdentityError::Storage(e.to_string()))?;
            debug!(service = %self.service, key, "stored secret in host keyring");
            Ok(())
        }

        fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, IdentityError> {
            match self.entry(key)?.get_secret() {
                Ok(secret) => Ok(Some(secret)),
                Err(KeyringError::NoEntry) => Ok(None),
                Err(e) => Err(IdentityError::Storage(e.to_string())),
            }
        }

        fn delete(&self, key: &str) -> Result<(), IdentityError> {
            match self.entry(key)?.delete_credential() {
                Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
                Err(e) => Err(IdentityError::Storage(e.to_string())),
            }
        }
    }
}

#[cfg(feature = "keyring")]
pub use host::KeyringStorage;
