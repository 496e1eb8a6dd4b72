//! Identity lifecycle and key custody.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};
use zeroize::Zeroizing;

use super::signer::Signer;
use super::storage::{SecureKeyStorage, NOSTR_IDENTITY_KEY};
use super::{IdentityError, IdentityKeypair, PublicIdentity};
use crate::nostr::event::UnsignedEvent;

/// Owns the user's identity keypair and its persistence.
///
/// The keypair lives only inside this manager. Callers get signatures
/// through the [`Signer`] impl and public information through
/// [`Self::public_identity`]. Signing takes a shared lock, so any number of
/// signatures may be produced concurrently.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use gnostr_core::nostr::identity::{IdentityManager, MemoryStorage, Signer};
///
/// let manager = IdentityManager::new(Arc::new(MemoryStorage::new()));
/// assert!(manager.public_key().is_err());
///
/// let identity = manager.generate().unwrap();
/// assert!(identity.npub.starts_with("npub1"));
/// assert!(manager.has_identity());
/// ```
pub struct IdentityManager {
    storage: Arc<dyn SecureKeyStorage>,
    keypair: RwLock<Option<IdentityKeypair>>,
}

impl IdentityManager {
    /// Creates a manager with no identity loaded.
    #[must_use]
    pub fn new(storage: Arc<dyn SecureKeyStorage>) -> Self {
        Self {
            storage,
            keypair: RwLock::new(None),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Option<IdentityKeypair>>, IdentityError> {
        self.keypair
            .read()
            .map_err(|e| IdentityError::Storage(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Option<IdentityKeypair>>, IdentityError> {
        self.keypair
            .write()
            .map_err(|e| IdentityError::Storage(e.to_string()))
    }

    fn install(&self, keypair: IdentityKeypair) -> Result<PublicIdentity, IdentityError> {
        self.storage
            .store(NOSTR_IDENTITY_KEY, keypair.secret_bytes().as_slice())?;
        let identity = public_of(&keypair)?;
        *self.write()? = Some(keypair);
        info!(pubkey = %identity.pubkey_hex, "identity installed");
        Ok(identity)
    }

    /// Loads the stored identity into memory.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyUnavailable`] if nothing is stored, or
    /// [`IdentityError::InvalidStoredKey`] if the stored bytes are unusable.
    pub fn load(&self) -> Result<PublicIdentity, IdentityError> {
        let stored = self
            .storage
            .retrieve(NOSTR_IDENTITY_KEY)?
            .map(Zeroizing::new)
            .ok_or(IdentityError::KeyUnavailable)?;

        let bytes: Zeroizing<[u8; 32]> = Zeroizing::new(
            stored.as_slice().try_into().map_err(|_| {
                IdentityError::InvalidStoredKey(format!("expected 32 bytes, got {}", stored.len()))
            })?,
        );
        let keypair = IdentityKeypair::from_secret_bytes(*bytes)
            .map_err(|e| IdentityError::InvalidStoredKey(e.to_string()))?;

        let identity = public_of(&keypair)?;
        *self.write()? = Some(keypair);
        debug!(pubkey = %identity.pubkey_hex, "identity loaded from storage");
        Ok(identity)
    }

    /// Loads the stored identity, generating and storing a new one if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or the stored key is invalid.
    pub fn load_or_generate(&self) -> Result<PublicIdentity, IdentityError> {
        match self.load() {
            Err(IdentityError::KeyUnavailable) => self.generate(),
            other => other,
        }
    }

    /// Generates a fresh identity, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the new secret cannot be stored.
    pub fn generate(&self) -> Result<PublicIdentity, IdentityError> {
        self.install(IdentityKeypair::generate())
    }

    /// Imports an identity from an `nsec1...` string, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidNsec`] if the string cannot be parsed,
    /// or a storage error if it cannot be persisted.
    pub fn import_nsec(&self, nsec: &str) -> Result<PublicIdentity, IdentityError> {
        self.install(IdentityKeypair::from_nsec(nsec)?)
    }

    /// Exports the loaded secret as `nsec1...` for user-initiated backup.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyUnavailable`] if no identity is loaded.
    pub fn export_nsec(&self) -> Result<String, IdentityError> {
        self.read()?
            .as_ref()
            .ok_or(IdentityError::KeyUnavailable)?
            .export_nsec()
    }

    /// Removes the identity from memory and from secure storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn delete(&self) -> Result<(), IdentityError> {
        self.storage.delete(NOSTR_IDENTITY_KEY)?;
        self.clear()?;
        info!("identity deleted");
        Ok(())
    }

    /// Drops the in-memory keypair, keeping the stored secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear(&self) -> Result<(), IdentityError> {
        *self.write()? = None;
        Ok(())
    }

    /// Returns `true` if an identity is loaded.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        self.read().is_ok_and(|guard| guard.is_some())
    }

    /// Returns `true` if an identity is persisted, loaded or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn has_stored_identity(&self) -> Result<bool, IdentityError> {
        self.storage.exists(NOSTR_IDENTITY_KEY)
    }

    /// Public key and npub of the loaded identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyUnavailable`] if no identity is loaded.
    pub fn public_identity(&self) -> Result<PublicIdentity, IdentityError> {
        public_of(self.read()?.as_ref().ok_or(IdentityError::KeyUnavailable)?)
    }
}

fn public_of(keypair: &IdentityKeypair) -> Result<PublicIdentity, IdentityError> {
    Ok(PublicIdentity {
        pubkey_hex: keypair.pubkey_hex(),
        npub: keypair.npub()?,
    })
}

impl Signer for IdentityManager {
    fn public_key(&self) -> Result<[u8; 32], IdentityError> {
        self.read()?
            .as_ref()
            .map(IdentityKeypair::pubkey_bytes)
            .ok_or(IdentityError::KeyUnavailable)
    }

    fn sign(&self, event: &UnsignedEvent) -> Result<[u8; 64], IdentityError> {
        let guard = self.read()?;
        let keypair = guard.as_ref().ok_or(IdentityError::KeyUnavailable)?;
        Signer::sign(keypair, event)
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("loaded", &self.has_identity())
            .finish_non_exhaustive()
    }
}
