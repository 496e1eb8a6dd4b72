//! User identity and key custody.
//!
//! The identity secret never leaves this module except through
//! [`IdentityManager::export_nsec`], which exists for user-initiated backup.
//! Everything else interacts with the key through the [`Signer`] trait.

mod keypair;
mod manager;
mod signer;
mod storage;

use thiserror::Error;

pub use keypair::IdentityKeypair;
pub use manager::IdentityManager;
pub use signer::{sign_event, Signer};
#[cfg(feature = "keyring")]
pub use storage::KeyringStorage;
#[cfg(any(test, feature = "test-utils"))]
pub use storage::MemoryStorage;
pub use storage::{SecureKeyStorage, NOSTR_IDENTITY_KEY};

/// Errors raised by key custody and signing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// No identity is loaded or stored.
    #[error("No identity key is available")]
    KeyUnavailable,

    /// The signing operation failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// The secret bytes do not form a valid secp256k1 key.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// The nsec string could not be parsed.
    #[error("Invalid nsec: {0}")]
    InvalidNsec(String),

    /// Bech32 encoding failed.
    #[error("Bech32 encoding failed: {0}")]
    Bech32(String),

    /// The secure storage backend failed.
    #[error("Secure storage error: {0}")]
    Storage(String),

    /// The stored secret has the wrong length or format.
    #[error("Stored key is invalid: {0}")]
    InvalidStoredKey(String),
}

/// Public half of the identity, safe to display and share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    /// Public key as 64-character lowercase hex.
    pub pubkey_hex: String,
    /// Public key as NIP-19 `npub1...`.
    pub npub: String,
}
