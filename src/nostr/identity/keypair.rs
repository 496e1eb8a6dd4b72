//! Persistent identity keypair for Nostr operations.
//!
//! [`IdentityKeypair`] is the user's long-lived Nostr identity (nsec/npub).
//! It is owned by the [`IdentityManager`](super::IdentityManager) and never
//! handed to code that only needs signatures.
//!
//! # Security
//!
//! - Secret bytes are automatically zeroized on drop via [`ZeroizeOnDrop`]
//! - Temporary copies are manually zeroized after use
//! - Debug output never includes secret material

use nostr::prelude::{Keys, PublicKey, ToBech32};
use nostr::secp256k1::{Keypair, Message, SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::IdentityError;
use crate::nostr::keys::SECP;

/// A persistent Nostr identity keypair.
///
/// # Example
///
/// ```
/// use gnostr_core::nostr::identity::IdentityKeypair;
///
/// let keypair = IdentityKeypair::generate();
/// assert!(keypair.npub().unwrap().starts_with("npub1"));
///
/// // Backup only; handle with care
/// let nsec = keypair.export_nsec().unwrap();
/// let restored = IdentityKeypair::from_nsec(&nsec).unwrap();
/// assert_eq!(restored.pubkey_hex(), keypair.pubkey_hex());
/// ```
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeypair {
    secret_bytes: [u8; 32],

    #[zeroize(skip)]
    pubkey_bytes: [u8; 32],
}

impl IdentityKeypair {
    /// Generates a new random identity using the OS random number generator.
    #[must_use]
    pub fn generate() -> Self {
        let keys = Keys::generate();
        Self {
            secret_bytes: keys.secret_key().secret_bytes(),
            pubkey_bytes: keys.public_key().to_bytes(),
        }
    }

    /// Rebuilds a keypair from raw secret bytes, e.g. as read from secure storage.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyDerivation`] if the bytes are zero or not
    /// below the curve order.
    pub fn from_secret_bytes(secret_bytes: [u8; 32]) -> Result<Self, IdentityError> {
        let secret_key = SecretKey::from_slice(&secret_bytes)
            .map_err(|e| IdentityError::KeyDerivation(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&SECP, &secret_key);
        let (public_key, _parity) = keypair.x_only_public_key();

        Ok(Self {
            secret_bytes,
            pubkey_bytes: public_key.serialize(),
        })
    }

    /// Imports an identity from a NIP-19 `nsec1...` string.
    ///
    /// Hex-encoded secrets are accepted as well.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidNsec`] if the string cannot be parsed.
    pub fn from_nsec(nsec: &str) -> Result<Self, IdentityError> {
        let keys =
            Keys::parse(nsec.trim()).map_err(|e| IdentityError::InvalidNsec(e.to_string()))?;
        Ok(Self {
            secret_bytes: keys.secret_key().secret_bytes(),
            pubkey_bytes: keys.public_key().to_bytes(),
        })
    }

    /// Exports the secret key as `nsec1...`.
    ///
    /// This exposes the secret key. Only use for user-initiated backup.
    ///
    /// # Errors
    ///
    /// Returns an error if bech32 encoding fails.
    pub fn export_nsec(&self) -> Result<String, IdentityError> {
        let mut secret_copy = self.secret_bytes;

        let result = nostr::SecretKey::from_slice(&secret_copy)
            .map_err(|e| IdentityError::KeyDerivation(e.to_string()))
            .and_then(|secret_key| {
                secret_key
                    .to_bech32()
                    .map_err(|e| IdentityError::Bech32(e.to_string()))
            });

        secret_copy.zeroize();
        result
    }

    /// Public key as 64-character lowercase hex.
    #[must_use]
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.pubkey_bytes)
    }

    /// Public key as `npub1...`.
    ///
    /// # Errors
    ///
    /// Returns an error if bech32 encoding fails.
    pub fn npub(&self) -> Result<String, IdentityError> {
        PublicKey::from_slice(&self.pubkey_bytes)
            .map_err(|e| IdentityError::KeyDerivation(e.to_string()))?
            .to_bech32()
            .map_err(|e| IdentityError::Bech32(e.to_string()))
    }

    /// Raw x-only public key.
    #[must_use]
    pub const fn pubkey_bytes(&self) -> [u8; 32] {
        self.pubkey_bytes
    }

    /// Produces a BIP-340 Schnorr signature over a 32-byte digest.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Signing`] if the secret cannot be loaded into
    /// a signing key.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<[u8; 64], IdentityError> {
        let mut secret_copy = self.secret_bytes;

        let result = SecretKey::from_slice(&secret_copy)
            .map_err(|e| IdentityError::Signing(e.to_string()))
            .map(|secret_key| {
                let keypair = Keypair::from_secret_key(&SECP, &secret_key);
                SECP.sign_schnorr(&Message::from_digest(*digest), &keypair)
                    .serialize()
            });

        secret_copy.zeroize();
        result
    }

    /// Secret bytes for persisting to secure storage.
    #[must_use]
    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret_bytes)
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret key
        f.debug_struct("IdentityKeypair")
            .field("pubkey", &self.pubkey_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::secp256k1::{schnorr::Signature, XOnlyPublicKey};

    fn verifies(pubkey: [u8; 32], digest: [u8; 32], sig: &[u8; 64]) -> bool {
        let signature = Signature::from_slice(sig).unwrap();
        let pubkey = XOnlyPublicKey::from_slice(&pubkey).unwrap();
        SECP.verify_schnorr(&signature, &Message::from_digest(digest), &pubkey)
            .is_ok()
    }

    #[test]
    fn zero_and_curve_order_secrets_are_rejected() {
        assert!(IdentityKeypair::from_secret_bytes([0u8; 32]).is_err());

        let order = crate::nostr::decode_hex_array::<32>(
            "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141",
        )
        .unwrap();
        assert!(matches!(
            IdentityKeypair::from_secret_bytes(order),
            Err(IdentityError::KeyDerivation(_))
        ));
    }

    #[test]
    fn secret_bytes_rebuild_same_identity() {
        let original = IdentityKeypair::generate();
        let rebuilt = IdentityKeypair::from_secret_bytes(*original.secret_bytes()).unwrap();
        assert_eq!(original.pubkey_bytes(), rebuilt.pubkey_bytes());
    }

    #[test]
    fn from_nsec_accepts_surrounding_whitespace() {
        let keypair = IdentityKeypair::generate();
        let nsec = format!("  {}\n", keypair.export_nsec().unwrap());
        let imported = IdentityKeypair::from_nsec(&nsec).unwrap();
        assert_eq!(imported.pubkey_hex(), keypair.pubkey_hex());
    }

    #[test]
    fn from_nsec_rejects_garbage() {
        for input in ["", "nsec1invalid", "npub1xyz", "not a key"] {
            assert!(
                matches!(
                    IdentityKeypair::from_nsec(input),
                    Err(IdentityError::InvalidNsec(_))
                ),
                "accepted {input:?}"
            );
        }
    }

    #[test]
    fn signature_verifies_only_for_signed_digest_and_key() {
        let signer = IdentityKeypair::generate();
        let other = IdentityKeypair::generate();
        let digest = [0x42u8; 32];
        let sig = signer.sign(&digest).unwrap();

        assert!(verifies(signer.pubkey_bytes(), digest, &sig));
        assert!(!verifies(other.pubkey_bytes(), digest, &sig));
        assert!(!verifies(signer.pubkey_bytes(), [0x43u8; 32], &sig));
    }

    #[test]
    fn debug_shows_pubkey_only() {
        let keypair = IdentityKeypair::generate();
        let debug = format!("{keypair:?}");
        let nsec = keypair.export_nsec().unwrap();

        assert!(debug.contains(&keypair.pubkey_hex()));
        assert!(!debug.contains(&hex::encode(*keypair.secret_bytes())));
        assert!(!debug.contains(&nsec));
    }

    #[test]
    fn implements_zeroize_on_drop() {
        fn assert_zeroize_on_drop<T: ZeroizeOnDrop>() {}
        assert_zeroize_on_drop::<IdentityKeypair>();
    }
}
