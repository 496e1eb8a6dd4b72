//! Shared cryptographic context and key encoding helpers.
//!
//! Creating a `Secp256k1` context is expensive as it precomputes tables for
//! signing and verification, so a single context is shared by the signer and
//! the validator.

use std::sync::LazyLock;

use nostr::secp256k1::{All, Secp256k1};

/// Global secp256k1 context for cryptographic operations.
///
/// # Thread Safety
///
/// The `Secp256k1` context is `Send + Sync` and all operations on it take
/// `&self`, so signing and verification are reentrant and need no lock.
pub static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// Decodes a lowercase or uppercase hex string into a fixed-size array.
///
/// Returns `None` if the string is not valid hex or has the wrong length.
///
/// # Example
///
/// ```
/// use gnostr_core::nostr::decode_hex_array;
///
/// let bytes: Option<[u8; 2]> = decode_hex_array("beef");
/// assert_eq!(bytes, Some([0xbe, 0xef]));
/// assert!(decode_hex_array::<2>("bee").is_none());
/// ```
#[must_use]
pub fn decode_hex_array<const N: usize>(value: &str) -> Option<[u8; N]> {
    if value.len() != N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(value, &mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(decode_hex_array::<32>(&"ab".repeat(31)).is_none());
        assert!(decode_hex_array::<32>(&"ab".repeat(33)).is_none());
    }

    #[test]
    fn decode_rejects_non_hex() {
        assert!(decode_hex_array::<1>("zz").is_none());
    }

    #[test]
    fn decode_accepts_exact_length() {
        let decoded = decode_hex_array::<32>(&"0f".repeat(32)).unwrap();
        assert_eq!(decoded, [0x0f; 32]);
    }

    #[test]
    fn shared_context_is_reusable() {
        use nostr::secp256k1::{rand::rngs::OsRng, Keypair};

        let first = Keypair::new(&SECP, &mut OsRng);
        let second = Keypair::new(&SECP, &mut OsRng);
        assert_ne!(first.secret_bytes(), second.secret_bytes());
    }
}
