//! Signing capability.

use super::{IdentityError, IdentityKeypair};
use crate::nostr::error::Result;
use crate::nostr::event::{validate, Event, EventDraft, UnsignedEvent, ValidationPolicy};

/// Something that can sign events for one identity without revealing the key.
///
/// Signing must be reentrant: concurrent calls on the same signer are allowed.
pub trait Signer: Send + Sync {
    /// The x-only public key events are signed with.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyUnavailable`] if no identity is loaded.
    fn public_key(&self) -> std::result::Result<[u8; 32], IdentityError>;

    /// Signs the event id.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyUnavailable`] if no identity is loaded, or
    /// [`IdentityError::Signing`] if the event is bound to another key.
    fn sign(&self, event: &UnsignedEvent) -> std::result::Result<[u8; 64], IdentityError>;
}

impl Signer for IdentityKeypair {
    fn public_key(&self) -> std::result::Result<[u8; 32], IdentityError> {
        Ok(self.pubkey_bytes())
    }

    fn sign(&self, event: &UnsignedEvent) -> std::result::Result<[u8; 64], IdentityError> {
        if *event.pubkey() != self.pubkey_bytes() {
            return Err(IdentityError::Signing(
                "event is bound to a different public key".to_string(),
            ));
        }
        Self::sign(self, event.id())
    }
}

/// Binds, signs and validates a draft.
///
/// `policy.now` becomes the creation time unless the draft pins one. The
/// signed result goes through the same validator as inbound events, so a
/// faulty signer can never produce an event the store would reject.
///
/// # Errors
///
/// Returns an identity error if the signer refuses, or a validation error if
/// the signed event does not verify.
pub fn sign_event(
    signer: &dyn Signer,
    draft: &EventDraft,
    policy: &ValidationPolicy,
) -> Result<Event> {
    let pubkey = signer.public_key()?;
    let unsigned = draft.bind(pubkey, policy.now)?;
    let sig = signer.sign(&unsigned)?;
    Ok(validate(&unsigned.into_raw(&sig), policy)?)
}
