//! Error types for Nostr event handling.

use std::fmt;

use thiserror::Error;

use super::identity::IdentityError;

/// Category of a validation failure.
///
/// Checks run in this order and stop at the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationErrorKind {
    /// Required fields missing, wrong types, out-of-range values, or a
    /// timestamp outside the accepted window.
    Malformed,
    /// The declared id is not the digest of the event's canonical form.
    IdMismatch,
    /// The signature does not verify against the id and public key.
    BadSignature,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Malformed => "malformed event",
            Self::IdMismatch => "event id mismatch",
            Self::BadSignature => "bad event signature",
        };
        f.write_str(label)
    }
}

/// An event failed validation and must be discarded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct ValidationError {
    /// Which check failed.
    pub kind: ValidationErrorKind,
    /// Human-readable description for diagnostics.
    pub detail: String,
}

impl ValidationError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: ValidationErrorKind::Malformed,
            detail: detail.into(),
        }
    }

    pub(crate) fn id_mismatch(detail: impl Into<String>) -> Self {
        Self {
            kind: ValidationErrorKind::IdMismatch,
            detail: detail.into(),
        }
    }

    pub(crate) fn bad_signature(detail: impl Into<String>) -> Self {
        Self {
            kind: ValidationErrorKind::BadSignature,
            detail: detail.into(),
        }
    }
}

/// Errors that can occur while building, signing, or encoding events.
#[derive(Error, Debug)]
pub enum NostrError {
    /// The event failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Key custody refused or failed to sign.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid event structure or content.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),
}

/// Result type for Nostr operations.
pub type Result<T> = std::result::Result<T, NostrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display_includes_kind_and_detail() {
        let err = ValidationError::malformed("missing sig");
        assert_eq!(err.to_string(), "malformed event: missing sig");

        let err = ValidationError::id_mismatch("declared abc");
        assert_eq!(err.to_string(), "event id mismatch: declared abc");

        let err = ValidationError::bad_signature("schnorr");
        assert_eq!(err.to_string(), "bad event signature: schnorr");
    }

    #[test]
    fn validation_error_converts_into_nostr_error() {
        let err: NostrError = ValidationError::malformed("x").into();
        assert!(matches!(
            err,
            NostrError::Validation(ValidationError {
                kind: ValidationErrorKind::Malformed,
                ..
            })
        ));
    }

    #[test]
    fn identity_error_is_transparent() {
        let err: NostrError = IdentityError::KeyUnavailable.into();
        assert_eq!(err.to_string(), IdentityError::KeyUnavailable.to_string());
    }

    #[test]
    fn invalid_event_display() {
        let err = NostrError::InvalidEvent("kind out of range".to_string());
        assert_eq!(err.to_string(), "Invalid event: kind out of range");
    }
}
