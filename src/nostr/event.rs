//! Nostr event model and validation.
//!
//! This module defines the three shapes an event takes in the client:
//! - [`RawEvent`]: untrusted wire form, exactly as received from a relay
//! - [`EventDraft`] / [`UnsignedEvent`]: locally authored content awaiting a signature
//! - [`Event`]: an immutable, validated event
//!
//! The only way to obtain an [`Event`] is through [`validate`], so every
//! event held by the store or handed to the presentation layer has a
//! verified id and signature.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use nostr::secp256k1::{schnorr::Signature, Message, XOnlyPublicKey};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::nostr::error::{NostrError, Result, ValidationError};
use crate::nostr::keys::{decode_hex_array, SECP};

/// User metadata (NIP-01).
pub const KIND_METADATA: u16 = 0;

/// Short text note (NIP-01).
pub const KIND_TEXT_NOTE: u16 = 1;

/// Follow list (NIP-02). Legacy clients also put a relay map in its content.
pub const KIND_CONTACTS: u16 = 3;

/// Repost (NIP-18).
pub const KIND_REPOST: u16 = 6;

/// Reaction (NIP-25).
pub const KIND_REACTION: u16 = 7;

/// Relay list metadata (NIP-65).
pub const KIND_RELAY_LIST: u16 = 10002;

/// Default tolerance for timestamps ahead of the local clock (15 minutes).
pub const DEFAULT_MAX_FUTURE_DRIFT_SECS: i64 = 15 * 60;

/// An event exactly as it appears on the wire.
///
/// No field has been checked. Pass it to [`validate`] before use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawEvent {
    /// Declared event id (hex).
    pub id: String,

    /// Author public key (hex, x-only).
    pub pubkey: String,

    /// Unix timestamp claimed by the author.
    pub created_at: i64,

    /// Event kind. Wider than `u16` so out-of-range kinds can be rejected
    /// as malformed instead of failing to parse.
    pub kind: u64,

    /// Tag list.
    pub tags: Vec<Vec<String>>,

    /// Opaque content.
    pub content: String,

    /// Schnorr signature over the id (hex).
    pub sig: String,
}

impl RawEvent {
    /// Parses the event object carried by an `EVENT` frame.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` validation error if required fields are missing
    /// or have the wrong JSON type.
    pub fn from_value(value: Value) -> std::result::Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::malformed(e.to_string()))
    }

    /// Parses a raw event from JSON text.
    ///
    /// # Errors
    ///
    /// Returns a `Malformed` validation error if the JSON is not an event object.
    pub fn from_json(json: &str) -> std::result::Result<Self, ValidationError> {
        serde_json::from_str(json).map_err(|e| ValidationError::malformed(e.to_string()))
    }
}

/// Clock and tolerance inputs for [`validate`].
///
/// The current time is an explicit field so validation stays a pure
/// function of its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Reference "now" as a Unix timestamp.
    pub now: i64,

    /// Maximum seconds `created_at` may be ahead of `now`. `None` disables the check.
    pub max_future_drift: Option<i64>,

    /// Maximum seconds `created_at` may be behind `now`. `None` disables the check.
    pub max_past_drift: Option<i64>,
}

impl ValidationPolicy {
    /// Default tolerances evaluated at the given time.
    #[must_use]
    pub const fn at(now: i64) -> Self {
        Self {
            now,
            max_future_drift: Some(DEFAULT_MAX_FUTURE_DRIFT_SECS),
            max_past_drift: None,
        }
    }

    /// Default tolerances evaluated at the current wall-clock time.
    #[must_use]
    pub fn current() -> Self {
        Self::at(Utc::now().timestamp())
    }

    /// No timestamp bounds. Used when re-validating archived events.
    #[must_use]
    pub const fn permissive() -> Self {
        Self {
            now: 0,
            max_future_drift: None,
            max_past_drift: None,
        }
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::current()
    }
}

#[derive(PartialEq, Eq)]
struct EventData {
    id: [u8; 32],
    pubkey: [u8; 32],
    created_at: i64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    sig: [u8; 64],
}

/// An immutable, validated Nostr event.
///
/// Cloning is cheap: the fields live behind an `Arc` so the store and any
/// number of live subscribers can share one allocation.
///
/// # Structure
///
/// ```json
/// {
///   "id": "...",           // SHA256 of the canonical serialization
///   "pubkey": "...",       // Author x-only public key
///   "created_at": 123456,  // Unix timestamp
///   "kind": 1,
///   "tags": [["e", "..."], ["p", "..."]],
///   "content": "...",
///   "sig": "..."           // Schnorr signature over id
/// }
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Event {
    inner: Arc<EventData>,
}

impl Event {
    /// Raw 32-byte event id.
    #[must_use]
    pub fn id(&self) -> &[u8; 32] {
        &self.inner.id
    }

    /// Event id as lowercase hex.
    #[must_use]
    pub fn id_hex(&self) -> String {
        hex::encode(self.inner.id)
    }

    /// Raw 32-byte author public key.
    #[must_use]
    pub fn pubkey(&self) -> &[u8; 32] {
        &self.inner.pubkey
    }

    /// Author public key as lowercase hex.
    #[must_use]
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.inner.pubkey)
    }

    /// Author-supplied creation time. Not authoritative.
    #[must_use]
    pub fn created_at(&self) -> i64 {
        self.inner.created_at
    }

    /// Event kind.
    #[must_use]
    pub fn kind(&self) -> u16 {
        self.inner.kind
    }

    /// Ordered tag list.
    #[must_use]
    pub fn tags(&self) -> &[Vec<String>] {
        &self.inner.tags
    }

    /// Event content.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.inner.content
    }

    /// Raw 64-byte signature.
    #[must_use]
    pub fn sig(&self) -> &[u8; 64] {
        &self.inner.sig
    }

    /// Values (second element) of every tag with the given name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Value of the first tag with the given name.
    #[must_use]
    pub fn first_tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }

    /// Converts back to the wire representation.
    #[must_use]
    pub fn to_raw(&self) -> RawEvent {
        RawEvent {
            id: self.id_hex(),
            pubkey: self.pubkey_hex(),
            created_at: self.inner.created_at,
            kind: u64::from(self.inner.kind),
            tags: self.inner.tags.clone(),
            content: self.inner.content.clone(),
            sig: hex::encode(self.inner.sig),
        }
    }

    /// Serializes this event to JSON for transmission.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.to_raw()).map_err(NostrError::from)
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_raw().serialize(serializer)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id_hex())
            .field("pubkey", &self.pubkey_hex())
            .field("created_at", &self.inner.created_at)
            .field("kind", &self.inner.kind)
            .field("tags", &self.inner.tags.len())
            .finish_non_exhaustive()
    }
}

/// Computes the event id per NIP-01.
///
/// The id is the SHA256 hash of the serialized array
/// `[0, pubkey, created_at, kind, tags, content]`. `serde_json` emits the
/// escaping NIP-01 prescribes, so its output is the canonical form.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn compute_id(
    pubkey_hex: &str,
    created_at: i64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> std::result::Result<[u8; 32], serde_json::Error> {
    let serialized = serde_json::to_string(&(0, pubkey_hex, created_at, kind, tags, content))?;
    Ok(Sha256::digest(serialized.as_bytes()).into())
}

struct CheckedFields {
    id: [u8; 32],
    pubkey: [u8; 32],
    xonly: XOnlyPublicKey,
    kind: u16,
    sig: [u8; 64],
}

fn is_lower_hex(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn check_structure(
    raw: &RawEvent,
    policy: &ValidationPolicy,
) -> std::result::Result<CheckedFields, ValidationError> {
    if !is_lower_hex(&raw.id) || !is_lower_hex(&raw.pubkey) || !is_lower_hex(&raw.sig) {
        return Err(ValidationError::malformed(
            "id, pubkey and sig must be lowercase hex",
        ));
    }

    let id = decode_hex_array::<32>(&raw.id)
        .ok_or_else(|| ValidationError::malformed("id must be 32 bytes"))?;
    let pubkey = decode_hex_array::<32>(&raw.pubkey)
        .ok_or_else(|| ValidationError::malformed("pubkey must be 32 bytes"))?;
    let sig = decode_hex_array::<64>(&raw.sig)
        .ok_or_else(|| ValidationError::malformed("sig must be 64 bytes"))?;

    let kind = u16::try_from(raw.kind)
        .map_err(|_| ValidationError::malformed(format!("kind {} out of range", raw.kind)))?;

    if raw.tags.iter().any(Vec::is_empty) {
        return Err(ValidationError::malformed("empty tag"));
    }

    if raw.created_at < 0 {
        return Err(ValidationError::malformed("negative created_at"));
    }
    if let Some(max_future) = policy.max_future_drift {
        if raw.created_at > policy.now.saturating_add(max_future) {
            return Err(ValidationError::malformed(format!(
                "created_at {} is too far in the future",
                raw.created_at
            )));
        }
    }
    if let Some(max_past) = policy.max_past_drift {
        if raw.created_at < policy.now.saturating_sub(max_past) {
            return Err(ValidationError::malformed(format!(
                "created_at {} is too far in the past",
                raw.created_at
            )));
        }
    }

    let xonly = XOnlyPublicKey::from_slice(&pubkey)
        .map_err(|e| ValidationError::malformed(format!("invalid pubkey: {e}")))?;

    Ok(CheckedFields {
        id,
        pubkey,
        xonly,
        kind,
        sig,
    })
}

/// Validates an untrusted event.
///
/// Checks run in order and stop at the first failure:
/// 1. structure (hex lengths, kind range, non-empty tags, timestamp window)
/// 2. id recomputation, compared in constant time
/// 3. Schnorr signature over the id
///
/// Identical inputs always produce identical outputs; nothing is read from
/// the network, storage, or the system clock.
///
/// # Errors
///
/// Returns a [`ValidationError`] whose kind names the failed check.
pub fn validate(
    raw: &RawEvent,
    policy: &ValidationPolicy,
) -> std::result::Result<Event, ValidationError> {
    let fields = check_structure(raw, policy)?;

    let computed = compute_id(
        &raw.pubkey,
        raw.created_at,
        fields.kind,
        &raw.tags,
        &raw.content,
    )
    .map_err(|e| ValidationError::malformed(format!("cannot serialize event: {e}")))?;

    if !bool::from(computed.ct_eq(&fields.id)) {
        return Err(ValidationError::id_mismatch(format!(
            "declared {}, computed {}",
            raw.id,
            hex::encode(computed)
        )));
    }

    let signature = Signature::from_slice(&fields.sig)
        .map_err(|e| ValidationError::bad_signature(e.to_string()))?;
    let message = Message::from_digest(fields.id);
    SECP.verify_schnorr(&signature, &message, &fields.xonly)
        .map_err(|e| ValidationError::bad_signature(e.to_string()))?;

    Ok(Event {
        inner: Arc::new(EventData {
            id: fields.id,
            pubkey: fields.pubkey,
            created_at: raw.created_at,
            kind: fields.kind,
            tags: raw.tags.clone(),
            content: raw.content.clone(),
            sig: fields.sig,
        }),
    })
}

/// Locally authored event content, not yet bound to an author.
///
/// # Example
///
/// ```
/// use gnostr_core::nostr::{EventDraft, TagBuilder, KIND_TEXT_NOTE};
///
/// let draft = EventDraft::text_note("hello nostr")
///     .tag(TagBuilder::t_tag("intro"));
/// assert_eq!(draft.kind, KIND_TEXT_NOTE);
/// assert_eq!(draft.tags.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventDraft {
    /// Event kind.
    pub kind: u16,

    /// Tag list.
    pub tags: Vec<Vec<String>>,

    /// Content.
    pub content: String,

    /// Fixed creation time. `None` means "when signed".
    pub created_at: Option<i64>,
}

impl EventDraft {
    /// Creates a draft of the given kind.
    #[must_use]
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: content.into(),
            created_at: None,
        }
    }

    /// Creates a kind 1 text note draft.
    #[must_use]
    pub fn text_note(content: impl Into<String>) -> Self {
        Self::new(KIND_TEXT_NOTE, content)
    }

    /// Appends a tag.
    #[must_use]
    pub fn tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }

    /// Appends several tags.
    #[must_use]
    pub fn tags(mut self, tags: impl IntoIterator<Item = Vec<String>>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Pins the creation time instead of using the signing time.
    #[must_use]
    pub const fn created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Binds the draft to an author and computes its id.
    ///
    /// `now` is used when the draft has no fixed creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the draft cannot be serialized or has an empty tag.
    pub fn bind(&self, pubkey: [u8; 32], now: i64) -> Result<UnsignedEvent> {
        if self.tags.iter().any(Vec::is_empty) {
            return Err(NostrError::InvalidEvent("empty tag".to_string()));
        }
        let created_at = self.created_at.unwrap_or(now);
        let pubkey_hex = hex::encode(pubkey);
        let id = compute_id(&pubkey_hex, created_at, self.kind, &self.tags, &self.content)?;

        Ok(UnsignedEvent {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        })
    }
}

/// A draft bound to an author, with its id computed, awaiting a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    id: [u8; 32],
    pubkey: [u8; 32],
    created_at: i64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
}

impl UnsignedEvent {
    /// The id the signature must cover.
    #[must_use]
    pub const fn id(&self) -> &[u8; 32] {
        &self.id
    }

    /// The author public key the draft was bound to.
    #[must_use]
    pub const fn pubkey(&self) -> &[u8; 32] {
        &self.pubkey
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Attaches a signature, producing the wire form.
    ///
    /// The result still has to pass [`validate`] to become an [`Event`].
    #[must_use]
    pub fn into_raw(self, sig: &[u8; 64]) -> RawEvent {
        RawEvent {
            id: hex::encode(self.id),
            pubkey: hex::encode(self.pubkey),
            created_at: self.created_at,
            kind: u64::from(self.kind),
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig),
        }
    }
}
