//! Nostr protocol layer: events, filters, and identity.
//!
//! # Architecture
//!
//! ```text
//! EventDraft ──bind──▶ UnsignedEvent ──Signer──▶ RawEvent ─┐
//!                                                          ├─validate─▶ Event
//!                          relay EVENT frame ──▶ RawEvent ─┘
//! ```
//!
//! Locally authored and relay-delivered events pass through the same
//! validator, so an [`Event`] is always authentic.

mod error;
mod event;
mod filter;
mod keys;
mod tags;

pub mod identity;

pub use error::{NostrError, Result, ValidationError, ValidationErrorKind};
pub use event::{
    compute_id, validate, Event, EventDraft, RawEvent, UnsignedEvent, ValidationPolicy,
    DEFAULT_MAX_FUTURE_DRIFT_SECS, KIND_CONTACTS, KIND_METADATA, KIND_REACTION, KIND_RELAY_LIST,
    KIND_REPOST, KIND_TEXT_NOTE,
};
pub use filter::Filter;
pub use identity::{
    sign_event, IdentityError, IdentityKeypair, IdentityManager, PublicIdentity,
    SecureKeyStorage, Signer,
};
pub use keys::decode_hex_array;
pub use tags::TagBuilder;

#[cfg(test)]
pub(crate) use event::tests as event_fixtures;
