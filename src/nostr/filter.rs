//! Subscription filters (NIP-01).
//!
//! A [`Filter`] is sent to relays inside `REQ` frames and is also evaluated
//! locally by the event store. Within one filter all present conditions must
//! hold; a list of filters matches if any one of them does.

use std::collections::{BTreeMap, BTreeSet};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use super::event::Event;

/// A NIP-01 filter.
///
/// Empty sets mean "no constraint". Set-backed fields keep the JSON form
/// stable so the same filter always serializes identically.
///
/// # Example
///
/// ```
/// use gnostr_core::nostr::{Filter, KIND_TEXT_NOTE};
///
/// let filter = Filter::new()
///     .kind(KIND_TEXT_NOTE)
///     .author("ab".repeat(32))
///     .limit(20);
///
/// let json = filter.to_value();
/// assert_eq!(json["kinds"], serde_json::json!([1]));
/// assert_eq!(json["limit"], 20);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Event ids (hex).
    pub ids: BTreeSet<String>,
    /// Author public keys (hex).
    pub authors: BTreeSet<String>,
    /// Event kinds.
    pub kinds: BTreeSet<u16>,
    /// Single-letter tag conditions, serialized as `#<letter>`.
    pub tags: BTreeMap<char, BTreeSet<String>>,
    /// Lower bound on `created_at`, inclusive.
    pub since: Option<i64>,
    /// Upper bound on `created_at`, inclusive.
    pub until: Option<i64>,
    /// Maximum number of stored events a relay should return.
    pub limit: Option<usize>,
}

impl Filter {
    /// Creates an empty filter that matches every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.insert(id.into());
        self
    }

    /// Adds several event ids.
    #[must_use]
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Adds an author.
    #[must_use]
    pub fn author(mut self, pubkey_hex: impl Into<String>) -> Self {
        self.authors.insert(pubkey_hex.into());
        self
    }

    /// Adds several authors.
    #[must_use]
    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors.extend(authors.into_iter().map(Into::into));
        self
    }

    /// Adds a kind.
    #[must_use]
    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.insert(kind);
        self
    }

    /// Adds several kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    /// Adds a value to a single-letter tag condition.
    #[must_use]
    pub fn custom_tag(mut self, name: char, value: impl Into<String>) -> Self {
        self.tags.entry(name).or_default().insert(value.into());
        self
    }

    /// Requires an `e` tag referencing the given event.
    #[must_use]
    pub fn event_ref(self, event_id: impl Into<String>) -> Self {
        self.custom_tag('e', event_id)
    }

    /// Requires a `p` tag referencing the given public key.
    #[must_use]
    pub fn pubkey_ref(self, pubkey_hex: impl Into<String>) -> Self {
        self.custom_tag('p', pubkey_hex)
    }

    /// Sets the inclusive lower time bound.
    #[must_use]
    pub const fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the inclusive upper time bound.
    #[must_use]
    pub const fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    /// Sets the result limit.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if the event satisfies every condition of this filter.
    ///
    /// `limit` is not a per-event condition and is ignored here.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id_hex()) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey_hex()) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind()) {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at() < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at() > until) {
            return false;
        }

        self.tags.iter().all(|(name, values)| {
            let mut buf = [0u8; 4];
            let name = name.encode_utf8(&mut buf);
            let found = event.tag_values(name).any(|value| values.contains(value));
            found
        })
    }

    /// Returns `true` if any filter in the list matches.
    #[must_use]
    pub fn matches_any(filters: &[Self], event: &Event) -> bool {
        filters.iter().any(|filter| filter.matches(event))
    }

    /// Encodes the filter as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if !self.ids.is_empty() {
            map.serialize_entry("ids", &self.ids)?;
        }
        if !self.authors.is_empty() {
            map.serialize_entry("authors", &self.authors)?;
        }
        if !self.kinds.is_empty() {
            map.serialize_entry("kinds", &self.kinds)?;
        }
        for (name, values) in &self.tags {
            map.serialize_entry(&format!("#{name}"), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::event::tests::{signed_event, NOW};
    use crate::nostr::event::{EventDraft, KIND_REACTION, KIND_TEXT_NOTE};
    use crate::nostr::identity::IdentityKeypair;
    use serde_json::json;

    #[test]
    fn empty_filter_serializes_to_empty_object() {
        assert_eq!(Filter::new().to_value(), json!({}));
    }

    #[test]
    fn tag_conditions_serialize_with_hash_prefix() {
        let filter = Filter::new()
            .kinds([KIND_TEXT_NOTE, KIND_REACTION])
            .event_ref("root")
            .since(10)
            .until(20);

        assert_eq!(
            filter.to_value(),
            json!({"kinds": [1, 7], "#e": ["root"], "since": 10, "until": 20})
        );
    }

    #[test]
    fn empty_filter_matches_everything() {
        let keypair = IdentityKeypair::generate();
        let event = signed_event(&keypair, &EventDraft::text_note("x"));
        assert!(Filter::new().matches(&event));
    }

    #[test]
    fn author_and_kind_conditions() {
        let keypair = IdentityKeypair::generate();
        let event = signed_event(&keypair, &EventDraft::text_note("x"));

        assert!(Filter::new()
            .author(keypair.pubkey_hex())
            .kind(KIND_TEXT_NOTE)
            .matches(&event));
        assert!(!Filter::new().author("00".repeat(32)).matches(&event));
        assert!(!Filter::new().kind(KIND_REACTION).matches(&event));
    }

    #[test]
    fn time_bounds_are_inclusive() {
        let keypair = IdentityKeypair::generate();
        let event = signed_event(&keypair, &EventDraft::text_note("x"));

        assert!(Filter::new().since(NOW).until(NOW).matches(&event));
        assert!(!Filter::new().since(NOW + 1).matches(&event));
        assert!(!Filter::new().until(NOW - 1).matches(&event));
    }

    #[test]
    fn tag_condition_requires_matching_value() {
        let keypair = IdentityKeypair::generate();
        let draft = EventDraft::new(KIND_REACTION, "+").tag(vec!["e".into(), "target".into()]);
        let event = signed_event(&keypair, &draft);

        assert!(Filter::new().event_ref("target").matches(&event));
        assert!(!Filter::new().event_ref("other").matches(&event));
        assert!(!Filter::new().pubkey_ref("target").matches(&event));
    }

    #[test]
    fn ids_condition_uses_hex_id() {
        let keypair = IdentityKeypair::generate();
        let event = signed_event(&keypair, &EventDraft::text_note("x"));

        assert!(Filter::new().id(event.id_hex()).matches(&event));
        assert!(!Filter::new().id("ff".repeat(32)).matches(&event));
    }

    #[test]
    fn matches_any_is_disjunction() {
        let keypair = IdentityKeypair::generate();
        let event = signed_event(&keypair, &EventDraft::text_note("x"));
        let filters = [Filter::new().kind(KIND_REACTION), Filter::new().kind(KIND_TEXT_NOTE)];

        assert!(Filter::matches_any(&filters, &event));
        assert!(!Filter::matches_any(&filters[..1], &event));
        assert!(!Filter::matches_any(&[], &event));
    }
}
