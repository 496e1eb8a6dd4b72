//! Social graph state derived from accepted events.
//!
//! Profiles (kind 0), follow lists (kind 3), relay lists (kind 10002, or the
//! legacy kind 3 content) and engagement counters for referenced notes.
//! Everything here is recomputed from events; nothing is authoritative.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::nostr::{
    Event, KIND_CONTACTS, KIND_METADATA, KIND_REACTION, KIND_RELAY_LIST, KIND_REPOST,
    KIND_TEXT_NOTE,
};
use crate::relay::RelayUrl;

/// Display metadata published by a user (kind 0).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Short handle.
    #[serde(default)]
    pub name: String,
    /// Preferred display name.
    #[serde(default)]
    pub display_name: String,
    /// Free-form bio.
    #[serde(default)]
    pub about: String,
    /// Avatar URL.
    #[serde(default)]
    pub picture: String,
    /// `created_at` of the event this profile came from.
    #[serde(skip)]
    pub updated_at: i64,
}

impl Profile {
    /// Parses a metadata event. Unknown fields are ignored.
    ///
    /// Returns `None` for other kinds or content that is not a JSON object.
    #[must_use]
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind() != KIND_METADATA {
            return None;
        }
        let value: Value = serde_json::from_str(event.content()).ok()?;
        let object = value.as_object()?;
        let field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Some(Self {
            name: field("name"),
            display_name: field("display_name"),
            about: field("about"),
            picture: field("picture"),
            updated_at: event.created_at(),
        })
    }

    /// The best name to show: display name, then name.
    #[must_use]
    pub fn best_name(&self) -> Option<&str> {
        [self.display_name.as_str(), self.name.as_str()]
            .into_iter()
            .find(|name| !name.is_empty())
    }
}

/// Pubkeys followed in a contact list (kind 3 `p` tags), in tag order,
/// without duplicates.
#[must_use]
pub fn followed_pubkeys(event: &Event) -> Vec<String> {
    let mut seen = BTreeSet::new();
    event
        .tag_values("p")
        .filter(|pubkey| seen.insert(*pubkey))
        .map(str::to_string)
        .collect()
}

/// Relays advertised by an event.
///
/// Kind 10002 lists them as `r` tags. Older clients put a JSON object keyed
/// by relay URL in kind 3 content. Entries that are not websocket URLs are
/// skipped.
#[must_use]
pub fn advertised_relays(event: &Event) -> Vec<RelayUrl> {
    let candidates: Vec<String> = match event.kind() {
        KIND_RELAY_LIST => event.tag_values("r").map(str::to_string).collect(),
        KIND_CONTACTS => serde_json::from_str::<Value>(event.content())
            .ok()
            .and_then(|value| value.as_object().map(|map| map.keys().cloned().collect()))
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let mut relays: Vec<RelayUrl> = Vec::new();
    for candidate in candidates {
        match RelayUrl::parse(&candidate) {
            Ok(url) if !relays.contains(&url) => relays.push(url),
            Ok(_) => {}
            Err(e) => debug!(relay = %candidate, error = %e, "skipping advertised relay"),
        }
    }
    relays
}

/// Reaction, repost and reply counts for one note.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngagementMetrics {
    /// Kind 7 events referencing the note.
    pub likes: u64,
    /// Kind 6 events referencing the note.
    pub reposts: u64,
    /// Kind 1 events referencing the note.
    pub replies: u64,
}

/// What changed after ingesting an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocialUpdate {
    /// A newer profile for this pubkey.
    Profile(String),
    /// A newer follow list for this pubkey.
    Contacts(String),
    /// A newer relay list for this pubkey.
    RelayList(String),
    /// New counts for this note id.
    Metrics {
        /// Referenced note id (hex).
        event_id: String,
        /// Updated counts.
        metrics: EngagementMetrics,
    },
}

#[derive(Default)]
struct Inner {
    profiles: HashMap<String, Profile>,
    follows: HashMap<String, (i64, Vec<String>)>,
    relay_lists: HashMap<String, (i64, Vec<RelayUrl>)>,
    metrics: HashMap<String, EngagementMetrics>,
}

/// Latest social state per pubkey, fed one event at a time.
///
/// Callers must ingest each event at most once; metrics are plain counters.
#[derive(Default)]
pub struct SocialIndex {
    inner: RwLock<Inner>,
}

impl SocialIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event and reports what changed.
    ///
    /// Replaceable data (profile, follows, relay list) is only taken from an
    /// event newer than the one already held.
    pub fn ingest(&self, event: &Event) -> Vec<SocialUpdate> {
        let mut updates = Vec::new();
        let author = event.pubkey_hex();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(target) = event.first_tag_value("e") {
            let metrics = inner.metrics.entry(target.to_string()).or_default();
            let counted = match event.kind() {
                KIND_REACTION => Some(&mut metrics.likes),
                KIND_REPOST => Some(&mut metrics.reposts),
                KIND_TEXT_NOTE => Some(&mut metrics.replies),
                _ => None,
            };
            if let Some(counter) = counted {
                *counter += 1;
                updates.push(SocialUpdate::Metrics {
                    event_id: target.to_string(),
                    metrics: *metrics,
                });
            }
        }

        match event.kind() {
            KIND_METADATA => {
                if let Some(profile) = Profile::from_event(event) {
                    let newer = inner
                        .profiles
                        .get(&author)
                        .map_or(true, |held| profile.updated_at > held.updated_at);
                    if newer {
                        inner.profiles.insert(author.clone(), profile);
                        updates.push(SocialUpdate::Profile(author));
                    }
                }
            }
            KIND_CONTACTS => {
                let newer = inner
                    .follows
                    .get(&author)
                    .map_or(true, |(at, _)| event.created_at() > *at);
                if newer {
                    inner
                        .follows
                        .insert(author.clone(), (event.created_at(), followed_pubkeys(event)));
                    updates.push(SocialUpdate::Contacts(author.clone()));

                    let relays = advertised_relays(event);
                    if !relays.is_empty() && Self::replace_relays(&mut inner, &author, event, relays) {
                        updates.push(SocialUpdate::RelayList(author));
                    }
                }
            }
            KIND_RELAY_LIST => {
                let relays = advertised_relays(event);
                if Self::replace_relays(&mut inner, &author, event, relays) {
                    updates.push(SocialUpdate::RelayList(author));
                }
            }
            _ => {}
        }

        updates
    }

    fn replace_relays(inner: &mut Inner, author: &str, event: &Event, relays: Vec<RelayUrl>) -> bool {
        let newer = inner
            .relay_lists
            .get(author)
            .map_or(true, |(at, _)| event.created_at() > *at);
        if newer {
            inner
                .relay_lists
                .insert(author.to_string(), (event.created_at(), relays));
        }
        newer
    }

    /// Latest profile for `pubkey`.
    #[must_use]
    pub fn profile(&self, pubkey: &str) -> Option<Profile> {
        self.read().profiles.get(pubkey).cloned()
    }

    /// Latest follow list for `pubkey`.
    #[must_use]
    pub fn following(&self, pubkey: &str) -> Vec<String> {
        self.read()
            .follows
            .get(pubkey)
            .map(|(_, follows)| follows.clone())
            .unwrap_or_default()
    }

    /// Latest advertised relays for `pubkey`.
    #[must_use]
    pub fn relay_list(&self, pubkey: &str) -> Vec<RelayUrl> {
        self.read()
            .relay_lists
            .get(pubkey)
            .map(|(_, relays)| relays.clone())
            .unwrap_or_default()
    }

    /// Engagement counts for the note with this id.
    #[must_use]
    pub fn metrics(&self, event_id: &str) -> EngagementMetrics {
        self.read().metrics.get(event_id).copied().unwrap_or_default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SocialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("SocialIndex")
            .field("profiles", &inner.profiles.len())
            .field("follows", &inner.follows.len())
            .field("metrics", &inner.metrics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::event_fixtures::signed_event;
    use crate::nostr::{EventDraft, IdentityKeypair, TagBuilder};

    fn metadata(keypair: &IdentityKeypair, content: &str, created_at: i64) -> Event {
        signed_event(
            keypair,
            &EventDraft::new(KIND_METADATA, content).created_at(created_at),
        )
    }

    #[test]
    fn profile_parses_known_fields() {
        let keypair = IdentityKeypair::generate();
        let event = metadata(
            &keypair,
            r#"{"name":"bob","display_name":"Bob","about":"hi","picture":"https://x/y.png","nip05":"b@x"}"#,
            10,
        );
        let profile = Profile::from_event(&event).unwrap();
        assert_eq!(profile.name, "bob");
        assert_eq!(profile.best_name(), Some("Bob"));
        assert_eq!(profile.picture, "https://x/y.png");
        assert_eq!(profile.updated_at, 10);

        let junk = metadata(&keypair, "not json", 11);
        assert_eq!(Profile::from_event(&junk), None);
    }

    #[test]
    fn newest_profile_wins() {
        let index = SocialIndex::new();
        let keypair = IdentityKeypair::generate();
        let pubkey = keypair.pubkey_hex();

        let newer = metadata(&keypair, r#"{"name":"new"}"#, 200);
        let older = metadata(&keypair, r#"{"name":"old"}"#, 100);

        assert_eq!(index.ingest(&newer), vec![SocialUpdate::Profile(pubkey.clone())]);
        assert!(index.ingest(&older).is_empty());
        assert_eq!(index.profile(&pubkey).unwrap().name, "new");
    }

    #[test]
    fn contacts_and_legacy_relays_from_kind_3() {
        let index = SocialIndex::new();
        let keypair = IdentityKeypair::generate();
        let pubkey = keypair.pubkey_hex();
        let a = "a".repeat(64);
        let b = "b".repeat(64);

        let event = signed_event(
            &keypair,
            &EventDraft::new(
                KIND_CONTACTS,
                r#"{"wss://relay.one/":{"read":true,"write":true},"https://nope":{}}"#,
            )
            .tag(TagBuilder::p_tag(&a))
            .tag(TagBuilder::p_tag(&b))
            .tag(TagBuilder::p_tag(&a)),
        );

        let updates = index.ingest(&event);
        assert_eq!(
            updates,
            vec![
                SocialUpdate::Contacts(pubkey.clone()),
                SocialUpdate::RelayList(pubkey.clone())
            ]
        );
        assert_eq!(index.following(&pubkey), vec![a, b]);
        assert_eq!(index.relay_list(&pubkey)[0].as_str(), "wss://relay.one");
    }

    #[test]
    fn relay_list_from_r_tags() {
        let keypair = IdentityKeypair::generate();
        let event = signed_event(
            &keypair,
            &EventDraft::new(KIND_RELAY_LIST, "")
                .tag(TagBuilder::r_tag("wss://nos.lol/", None))
                .tag(TagBuilder::r_tag("wss://relay.damus.io", Some("read")))
                .tag(TagBuilder::r_tag("ftp://bad", None)),
        );
        let relays: Vec<_> = advertised_relays(&event)
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(relays, ["wss://nos.lol", "wss://relay.damus.io"]);
    }

    #[test]
    fn engagement_counted_by_kind() {
        let index = SocialIndex::new();
        let keypair = IdentityKeypair::generate();
        let target = "c".repeat(64);
        let reference = TagBuilder::e_tag(&target, None, None);

        index.ingest(&signed_event(
            &keypair,
            &EventDraft::new(KIND_REACTION, "+").tag(reference.clone()),
        ));
        index.ingest(&signed_event(
            &keypair,
            &EventDraft::new(KIND_REPOST, "").tag(reference.clone()),
        ));
        let updates = index.ingest(&signed_event(
            &keypair,
            &EventDraft::text_note("reply").tag(reference),
        ));

        let expected = EngagementMetrics {
            likes: 1,
            reposts: 1,
            replies: 1,
        };
        assert_eq!(index.metrics(&target), expected);
        assert_eq!(
            updates,
            vec![SocialUpdate::Metrics {
                event_id: target,
                metrics: expected
            }]
        );
    }

    #[test]
    fn unrelated_kinds_change_nothing() {
        let index = SocialIndex::new();
        let keypair = IdentityKeypair::generate();
        let event = signed_event(&keypair, &EventDraft::new(30_023, "article"));
        assert!(index.ingest(&event).is_empty());
        assert_eq!(index.metrics(&event.id_hex()), EngagementMetrics::default());
    }
}
