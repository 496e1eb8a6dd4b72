//! In-memory store of validated events.
//!
//! The store is the deduplication point for everything relays deliver:
//! [`EventStore::insert`] checks and inserts under one write lock, so two
//! relays racing to deliver the same event cannot both win. Queries never
//! touch the network; they read a point-in-time snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use crate::nostr::{Event, Filter};

/// Default capacity when none is configured.
pub const DEFAULT_MAX_EVENTS: usize = 50_000;

/// Result ordering for [`EventStore::query_ordered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    /// Newest first (`created_at` descending, ties by id ascending).
    #[default]
    Descending,
    /// Oldest first (`created_at` ascending, ties by id ascending).
    Ascending,
}

#[derive(Default)]
struct Inner {
    events: HashMap<[u8; 32], Event>,
    // Insertion order, oldest first
    order: VecDeque<[u8; 32]>,
}

/// Bounded, deduplicating event store.
///
/// When full, the least recently inserted event is evicted.
///
/// # Example
///
/// ```
/// use gnostr_core::store::EventStore;
/// use gnostr_core::nostr::Filter;
///
/// let store = EventStore::new(1000);
/// assert!(store.is_empty());
/// assert_eq!(store.query(&Filter::new()).count(), 0);
/// ```
pub struct EventStore {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl EventStore {
    /// Creates a store holding at most `max_events` events (at least one).
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity: max_events.max(1),
        }
    }

    /// Maximum number of events held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts an event. Returns `false` if its id is already present.
    pub fn insert(&self, event: Event) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = *event.id();
        if inner.events.contains_key(&id) {
            return false;
        }

        while inner.events.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.events.remove(&oldest);
        }

        inner.events.insert(id, event);
        inner.order.push_back(id);
        true
    }

    /// Looks up an event by id.
    #[must_use]
    pub fn get(&self, id: &[u8; 32]) -> Option<Event> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .get(id)
            .cloned()
    }

    /// Returns `true` if an event with this id is held.
    #[must_use]
    pub fn contains(&self, id: &[u8; 32]) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .contains_key(id)
    }

    /// Number of events held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    /// Returns `true` if the store holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every event.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.events.clear();
        inner.order.clear();
    }

    /// Matching events, newest first, honouring the filter's `limit`.
    #[must_use]
    pub fn query(&self, filter: &Filter) -> QueryIter {
        self.query_ordered(filter, QueryOrder::Descending)
    }

    /// Matching events in the requested order, honouring the filter's `limit`.
    ///
    /// With [`QueryOrder::Ascending`] the limit still selects the newest
    /// matches; only the iteration order changes.
    #[must_use]
    pub fn query_ordered(&self, filter: &Filter, order: QueryOrder) -> QueryIter {
        let mut matches: Vec<Event> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner
                .events
                .values()
                .filter(|event| filter.matches(event))
                .cloned()
                .collect()
        };

        matches.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        if order == QueryOrder::Ascending {
            matches.sort_by(|a, b| {
                a.created_at()
                    .cmp(&b.created_at())
                    .then_with(|| a.id().cmp(b.id()))
            });
        }

        QueryIter {
            events: matches.into(),
            position: 0,
        }
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Finite iterator over a query snapshot.
///
/// Cloning yields an independent cursor over the same snapshot, and
/// [`Self::restart`] rewinds to the beginning. Later inserts are not visible.
#[derive(Debug, Clone)]
pub struct QueryIter {
    events: Arc<[Event]>,
    position: usize,
}

impl QueryIter {
    /// Rewinds to the first result.
    pub fn restart(&mut self) {
        self.position = 0;
    }

    /// Total number of results in the snapshot.
    #[must_use]
    pub fn total(&self) -> usize {
        self.events.len()
    }
}

impl Iterator for QueryIter {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.events.get(self.position)?.clone();
        self.position += 1;
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.events.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for QueryIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::event_fixtures::signed_event;
    use crate::nostr::{EventDraft, IdentityKeypair, KIND_REACTION, KIND_TEXT_NOTE};

    fn note(keypair: &IdentityKeypair, content: &str, created_at: i64) -> Event {
        signed_event(keypair, &EventDraft::text_note(content).created_at(created_at))
    }

    #[test]
    fn insert_is_idempotent() {
        let store = EventStore::new(10);
        let keypair = IdentityKeypair::generate();
        let event = note(&keypair, "once", 100);

        assert!(store.insert(event.clone()));
        assert!(!store.insert(event.clone()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(event.id()), Some(event));
    }

    #[test]
    fn query_orders_newest_first_with_id_tiebreak() {
        let store = EventStore::new(10);
        let keypair = IdentityKeypair::generate();
        let old = note(&keypair, "old", 100);
        let tie_a = note(&keypair, "tie a", 200);
        let tie_b = note(&keypair, "tie b", 200);
        for event in [&old, &tie_a, &tie_b] {
            store.insert(event.clone());
        }

        let results: Vec<_> = store.query(&Filter::new()).collect();
        let (first, second) = if tie_a.id() < tie_b.id() {
            (&tie_a, &tie_b)
        } else {
            (&tie_b, &tie_a)
        };
        assert_eq!(results, vec![first.clone(), second.clone(), old]);
    }

    #[test]
    fn ascending_order_and_limit_keep_newest() {
        let store = EventStore::new(10);
        let keypair = IdentityKeypair::generate();
        for ts in [100, 300, 200] {
            store.insert(note(&keypair, &ts.to_string(), ts));
        }

        let timestamps: Vec<_> = store
            .query_ordered(&Filter::new().limit(2), QueryOrder::Ascending)
            .map(|e| e.created_at())
            .collect();
        assert_eq!(timestamps, [200, 300]);
    }

    #[test]
    fn query_applies_filter() {
        let store = EventStore::new(10);
        let keypair = IdentityKeypair::generate();
        store.insert(note(&keypair, "note", 100));
        store.insert(signed_event(&keypair, &EventDraft::new(KIND_REACTION, "+")));

        assert_eq!(store.query(&Filter::new().kind(KIND_TEXT_NOTE)).count(), 1);
        assert_eq!(store.query(&Filter::new().kind(KIND_REACTION)).count(), 1);
        assert_eq!(store.query(&Filter::new()).count(), 2);
    }

    #[test]
    fn query_is_a_restartable_snapshot() {
        let store = EventStore::new(10);
        let keypair = IdentityKeypair::generate();
        store.insert(note(&keypair, "a", 1));

        let mut iter = store.query(&Filter::new());
        let copy = iter.clone();
        store.insert(note(&keypair, "b", 2));

        assert_eq!(iter.by_ref().count(), 1);
        assert_eq!(iter.next(), None);
        iter.restart();
        assert_eq!(iter.len(), 1);
        assert_eq!(copy.count(), 1);
        assert_eq!(store.query(&Filter::new()).total(), 2);
    }

    #[test]
    fn eviction_drops_least_recently_inserted() {
        let store = EventStore::new(2);
        let keypair = IdentityKeypair::generate();
        let first = note(&keypair, "first", 300);
        let second = note(&keypair, "second", 100);
        let third = note(&keypair, "third", 200);

        store.insert(first.clone());
        store.insert(second.clone());
        store.insert(third.clone());

        assert_eq!(store.len(), 2);
        assert!(!store.contains(first.id()));
        assert!(store.contains(second.id()));
        assert!(store.contains(third.id()));
    }

    #[test]
    fn clear_empties_store() {
        let store = EventStore::default();
        let keypair = IdentityKeypair::generate();
        store.insert(note(&keypair, "x", 1));
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.capacity(), DEFAULT_MAX_EVENTS);
    }

    #[test]
    fn concurrent_inserts_of_same_event_succeed_once() {
        let store = Arc::new(EventStore::new(10));
        let keypair = IdentityKeypair::generate();
        let event = note(&keypair, "race", 1);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let event = event.clone();
                std::thread::spawn(move || store.insert(event))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
