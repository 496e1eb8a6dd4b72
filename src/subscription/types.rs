//! Types for logical subscriptions.

use tokio::sync::mpsc;

use crate::nostr::Event;
use crate::relay::{RelayStatus, RelayUrl};

/// How a subscription treats events stored by relays before it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionPolicy {
    /// Only events created from now on. Never reports [`SubscriptionEvent::StoredComplete`].
    LiveOnly,
    /// Stored events first, then live ones. Reports
    /// [`SubscriptionEvent::StoredComplete`] exactly once.
    #[default]
    HistoricalThenLive,
}

/// Lifecycle of a logical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, but no relay has accepted the request yet.
    Pending,
    /// At least one relay is serving it.
    Active,
    /// Unsubscribed, or unknown.
    Closed,
}

/// Item delivered on a subscription's live stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A validated event, delivered once per subscription.
    Event {
        /// The event.
        event: Event,
        /// The first relay that delivered it.
        relay: RelayUrl,
    },
    /// Every contributing relay has finished sending stored events.
    StoredComplete,
    /// A relay ended the subscription on its side.
    RelayClosed {
        /// The relay.
        relay: RelayUrl,
        /// The relay's reason, possibly empty.
        reason: String,
    },
}

/// A relay status transition, as broadcast by
/// [`super::SubscriptionManager::status_events`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    /// The relay.
    pub relay: RelayUrl,
    /// Its new status.
    pub status: RelayStatus,
}

/// Per-relay delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    /// `EVENT` frames received for a live subscription.
    pub events_received: u64,
    /// Events this relay delivered first.
    pub events_accepted: u64,
    /// Valid events this relay delivered after another relay already had.
    pub duplicates: u64,
    /// Events rejected by validation.
    pub invalid_events: u64,
    /// `NOTICE` frames received.
    pub notices: u64,
    /// Events from this relay dropped because a subscriber was not keeping up.
    pub dropped: u64,
}

/// Receiving end of a logical subscription.
///
/// Dropping the handle closes the subscription the next time an item would
/// be delivered to it; [`super::SubscriptionManager::unsubscribe`] closes it
/// immediately.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub(super) id: String,
    pub(super) events: mpsc::Receiver<SubscriptionEvent>,
}

impl SubscriptionHandle {
    /// The subscription id used on the wire.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next item. Returns `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Returns the next item if one is already queued.
    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.try_recv().ok()
    }

    /// Waits for the next event, skipping markers.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let SubscriptionEvent::Event { event, .. } = self.recv().await? {
                return Some(event);
            }
        }
    }
}
