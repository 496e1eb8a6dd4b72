//! Fan-in of relay traffic into logical subscriptions.
//!
//! The manager owns every [`RelayConnection`] and a single router task that
//! drains their shared notification channel:
//!
//! ```text
//! EVENT ─▶ validate ─▶ EventStore::insert ─▶ matching subscriptions (once each)
//! EOSE  ─▶ mark relay finished ─▶ StoredComplete when none is outstanding
//! status Connected ─▶ re-issue REQ for every subscription mapped to the relay
//! ```
//!
//! The router never awaits a relay or a subscriber. Outbound `REQ`/`CLOSE`
//! are spawned, and events for a subscriber whose channel is full are dropped
//! and counted in [`RelayStats::dropped`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{
    RelayStats, StatusChange, SubscriptionEvent, SubscriptionHandle, SubscriptionPolicy,
    SubscriptionState,
};
use crate::config::{ClientConfig, ValidationConfig};
use crate::nostr::{validate, Event, Filter, RawEvent};
use crate::relay::{
    ConnectionSettings, Connector, RelayConnection, RelayMessage, RelayNotification,
    RelaySnapshot, RelayStatus, RelayUrl,
};
use crate::store::EventStore;

/// Depth of the channel every connection forwards into.
const NOTIFICATION_BUFFER: usize = 1024;

/// Depth of the status broadcast. Slow listeners lose the oldest changes.
const STATUS_BUFFER: usize = 256;

/// Default depth of each subscription's live channel.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

/// Receives every newly stored event, once, on the router task.
///
/// Implementations must not block for long: the router is shared by all relays.
pub trait EventObserver: Send + Sync {
    /// Called after `event` was inserted into the store.
    fn on_event(&self, event: &Event, relay: &RelayUrl);
}

/// Tunables for a [`SubscriptionManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    /// Settings applied to every relay connection.
    pub connection: ConnectionSettings,
    /// Timestamp tolerances for incoming events.
    pub validation: ValidationConfig,
    /// Depth of each subscription's live channel.
    pub subscription_buffer: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            validation: ValidationConfig::default(),
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }
}

impl From<&ClientConfig> for ManagerSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connection: config.connection.to_settings(),
            validation: config.validation.clone(),
            subscription_buffer: config.subscription_buffer.max(1),
        }
    }
}

/// Ids already delivered to one subscription, oldest forgotten first.
struct SeenIds {
    ids: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if `id` is already remembered.
    fn insert(&mut self, id: [u8; 32]) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// One relay's share of a logical subscription.
#[derive(Debug, Clone, Copy, Default)]
struct Leg {
    /// `REQ` has been issued on the current session.
    requested: bool,
    /// No longer holds back `StoredComplete`.
    finished: bool,
}

struct Subscription {
    /// Filters events are matched against locally.
    filters: Vec<Filter>,
    /// Filters sent in `REQ`.
    wire_filters: Vec<Filter>,
    policy: SubscriptionPolicy,
    sender: mpsc::Sender<SubscriptionEvent>,
    legs: HashMap<RelayUrl, Leg>,
    stored_complete: bool,
    seen: SeenIds,
}

impl Subscription {
    /// Returns `true` exactly once, when the last outstanding relay finishes.
    fn take_completion(&mut self) -> bool {
        if self.policy != SubscriptionPolicy::HistoricalThenLive || self.stored_complete {
            return false;
        }
        if self.legs.values().all(|leg| leg.finished) {
            self.stored_complete = true;
            return true;
        }
        false
    }

    fn completion(&mut self, id: &str) -> Option<Delivery> {
        self.take_completion()
            .then(|| (id.to_string(), self.sender.clone(), SubscriptionEvent::StoredComplete))
    }
}

#[derive(Default)]
struct State {
    connections: BTreeMap<RelayUrl, Arc<RelayConnection>>,
    subscriptions: HashMap<String, Subscription>,
    stats: HashMap<RelayUrl, RelayStats>,
    credits: HashMap<[u8; 32], BTreeSet<RelayUrl>>,
    observers: Vec<Arc<dyn EventObserver>>,
    next_id: u64,
}

type Delivery = (String, mpsc::Sender<SubscriptionEvent>, SubscriptionEvent);

struct Shared {
    connector: Arc<dyn Connector>,
    settings: ManagerSettings,
    store: Arc<EventStore>,
    notifications: mpsc::Sender<RelayNotification>,
    status_tx: broadcast::Sender<StatusChange>,
    state: Mutex<State>,
}

/// Multiplexes logical subscriptions over a set of relay connections.
///
/// Must be created inside a tokio runtime.
pub struct SubscriptionManager {
    shared: Arc<Shared>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    /// Creates a manager with no relays and starts its router task.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<EventStore>,
        settings: ManagerSettings,
    ) -> Self {
        let (notifications_tx, notifications_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let (status_tx, _) = broadcast::channel(STATUS_BUFFER);
        let shared = Arc::new(Shared {
            connector,
            settings,
            store,
            notifications: notifications_tx,
            status_tx,
            state: Mutex::new(State::default()),
        });
        let router = tokio::spawn(route(Arc::clone(&shared), notifications_rx));

        Self {
            shared,
            router: Mutex::new(Some(router)),
        }
    }

    /// The store every accepted event is inserted into.
    #[must_use]
    pub fn store(&self) -> &Arc<EventStore> {
        &self.shared.store
    }

    /// Registers an observer for newly stored events.
    pub fn add_observer(&self, observer: Arc<dyn EventObserver>) {
        self.shared.state().observers.push(observer);
    }

    /// Opens a connection to `url`. Existing subscriptions are issued on it
    /// once it connects. Returns `false` if the relay is already managed.
    pub fn add_relay(&self, url: RelayUrl) -> bool {
        let mut state = self.shared.state();
        if state.connections.contains_key(&url) {
            return false;
        }

        for subscription in state.subscriptions.values_mut() {
            let leg = Leg {
                requested: false,
                finished: subscription.stored_complete,
            };
            subscription.legs.insert(url.clone(), leg);
        }

        // Opened under the lock so the router cannot see this relay's first
        // status before the connection is registered.
        let connection = RelayConnection::open(
            url.clone(),
            Arc::clone(&self.shared.connector),
            self.shared.settings.connection.clone(),
            self.shared.notifications.clone(),
        );
        state.connections.insert(url.clone(), Arc::new(connection));
        state.stats.entry(url.clone()).or_default();
        info!(relay = %url, "relay added");
        true
    }

    /// Closes and forgets the connection to `url`. Subscriptions stop waiting
    /// for it. Returns `false` if the relay was not managed.
    pub async fn remove_relay(&self, url: &RelayUrl) -> bool {
        let (connection, deliveries) = {
            let mut state = self.shared.state();
            let Some(connection) = state.connections.remove(url) else {
                return false;
            };
            state.stats.remove(url);

            let mut deliveries = Vec::new();
            for (id, subscription) in &mut state.subscriptions {
                if subscription.legs.remove(url).is_some() {
                    deliveries.extend(subscription.completion(id));
                }
            }
            (connection, deliveries)
        };

        connection.close().await;
        self.shared.deliver(deliveries);
        info!(relay = %url, "relay removed");
        true
    }

    /// Managed relay addresses, sorted.
    #[must_use]
    pub fn relays(&self) -> Vec<RelayUrl> {
        self.shared.state().connections.keys().cloned().collect()
    }

    /// The connection to `url`, if managed.
    #[must_use]
    pub fn connection(&self, url: &RelayUrl) -> Option<Arc<RelayConnection>> {
        self.shared.state().connections.get(url).cloned()
    }

    /// Every managed connection.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<RelayConnection>> {
        self.shared.state().connections.values().cloned().collect()
    }

    /// Snapshot of every managed connection.
    #[must_use]
    pub fn relay_statuses(&self) -> Vec<RelaySnapshot> {
        self.connections()
            .iter()
            .map(|connection| connection.snapshot())
            .collect()
    }

    /// Stream of relay status transitions.
    #[must_use]
    pub fn status_events(&self) -> broadcast::Receiver<StatusChange> {
        self.shared.status_tx.subscribe()
    }

    /// Delivery counters for `url`. Zero for unknown relays.
    #[must_use]
    pub fn relay_stats(&self, url: &RelayUrl) -> RelayStats {
        self.shared
            .state()
            .stats
            .get(url)
            .copied()
            .unwrap_or_default()
    }

    /// Every relay that served the event, including those whose copy was a
    /// duplicate.
    #[must_use]
    pub fn relay_credits(&self, event_id: &[u8; 32]) -> Vec<RelayUrl> {
        self.shared
            .state()
            .credits
            .get(event_id)
            .map(|relays| relays.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Opens a logical subscription on every managed relay.
    ///
    /// `REQ` goes out immediately on connected relays and on the others as
    /// soon as they connect.
    #[must_use]
    pub fn subscribe(&self, filters: Vec<Filter>, policy: SubscriptionPolicy) -> SubscriptionHandle {
        let wire_filters = match policy {
            SubscriptionPolicy::HistoricalThenLive => filters.clone(),
            SubscriptionPolicy::LiveOnly => {
                let now = Utc::now().timestamp();
                filters
                    .iter()
                    .map(|filter| {
                        let since = filter.since.map_or(now, |since| since.max(now));
                        filter.clone().since(since).limit(0)
                    })
                    .collect()
            }
        };
        let (sender, receiver) = mpsc::channel(self.shared.settings.subscription_buffer.max(1));

        let (id, connected) = {
            let mut state = self.shared.state();
            state.next_id += 1;
            let id = format!("gnostr-{}", state.next_id);

            let mut legs = HashMap::new();
            let mut connected = Vec::new();
            for (url, connection) in &state.connections {
                let status = connection.status();
                let leg = Leg {
                    requested: status.is_connected(),
                    // A relay that is down does not hold back completion.
                    finished: matches!(status, RelayStatus::BackingOff { .. } | RelayStatus::Closed),
                };
                legs.insert(url.clone(), leg);
                if status.is_connected() {
                    connected.push(Arc::clone(connection));
                }
            }

            let mut subscription = Subscription {
                filters,
                wire_filters: wire_filters.clone(),
                policy,
                sender,
                legs,
                stored_complete: false,
                seen: SeenIds::new(self.shared.store.capacity()),
            };
            if subscription.take_completion() {
                // Fresh channel with capacity of at least one.
                let _ = subscription.sender.try_send(SubscriptionEvent::StoredComplete);
            }
            state.subscriptions.insert(id.clone(), subscription);
            (id, connected)
        };

        debug!(subscription = %id, ?policy, relays = connected.len(), "subscription opened");
        for connection in connected {
            self.shared
                .spawn_req(connection, id.clone(), wire_filters.clone());
        }

        SubscriptionHandle {
            id,
            events: receiver,
        }
    }

    /// Closes the subscription: forwarding stops now and `CLOSE` is sent to
    /// every relay serving it. Returns `false` if it was already closed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.shared.close_subscription(handle.id())
    }

    /// Lifecycle state of the subscription with this id.
    #[must_use]
    pub fn subscription_state(&self, id: &str) -> SubscriptionState {
        self.shared
            .state()
            .subscriptions
            .get(id)
            .map_or(SubscriptionState::Closed, |subscription| {
                if subscription.legs.values().any(|leg| leg.requested) {
                    SubscriptionState::Active
                } else {
                    SubscriptionState::Pending
                }
            })
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared.state().subscriptions.len()
    }

    /// Stops routing, ends every subscription and closes every connection.
    pub async fn shutdown(&self) {
        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(router) = router {
            router.abort();
            let _ = router.await;
        }

        let connections: Vec<_> = {
            let mut state = self.shared.state();
            state.subscriptions.clear();
            std::mem::take(&mut state.connections).into_values().collect()
        };
        for connection in connections {
            connection.close().await;
        }
        info!("subscription manager shut down");
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Some(router) = self
            .router
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            router.abort();
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("SubscriptionManager")
            .field("relays", &state.connections.len())
            .field("subscriptions", &state.subscriptions.len())
            .finish_non_exhaustive()
    }
}

async fn route(shared: Arc<Shared>, mut notifications: mpsc::Receiver<RelayNotification>) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            RelayNotification::Message { relay, message } => {
                shared.handle_message(relay, message);
            }
            RelayNotification::Status { relay, status } => {
                shared.handle_status(relay, status);
            }
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_req(self: &Arc<Self>, connection: Arc<RelayConnection>, id: String, filters: Vec<Filter>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = connection.subscribe(&id, &filters).await {
                debug!(relay = %connection.url(), subscription = %id, error = %e, "REQ not sent");
                return;
            }

            let still_open = shared.state().subscriptions.contains_key(&id);
            // Unsubscribed while the REQ was in flight.
            if !still_open {
                let _ = connection.unsubscribe(&id).await;
            }
        });
    }

    fn close_subscription(&self, id: &str) -> bool {
        let connections: Vec<_> = {
            let mut state = self.state();
            let Some(subscription) = state.subscriptions.remove(id) else {
                return false;
            };
            subscription
                .legs
                .keys()
                .filter_map(|url| state.connections.get(url).cloned())
                .collect()
        };

        for connection in connections {
            if !connection.status().is_connected() {
                continue;
            }
            let id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = connection.unsubscribe(&id).await {
                    debug!(relay = %connection.url(), subscription = %id, error = %e, "CLOSE not sent");
                }
            });
        }
        debug!(subscription = %id, "subscription closed");
        true
    }

    /// Hands items to subscribers without waiting for any of them.
    fn deliver(&self, deliveries: Vec<Delivery>) {
        for (id, sender, item) in deliveries {
            match sender.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(SubscriptionEvent::Event { event, relay })) => {
                    debug!(
                        subscription = %id,
                        relay = %relay,
                        event_id = %event.id_hex(),
                        "subscriber is lagging, event dropped"
                    );
                    if let Some(stats) = self.state().stats.get_mut(&relay) {
                        stats.dropped += 1;
                    }
                }
                Err(TrySendError::Full(marker)) => {
                    // Markers are never dropped; they queue behind what the
                    // subscriber already holds.
                    tokio::spawn(async move {
                        let _ = sender.send(marker).await;
                    });
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription = %id, "subscriber went away");
                    self.close_subscription(&id);
                }
            }
        }
    }

    fn handle_status(self: &Arc<Self>, relay: RelayUrl, status: RelayStatus) {
        let _ = self.status_tx.send(StatusChange {
            relay: relay.clone(),
            status,
        });

        let mut requests = Vec::new();
        let mut deliveries = Vec::new();
        let connection = {
            let mut state = self.state();
            let Some(connection) = state.connections.get(&relay).cloned() else {
                return;
            };
            // A late status from a connection that has since been replaced.
            if status == RelayStatus::Closed && !connection.is_closed() {
                return;
            }

            for (id, subscription) in &mut state.subscriptions {
                let Some(leg) = subscription.legs.get_mut(&relay) else {
                    continue;
                };
                match status {
                    RelayStatus::Connected if !leg.requested => {
                        leg.requested = true;
                        requests.push((id.clone(), subscription.wire_filters.clone()));
                    }
                    RelayStatus::Connected => {}
                    RelayStatus::Connecting => {}
                    RelayStatus::Disconnected | RelayStatus::BackingOff { .. } | RelayStatus::Closed => {
                        leg.requested = false;
                        leg.finished = true;
                        deliveries.extend(subscription.completion(id));
                    }
                }
            }
            connection
        };

        if !requests.is_empty() {
            debug!(relay = %relay, count = requests.len(), "issuing subscriptions");
        }
        for (id, filters) in requests {
            self.spawn_req(Arc::clone(&connection), id, filters);
        }
        self.deliver(deliveries);
    }

    fn handle_message(&self, relay: RelayUrl, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.handle_event(relay, &subscription_id, event),
            RelayMessage::Eose { subscription_id } => {
                let delivery = {
                    let mut state = self.state();
                    state
                        .subscriptions
                        .get_mut(&subscription_id)
                        .and_then(|subscription| {
                            subscription.legs.get_mut(&relay)?.finished = true;
                            subscription.completion(&subscription_id)
                        })
                };
                self.deliver(delivery.into_iter().collect());
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                let mut deliveries = Vec::new();
                {
                    let mut state = self.state();
                    if let Some(subscription) = state.subscriptions.get_mut(&subscription_id) {
                        if subscription.legs.remove(&relay).is_some() {
                            deliveries.push((
                                subscription_id.clone(),
                                subscription.sender.clone(),
                                SubscriptionEvent::RelayClosed {
                                    relay: relay.clone(),
                                    reason: message,
                                },
                            ));
                            deliveries.extend(subscription.completion(&subscription_id));
                        }
                    }
                }
                self.deliver(deliveries);
            }
            RelayMessage::Notice { .. } => {
                self.state().stats.entry(relay).or_default().notices += 1;
            }
            RelayMessage::Ok { .. } => {}
        }
    }

    fn handle_event(&self, relay: RelayUrl, subscription_id: &str, value: serde_json::Value) {
        {
            let mut state = self.state();
            let Some(subscription) = state.subscriptions.get(subscription_id) else {
                debug!(relay = %relay, subscription = %subscription_id, "event for unknown subscription");
                return;
            };
            if subscription.sender.is_closed() {
                drop(state);
                self.close_subscription(subscription_id);
                return;
            }
            state.stats.entry(relay.clone()).or_default().events_received += 1;
        }

        let policy = self.settings.validation.policy_at(Utc::now().timestamp());
        let event = match RawEvent::from_value(value).and_then(|raw| validate(&raw, &policy)) {
            Ok(event) => event,
            Err(e) => {
                warn!(relay = %relay, error = %e, "discarding invalid event");
                self.state().stats.entry(relay).or_default().invalid_events += 1;
                return;
            }
        };

        let is_new = self.store.insert(event.clone());
        let id = *event.id();

        let (deliveries, observers) = {
            let mut state = self.state();
            let stats = state.stats.entry(relay.clone()).or_default();
            if is_new {
                stats.events_accepted += 1;
            } else {
                stats.duplicates += 1;
            }

            state.credits.entry(id).or_default().insert(relay.clone());
            // Pruned in batches so a full store costs amortized O(1) per event.
            if state.credits.len() > self.store.capacity().saturating_mul(2) {
                state.credits.retain(|id, _| self.store.contains(id));
            }

            let mut deliveries = Vec::new();
            for (sub_id, subscription) in &mut state.subscriptions {
                // Stored duplicates still reach the subscription that asked
                // for them, if it has not seen them yet.
                let eligible = is_new || sub_id == subscription_id;
                if eligible
                    && Filter::matches_any(&subscription.filters, &event)
                    && subscription.seen.insert(id)
                {
                    deliveries.push((
                        sub_id.clone(),
                        subscription.sender.clone(),
                        SubscriptionEvent::Event {
                            event: event.clone(),
                            relay: relay.clone(),
                        },
                    ));
                }
            }

            let observers = if is_new {
                state.observers.clone()
            } else {
                Vec::new()
            };
            (deliveries, observers)
        };

        for observer in &observers {
            observer.on_event(&event, &relay);
        }
        self.deliver(deliveries);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::nostr::event_fixtures::signed_event;
    use crate::nostr::{EventDraft, IdentityKeypair, KIND_TEXT_NOTE};
    use crate::relay::testing::{SimulatedConnector, SimulatedRelay, SimulatedSession};

    fn settings() -> ManagerSettings {
        ManagerSettings {
            connection: ConnectionSettings {
                connect_timeout: Duration::from_secs(1),
                backoff_base: Duration::from_millis(100),
                backoff_max: Duration::from_secs(5),
                backoff_jitter: 0.0,
                stable_after: Duration::from_secs(10),
                max_protocol_violations: 3,
            },
            validation: ValidationConfig::default(),
            subscription_buffer: 64,
        }
    }

    fn manager(connector: &SimulatedConnector) -> SubscriptionManager {
        manager_with(connector, 100, 64)
    }

    fn manager_with(connector: &SimulatedConnector, capacity: usize, buffer: usize) -> SubscriptionManager {
        SubscriptionManager::new(
            Arc::new(connector.clone()),
            Arc::new(EventStore::new(capacity)),
            ManagerSettings {
                subscription_buffer: buffer,
                ..settings()
            },
        )
    }

    async fn connect(manager: &SubscriptionManager, relay: &mut SimulatedRelay) -> SimulatedSession {
        manager.add_relay(relay.url().clone());
        relay.accept().await.unwrap()
    }

    fn note(content: &str) -> Event {
        let keypair = IdentityKeypair::generate();
        signed_event(&keypair, &EventDraft::text_note(content))
    }

    struct Recorder(Mutex<Vec<Event>>);

    impl EventObserver for Recorder {
        fn on_event(&self, event: &Event, _relay: &RelayUrl) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn events_are_validated_stored_and_forwarded() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://a.example");
        let manager = manager(&connector);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        manager.add_observer(recorder.clone());
        let mut session = connect(&manager, &mut relay).await;

        let mut handle = manager.subscribe(
            vec![Filter::new().kind(KIND_TEXT_NOTE)],
            SubscriptionPolicy::HistoricalThenLive,
        );
        let (id, filters) = session.expect_req().await.unwrap();
        assert_eq!(id, handle.id());
        assert_eq!(filters, vec![json!({"kinds": [1]})]);

        let event = note("hello");
        session.send_json(&json!(["EVENT", id, {"id": "not hex"}]));
        session.send_event(&id, &event);

        assert_eq!(
            handle.recv().await,
            Some(SubscriptionEvent::Event {
                event: event.clone(),
                relay: relay.url().clone(),
            })
        );
        assert!(manager.store().contains(event.id()));
        assert_eq!(recorder.0.lock().unwrap().as_slice(), [event]);

        let stats = manager.relay_stats(relay.url());
        assert_eq!(stats.invalid_events, 1);
        assert_eq!(stats.events_accepted, 1);
        assert_eq!(stats.events_received, 2);
        assert_eq!(manager.subscription_state(&id), SubscriptionState::Active);
    }

    #[tokio::test]
    async fn unsubscribe_sends_close_and_stops_forwarding() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://a.example");
        let manager = manager(&connector);
        let mut session = connect(&manager, &mut relay).await;

        let mut handle = manager.subscribe(vec![Filter::new()], SubscriptionPolicy::HistoricalThenLive);
        let (id, _) = session.expect_req().await.unwrap();

        assert!(manager.unsubscribe(&handle));
        assert!(!manager.unsubscribe(&handle));
        assert_eq!(session.recv_json().await.unwrap(), json!(["CLOSE", id]));

        session.send_event(&id, &note("too late"));
        assert_eq!(handle.recv().await, None);
        assert_eq!(manager.subscription_state(&id), SubscriptionState::Closed);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn dropped_handle_closes_lazily() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://a.example");
        let manager = manager(&connector);
        let mut session = connect(&manager, &mut relay).await;

        let handle = manager.subscribe(vec![Filter::new()], SubscriptionPolicy::HistoricalThenLive);
        let (id, _) = session.expect_req().await.unwrap();
        drop(handle);

        session.send_event(&id, &note("nobody listens"));
        assert_eq!(session.recv_json().await.unwrap(), json!(["CLOSE", id]));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn relay_closed_counts_as_finished() {
        let connector = SimulatedConnector::new();
        let mut relay_a = connector.relay("wss://a.example");
        let mut relay_b = connector.relay("wss://b.example");
        let manager = manager(&connector);
        let mut session_a = connect(&manager, &mut relay_a).await;
        let mut session_b = connect(&manager, &mut relay_b).await;

        let mut handle = manager.subscribe(vec![Filter::new()], SubscriptionPolicy::HistoricalThenLive);
        let (id, _) = session_a.expect_req().await.unwrap();
        session_b.expect_req().await.unwrap();

        session_a.send_closed(&id, "auth-required: no");
        assert_eq!(
            handle.recv().await,
            Some(SubscriptionEvent::RelayClosed {
                relay: relay_a.url().clone(),
                reason: "auth-required: no".to_string(),
            })
        );

        session_b.send_eose(&id);
        assert_eq!(handle.recv().await, Some(SubscriptionEvent::StoredComplete));
    }

    #[tokio::test]
    async fn live_only_requests_new_events_and_never_completes() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://a.example");
        let manager = manager(&connector);
        let mut session = connect(&manager, &mut relay).await;

        let before = Utc::now().timestamp();
        let mut handle = manager.subscribe(
            vec![Filter::new().kind(KIND_TEXT_NOTE).limit(20)],
            SubscriptionPolicy::LiveOnly,
        );
        let (id, filters) = session.expect_req().await.unwrap();
        assert_eq!(filters[0]["limit"], 0);
        assert!(filters[0]["since"].as_i64().unwrap() >= before);

        session.send_eose(&id);
        let event = note("live");
        session.send_event(&id, &event);
        assert_eq!(handle.next_event().await, Some(event));
        assert!(handle.try_recv().is_none());
    }

    #[tokio::test]
    async fn no_relays_completes_immediately() {
        let connector = SimulatedConnector::new();
        let manager = manager(&connector);

        let mut handle = manager.subscribe(vec![Filter::new()], SubscriptionPolicy::HistoricalThenLive);
        assert_eq!(handle.try_recv(), Some(SubscriptionEvent::StoredComplete));
        assert_eq!(manager.subscription_state(handle.id()), SubscriptionState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reissues_subscriptions() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://a.example");
        let manager = manager(&connector);
        let mut session = connect(&manager, &mut relay).await;

        let handle = manager.subscribe(vec![Filter::new().kind(1)], SubscriptionPolicy::HistoricalThenLive);
        let (id, _) = session.expect_req().await.unwrap();
        drop(session);

        let mut session = relay.accept().await.unwrap();
        let (reissued, filters) = session.expect_req().await.unwrap();
        assert_eq!(reissued, id);
        assert_eq!(filters, vec![json!({"kinds": [1]})]);
        assert_eq!(handle.id(), id);
    }

    #[tokio::test]
    async fn added_relay_receives_existing_subscriptions() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://late.example");
        let manager = manager(&connector);

        let mut handle = manager.subscribe(vec![Filter::new()], SubscriptionPolicy::HistoricalThenLive);
        assert_eq!(handle.try_recv(), Some(SubscriptionEvent::StoredComplete));

        let mut session = connect(&manager, &mut relay).await;
        let (id, _) = session.expect_req().await.unwrap();
        assert_eq!(id, handle.id());
        assert!(!manager.add_relay(relay.url().clone()));
    }

    #[tokio::test]
    async fn removed_relay_stops_holding_back_completion() {
        let connector = SimulatedConnector::new();
        let mut relay_a = connector.relay("wss://a.example");
        let mut relay_b = connector.relay("wss://b.example");
        let manager = manager(&connector);
        let mut session_a = connect(&manager, &mut relay_a).await;
        let mut session_b = connect(&manager, &mut relay_b).await;

        let mut handle = manager.subscribe(vec![Filter::new()], SubscriptionPolicy::HistoricalThenLive);
        let (id, _) = session_a.expect_req().await.unwrap();
        session_b.expect_req().await.unwrap();

        session_a.send_eose(&id);
        assert!(manager.remove_relay(relay_b.url()).await);
        assert_eq!(handle.recv().await, Some(SubscriptionEvent::StoredComplete));
        assert_eq!(manager.relays(), vec![relay_a.url().clone()]);
        assert!(!manager.remove_relay(relay_b.url()).await);
    }

    #[tokio::test]
    async fn notices_are_counted() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://a.example");
        let manager = manager(&connector);
        let mut session = connect(&manager, &mut relay).await;

        let mut handle = manager.subscribe(vec![Filter::new()], SubscriptionPolicy::HistoricalThenLive);
        let (id, _) = session.expect_req().await.unwrap();
        session.send_notice("slow down");
        session.send_eose(&id);
        assert_eq!(handle.recv().await, Some(SubscriptionEvent::StoredComplete));
        assert_eq!(manager.relay_stats(relay.url()).notices, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://a.example");
        let manager = manager(&connector);
        let mut session = connect(&manager, &mut relay).await;
        let mut handle = manager.subscribe(vec![Filter::new()], SubscriptionPolicy::HistoricalThenLive);
        session.expect_req().await.unwrap();

        manager.shutdown().await;
        assert!(manager.relays().is_empty());
        assert_eq!(handle.recv().await, None);
        assert!(session.recv().await.is_none());
    }

    #[tokio::test]
    async fn lagging_subscriber_does_not_stall_others() {
        let connector = SimulatedConnector::new();
        let mut relay_a = connector.relay("wss://a.example");
        let mut relay_b = connector.relay("wss://b.example");
        let manager = manager_with(&connector, 100, 2);
        let mut session_a = connect(&manager, &mut relay_a).await;
        let mut session_b = connect(&manager, &mut relay_b).await;

        let mut idle = manager.subscribe(vec![Filter::new().kind(KIND_TEXT_NOTE)], SubscriptionPolicy::LiveOnly);
        let (idle_id, _) = session_a.expect_req().await.unwrap();
        session_b.expect_req().await.unwrap();
        let mut active = manager.subscribe(vec![Filter::new().kind(7)], SubscriptionPolicy::LiveOnly);
        let (active_id, _) = session_a.expect_req().await.unwrap();
        session_b.expect_req().await.unwrap();

        let keypair = IdentityKeypair::generate();
        for n in 0..5 {
            session_a.send_event(&idle_id, &note(&format!("unread {n}")));
        }
        let from_a = signed_event(&keypair, &EventDraft::new(7, "+"));
        session_a.send_event(&active_id, &from_a);
        let from_b = signed_event(&keypair, &EventDraft::new(7, "-"));
        session_b.send_event(&active_id, &from_b);

        let wait = Duration::from_secs(2);
        assert_eq!(
            tokio::time::timeout(wait, active.next_event()).await.unwrap(),
            Some(from_a)
        );
        assert_eq!(
            tokio::time::timeout(wait, active.next_event()).await.unwrap(),
            Some(from_b)
        );
        assert_eq!(manager.relay_stats(relay_a.url()).dropped, 3);
        assert!(idle.try_recv().is_some());
        assert!(idle.try_recv().is_some());
        assert!(idle.try_recv().is_none());
    }

    #[tokio::test]
    async fn delivered_ids_and_credits_stay_bounded() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://a.example");
        let manager = manager_with(&connector, 4, 64);
        let mut session = connect(&manager, &mut relay).await;

        let mut handle = manager.subscribe(vec![Filter::new()], SubscriptionPolicy::LiveOnly);
        let (id, _) = session.expect_req().await.unwrap();

        let mut last = None;
        for n in 0..20 {
            let event = note(&format!("event {n}"));
            session.send_event(&id, &event);
            assert_eq!(handle.next_event().await, Some(event.clone()));
            last = Some(event);
        }

        let state = manager.shared.state();
        assert_eq!(state.subscriptions[&id].seen.len(), 4);
        assert!(state.credits.len() <= 8);
        drop(state);
        assert_eq!(manager.store().len(), 4);
        assert_eq!(
            manager.relay_credits(last.unwrap().id()),
            vec![relay.url().clone()]
        );
    }
}
