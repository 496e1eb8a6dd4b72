//! Shared helpers for the integration tests.
//!
//! Relays are in-memory [`SimulatedRelay`]s; every test drives the server
//! side of each session directly, so no network is involved.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gnostr_core::config::ValidationConfig;
use gnostr_core::nostr::identity::MemoryStorage;
use gnostr_core::nostr::{
    sign_event, Event, EventDraft, IdentityKeypair, IdentityManager, ValidationPolicy,
};
use gnostr_core::relay::testing::{SimulatedConnector, SimulatedRelay, SimulatedSession};
use gnostr_core::relay::ConnectionSettings;
use gnostr_core::store::EventStore;
use gnostr_core::subscription::{ManagerSettings, SubscriptionManager};

/// Fixed clock used for signing test events.
pub const NOW: i64 = 1_700_000_000;

/// Signs `draft` with `keypair` at [`NOW`].
pub fn signed(keypair: &IdentityKeypair, draft: &EventDraft) -> Event {
    sign_event(keypair, draft, &ValidationPolicy::at(NOW)).expect("test event should sign")
}

/// A text note from a fresh author.
pub fn note(content: &str) -> Event {
    signed(&IdentityKeypair::generate(), &EventDraft::text_note(content))
}

/// Connection settings with short delays and the given jitter.
pub fn fast_connection(jitter: f64) -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout: Duration::from_secs(1),
        backoff_base: Duration::from_millis(100),
        backoff_max: Duration::from_millis(1600),
        backoff_jitter: jitter,
        stable_after: Duration::from_secs(10),
        max_protocol_violations: 3,
    }
}

/// Manager over `connector` with a 1000-event store.
pub fn manager(connector: &SimulatedConnector, jitter: f64) -> SubscriptionManager {
    SubscriptionManager::new(
        Arc::new(connector.clone()),
        Arc::new(EventStore::new(1000)),
        ManagerSettings {
            connection: fast_connection(jitter),
            validation: ValidationConfig::default(),
            subscription_buffer: 64,
        },
    )
}

/// Adds `relay` to `manager` and returns the accepted session.
pub async fn connect(manager: &SubscriptionManager, relay: &mut SimulatedRelay) -> SimulatedSession {
    manager.add_relay(relay.url().clone());
    relay.accept().await.expect("relay should accept a session")
}

/// An identity manager holding a freshly generated key.
pub fn identity() -> Arc<IdentityManager> {
    let manager = Arc::new(IdentityManager::new(Arc::new(MemoryStorage::new())));
    manager.generate().expect("identity should generate");
    manager
}
