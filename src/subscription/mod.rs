//! Logical subscriptions across many relays.
//!
//! A caller opens one subscription with [`SubscriptionManager::subscribe`];
//! the manager issues it on every relay, validates and deduplicates what
//! comes back, and delivers a single stream through a [`SubscriptionHandle`].

mod manager;
mod types;

pub use manager::{EventObserver, ManagerSettings, SubscriptionManager, DEFAULT_SUBSCRIPTION_BUFFER};
pub use types::{
    RelayStats, StatusChange, SubscriptionEvent, SubscriptionHandle, SubscriptionPolicy,
    SubscriptionState,
};
