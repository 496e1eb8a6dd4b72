//! Relay connectivity.
//!
//! One [`RelayConnection`] per relay, each running its own task on the
//! tokio runtime:
//!
//! ```text
//! RelayConnection ──┐
//! RelayConnection ──┼── RelayNotification (bounded mpsc) ──▶ SubscriptionManager router
//! RelayConnection ──┘
//! ```
//!
//! A connection only ever touches its own socket and state; a failing or
//! misbehaving relay can delay its own frames but never another relay's.
//! Transport is pluggable through [`Connector`]; [`WebSocketConnector`] is
//! the production implementation.

mod backoff;
mod connection;
mod error;
mod message;
mod transport;
mod types;

pub use backoff::ExponentialBackoff;
pub use connection::{ConnectionSettings, OkReply, RelayConnection};
pub use error::{RelayError, RelayResult};
pub use message::{ClientMessage, RelayMessage};
#[cfg(any(test, feature = "test-utils"))]
pub use transport::testing;
pub use transport::{Connector, FrameSink, FrameStream, Transport, WebSocketConnector};
pub use types::{
    PublishOutcome, PublishReport, RelayNotification, RelaySnapshot, RelayStatus, RelayUrl,
};
