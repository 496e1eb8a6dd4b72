//! Signing and broadcasting events.
//!
//! A publish is one attempt per relay. Whatever each relay answers (or fails
//! to answer) lands in the [`PublishReport`]; nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ValidationConfig;
use crate::nostr::{sign_event, Event, EventDraft, IdentityError, NostrError, Signer, ValidationError};
use crate::relay::{PublishOutcome, PublishReport, RelayConnection, RelayError, RelayStatus};

/// Default deadline for each relay's `OK`.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that prevent an event from being sent at all.
#[derive(Debug, Error)]
pub enum PublishError {
    /// No key is loaded, or signing failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The signed event did not pass validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The draft could not be turned into an event.
    #[error("Invalid draft: {0}")]
    InvalidDraft(String),
}

impl From<NostrError> for PublishError {
    fn from(error: NostrError) -> Self {
        match error {
            NostrError::Identity(e) => Self::Identity(e),
            NostrError::Validation(e) => Self::Validation(e),
            NostrError::Serialization(e) => Self::InvalidDraft(e.to_string()),
            NostrError::InvalidEvent(reason) => Self::InvalidDraft(reason),
        }
    }
}

/// Signs drafts and submits them to relays.
pub struct Publisher {
    signer: Arc<dyn Signer>,
    timeout: Duration,
    validation: ValidationConfig,
}

impl Publisher {
    /// Creates a publisher signing with `signer`.
    #[must_use]
    pub fn new(signer: Arc<dyn Signer>, timeout: Duration, validation: ValidationConfig) -> Self {
        Self {
            signer,
            timeout,
            validation,
        }
    }

    /// Deadline for each relay's `OK`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Signs and validates a draft without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Identity`] if no key is loaded or signing
    /// fails, and [`PublishError::Validation`] if the result does not verify.
    pub fn sign(&self, draft: &EventDraft) -> Result<Event, PublishError> {
        let policy = self.validation.policy_at(Utc::now().timestamp());
        Ok(sign_event(self.signer.as_ref(), draft, &policy)?)
    }

    /// Signs `draft` and sends it to every relay in `relays`.
    ///
    /// A report where some relays rejected or timed out is still `Ok`.
    ///
    /// # Errors
    ///
    /// Fails only if the event could not be produced; see [`Self::sign`].
    pub async fn publish(
        &self,
        draft: &EventDraft,
        relays: &[Arc<RelayConnection>],
    ) -> Result<(Event, PublishReport), PublishError> {
        let event = self.sign(draft)?;
        let report = self.broadcast(&event, relays).await;
        Ok((event, report))
    }

    /// Sends an already signed event to every relay in `relays` concurrently.
    pub async fn broadcast(&self, event: &Event, relays: &[Arc<RelayConnection>]) -> PublishReport {
        let attempts = relays.iter().map(|relay| async move {
            let outcome = self.send_one(relay, event).await;
            (relay.url().clone(), outcome)
        });
        let outcomes = join_all(attempts).await.into_iter().collect();

        let report = PublishReport {
            event_id: event.id_hex(),
            outcomes,
        };
        info!(
            event_id = %report.event_id,
            accepted = report.success_count(),
            attempted = report.total_attempted(),
            "event published"
        );
        report
    }

    async fn send_one(&self, relay: &RelayConnection, event: &Event) -> PublishOutcome {
        if relay.status() != RelayStatus::Connected {
            return PublishOutcome::NotConnected;
        }

        // Handing the frame to the connection counts against the deadline too.
        let attempt = async {
            let reply = relay.send_event(event).await?;
            Ok::<_, RelayError>(reply.await)
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(Ok(reply))) if reply.accepted => PublishOutcome::Accepted,
            Ok(Ok(Ok(reply))) => {
                debug!(relay = %relay.url(), reason = %reply.message, "event rejected");
                PublishOutcome::Rejected(reply.message)
            }
            // The session ended before OK arrived.
            Ok(Ok(Err(_)) | Err(RelayError::NotConnected(_) | RelayError::Closed(_))) => {
                PublishOutcome::NotConnected
            }
            Ok(Err(e)) => {
                warn!(relay = %relay.url(), error = %e, "publish failed");
                PublishOutcome::NotConnected
            }
            Err(_) => PublishOutcome::Timeout,
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::identity::MemoryStorage;
    use crate::nostr::{IdentityKeypair, IdentityManager, KIND_TEXT_NOTE};
    use crate::relay::testing::SimulatedConnector;
    use crate::relay::{ConnectionSettings, RelayNotification};
    use tokio::sync::mpsc;

    fn publisher(signer: Arc<dyn Signer>) -> Publisher {
        Publisher::new(signer, Duration::from_secs(2), ValidationConfig::default())
    }

    #[test]
    fn sign_without_identity_is_key_unavailable() {
        let manager = IdentityManager::new(Arc::new(MemoryStorage::new()));
        let result = publisher(Arc::new(manager)).sign(&EventDraft::text_note("hi"));
        assert!(matches!(
            result,
            Err(PublishError::Identity(IdentityError::KeyUnavailable))
        ));
    }

    #[test]
    fn sign_produces_valid_event() {
        let keypair = IdentityKeypair::generate();
        let pubkey = keypair.pubkey_hex();
        let event = publisher(Arc::new(keypair))
            .sign(&EventDraft::text_note("hello"))
            .unwrap();
        assert_eq!(event.kind(), KIND_TEXT_NOTE);
        assert_eq!(event.pubkey_hex(), pubkey);
        assert!((Utc::now().timestamp() - event.created_at()).abs() < 5);
    }

    #[test]
    fn empty_tag_is_an_invalid_draft() {
        let keypair = IdentityKeypair::generate();
        let draft = EventDraft::text_note("x").tag(Vec::new());
        assert!(matches!(
            publisher(Arc::new(keypair)).sign(&draft),
            Err(PublishError::InvalidDraft(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_relay_is_not_connected() {
        let connector = SimulatedConnector::new();
        let relay = connector.relay("wss://down.example");
        relay.set_reachable(false);
        let (tx, _rx) = mpsc::channel::<RelayNotification>(64);
        let connection = Arc::new(RelayConnection::open(
            relay.url().clone(),
            Arc::new(connector.clone()),
            ConnectionSettings::default(),
            tx,
        ));

        let (event, report) = publisher(Arc::new(IdentityKeypair::generate()))
            .publish(&EventDraft::text_note("nobody home"), &[connection])
            .await
            .unwrap();

        assert_eq!(report.event_id, event.id_hex());
        assert_eq!(
            report.outcomes.get(relay.url()),
            Some(&PublishOutcome::NotConnected)
        );
        assert!(!report.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connection_times_out() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://stalled.example");
        // Nobody drains notifications, so the connection task blocks right
        // after announcing that it is connected.
        let (tx, _rx) = mpsc::channel::<RelayNotification>(1);
        let connection = Arc::new(RelayConnection::open(
            relay.url().clone(),
            Arc::new(connector.clone()),
            ConnectionSettings::default(),
            tx,
        ));
        let _session = relay.accept().await.unwrap();
        while connection.status() != RelayStatus::Connected {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let publisher = Publisher::new(
            Arc::new(IdentityKeypair::generate()),
            Duration::from_millis(300),
            ValidationConfig::default(),
        );
        let started = tokio::time::Instant::now();
        let (_, report) = tokio::time::timeout(
            Duration::from_secs(3),
            publisher.publish(&EventDraft::text_note("anyone?"), &[connection]),
        )
        .await
        .expect("publish honours its own deadline")
        .unwrap();

        assert_eq!(report.outcomes.get(relay.url()), Some(&PublishOutcome::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
