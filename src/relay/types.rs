//! Types for relay management.
//!
//! This module defines relay addresses, connection status, and publish
//! results.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::{RelayError, RelayResult};
use super::message::RelayMessage;

/// A normalized relay address.
///
/// Only `ws://` and `wss://` are accepted. The host is lowercased and any
/// trailing `/` is removed, so `wss://Relay.Example.com/` and
/// `wss://relay.example.com` are the same relay.
///
/// # Example
///
/// ```
/// use gnostr_core::relay::RelayUrl;
///
/// let url = RelayUrl::parse("wss://Relay.Damus.io/").unwrap();
/// assert_eq!(url.as_str(), "wss://relay.damus.io");
/// assert!(RelayUrl::parse("https://relay.damus.io").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Parses and normalizes a relay address.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidUrl`] if the input is not a websocket URL
    /// with a host.
    pub fn parse(input: &str) -> RelayResult<Self> {
        let trimmed = input.trim();
        let parsed =
            Url::parse(trimmed).map_err(|e| RelayError::InvalidUrl(format!("{trimmed}: {e}")))?;

        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RelayError::InvalidUrl(format!(
                "{trimmed}: scheme must be ws or wss"
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(RelayError::InvalidUrl(format!("{trimmed}: missing host")));
        }

        let mut normalized = parsed.to_string();
        while normalized.ends_with('/') {
            normalized.pop();
        }
        Ok(Self(normalized))
    }

    /// The normalized address.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RelayUrl {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}

/// Connection status for a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// Not connected and not trying.
    Disconnected,

    /// A connection attempt is in progress.
    Connecting,

    /// Connected and ready.
    Connected,

    /// Waiting before the next connection attempt.
    BackingOff {
        /// Consecutive failed attempts so far.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },

    /// Shut down by the owner. Terminal.
    Closed,
}

impl RelayStatus {
    /// Returns `true` if frames can be sent right now.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::BackingOff { attempt, delay } => {
                write!(f, "backing off (attempt {attempt}, {}ms)", delay.as_millis())
            }
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Point-in-time view of one relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySnapshot {
    /// The relay URL.
    pub url: RelayUrl,
    /// Current connection status.
    pub status: RelayStatus,
    /// Subscriptions currently open on this relay.
    pub subscriptions: usize,
    /// Last time a frame was received (Unix timestamp).
    pub last_message_at: Option<i64>,
    /// Consecutive failed connection attempts.
    pub reconnect_attempts: u32,
    /// Total frames rejected as protocol violations.
    pub protocol_violations: u64,
}

/// Something a relay connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayNotification {
    /// A well-formed inbound frame.
    Message {
        /// Originating relay.
        relay: RelayUrl,
        /// The frame.
        message: RelayMessage,
    },
    /// A status transition.
    Status {
        /// The relay whose status changed.
        relay: RelayUrl,
        /// The new status.
        status: RelayStatus,
    },
}

/// Outcome of publishing one event to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The relay answered `OK true`.
    Accepted,
    /// The relay answered `OK false` with this message.
    Rejected(String),
    /// No `OK` arrived before the deadline.
    Timeout,
    /// The relay was not connected, or the connection dropped before `OK`.
    NotConnected,
}

impl PublishOutcome {
    /// Returns `true` for [`Self::Accepted`].
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Result of publishing an event to relays.
///
/// Every relay that was asked appears exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Hex id of the published event.
    pub event_id: String,
    /// Per-relay outcome.
    pub outcomes: BTreeMap<RelayUrl, PublishOutcome>,
}

impl PublishReport {
    /// Returns true if at least one relay accepted the event.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.values().any(PublishOutcome::is_accepted)
    }

    /// Returns the number of relays that accepted the event.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_accepted()).count()
    }

    /// Returns the total number of relays attempted.
    #[must_use]
    pub fn total_attempted(&self) -> usize {
        self.outcomes.len()
    }

    /// Relays that accepted the event.
    pub fn accepted_by(&self) -> impl Iterator<Item = &RelayUrl> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_accepted())
            .map(|(url, _)| url)
    }

    /// Relays that rejected the event, with their reasons.
    pub fn rejected_by(&self) -> impl Iterator<Item = (&RelayUrl, &str)> {
        self.outcomes.iter().filter_map(|(url, outcome)| match outcome {
            PublishOutcome::Rejected(reason) => Some((url, reason.as_str())),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    #[test]
    fn relay_url_strips_trailing_slash_and_lowercases_host() {
        assert_eq!(url("wss://NOS.lol/").as_str(), "wss://nos.lol");
        assert_eq!(url("  ws://localhost:7777  ").as_str(), "ws://localhost:7777");
        assert_eq!(url("wss://relay.example.com/path/").as_str(), "wss://relay.example.com/path");
    }

    #[test]
    fn relay_url_rejects_other_schemes_and_garbage() {
        for input in ["https://relay.damus.io", "relay.damus.io", "", "wss://"] {
            assert!(
                matches!(RelayUrl::parse(input), Err(RelayError::InvalidUrl(_))),
                "accepted {input:?}"
            );
        }
    }

    #[test]
    fn relay_url_serde_uses_normalized_string() {
        let parsed: RelayUrl = serde_json::from_str("\"wss://nos.lol/\"").unwrap();
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"wss://nos.lol\"");
        assert!(serde_json::from_str::<RelayUrl>("\"ftp://x\"").is_err());
    }

    #[test]
    fn relay_status_display() {
        assert_eq!(RelayStatus::Connected.to_string(), "connected");
        let backing_off = RelayStatus::BackingOff {
            attempt: 3,
            delay: Duration::from_millis(4000),
        };
        assert_eq!(backing_off.to_string(), "backing off (attempt 3, 4000ms)");
        assert!(!backing_off.is_connected());
    }

    #[test]
    fn publish_report_counts() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(url("wss://a.example"), PublishOutcome::Accepted);
        outcomes.insert(url("wss://b.example"), PublishOutcome::Rejected("blocked".into()));
        outcomes.insert(url("wss://c.example"), PublishOutcome::Timeout);
        let report = PublishReport {
            event_id: "00".repeat(32),
            outcomes,
        };

        assert!(report.is_success());
        assert_eq!(report.success_count(), 1);
        assert_eq!(report.total_attempted(), 3);
        assert_eq!(report.accepted_by().count(), 1);
        assert_eq!(
            report.rejected_by().collect::<Vec<_>>(),
            vec![(&url("wss://b.example"), "blocked")]
        );
    }

    #[test]
    fn publish_report_not_success_when_nothing_accepted() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(url("wss://a.example"), PublishOutcome::NotConnected);
        let report = PublishReport {
            event_id: String::new(),
            outcomes,
        };
        assert!(!report.is_success());
        assert_eq!(report.success_count(), 0);
    }
}
