//! NIP-01 wire frames.
//!
//! Frames are JSON arrays whose first element names the message type.
//! Inbound and outbound frames are closed enums; an inbound frame of any
//! other shape is a protocol violation.

use serde_json::Value;

use super::error::{RelayError, RelayResult};
use crate::nostr::{Event, Filter};

/// Frames the client sends to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// `["REQ", <subscription_id>, <filter>...]`
    Req {
        /// Subscription id.
        subscription_id: String,
        /// Filters, combined with OR.
        filters: Vec<Filter>,
    },
    /// `["CLOSE", <subscription_id>]`
    Close {
        /// Subscription id.
        subscription_id: String,
    },
    /// `["EVENT", <event>]`
    Event(Event),
}

impl ClientMessage {
    /// Encodes the frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> RelayResult<String> {
        let encoded = match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(Value::from("REQ"));
                frame.push(Value::from(subscription_id.as_str()));
                frame.extend(filters.iter().map(Filter::to_value));
                serde_json::to_string(&frame)
            }
            Self::Close { subscription_id } => serde_json::to_string(&("CLOSE", subscription_id)),
            Self::Event(event) => serde_json::to_string(&("EVENT", event)),
        };
        encoded.map_err(|e| RelayError::Serialization(e.to_string()))
    }
}

/// Frames a relay sends to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <subscription_id>, <event>]`. The event is not yet validated.
    Event {
        /// Subscription the event answers.
        subscription_id: String,
        /// Untrusted event object.
        event: Value,
    },
    /// `["EOSE", <subscription_id>]`: stored events have all been sent.
    Eose {
        /// Subscription id.
        subscription_id: String,
    },
    /// `["NOTICE", <message>]`
    Notice {
        /// Human-readable text.
        message: String,
    },
    /// `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        /// Hex id of the event being acknowledged.
        event_id: String,
        /// Whether the relay stored the event.
        accepted: bool,
        /// Machine-prefixed reason, possibly empty.
        message: String,
    },
    /// `["CLOSED", <subscription_id>, <message>]`: the relay ended the subscription.
    Closed {
        /// Subscription id.
        subscription_id: String,
        /// Reason, possibly empty.
        message: String,
    },
}

fn string_at(frame: &[Value], index: usize, what: &str) -> RelayResult<String> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RelayError::ProtocolViolation(format!("missing {what}")))
}

fn optional_string_at(frame: &[Value], index: usize) -> String {
    frame
        .get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl RelayMessage {
    /// Parses an inbound frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ProtocolViolation`] for invalid JSON, non-array
    /// frames, unknown message types, or missing fields.
    pub fn from_json(text: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RelayError::ProtocolViolation(format!("invalid JSON: {e}")))?;
        let Value::Array(frame) = value else {
            return Err(RelayError::ProtocolViolation(
                "frame is not an array".to_string(),
            ));
        };

        let kind = string_at(&frame, 0, "message type")?;
        match kind.as_str() {
            "EVENT" => {
                let subscription_id = string_at(&frame, 1, "subscription id")?;
                let event = frame
                    .get(2)
                    .filter(|v| v.is_object())
                    .cloned()
                    .ok_or_else(|| RelayError::ProtocolViolation("missing event".to_string()))?;
                Ok(Self::Event {
                    subscription_id,
                    event,
                })
            }
            "EOSE" => Ok(Self::Eose {
                subscription_id: string_at(&frame, 1, "subscription id")?,
            }),
            "NOTICE" => Ok(Self::Notice {
                message: string_at(&frame, 1, "notice text")?,
            }),
            "OK" => {
                let event_id = string_at(&frame, 1, "event id")?;
                let accepted = frame.get(2).and_then(Value::as_bool).ok_or_else(|| {
                    RelayError::ProtocolViolation("missing OK status".to_string())
                })?;
                Ok(Self::Ok {
                    event_id,
                    accepted,
                    message: optional_string_at(&frame, 3),
                })
            }
            "CLOSED" => Ok(Self::Closed {
                subscription_id: string_at(&frame, 1, "subscription id")?,
                message: optional_string_at(&frame, 2),
            }),
            other => Err(RelayError::ProtocolViolation(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::event_fixtures::signed_event;
    use crate::nostr::{EventDraft, IdentityKeypair, KIND_TEXT_NOTE};
    use serde_json::json;

    #[test]
    fn req_frame_lists_every_filter() {
        let frame = ClientMessage::Req {
            subscription_id: "sub-1".to_string(),
            filters: vec![Filter::new().kind(KIND_TEXT_NOTE), Filter::new().limit(0)],
        }
        .to_json()
        .unwrap();

        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed, json!(["REQ", "sub-1", {"kinds": [1]}, {"limit": 0}]));
    }

    #[test]
    fn close_frame() {
        let frame = ClientMessage::Close {
            subscription_id: "sub-1".to_string(),
        }
        .to_json()
        .unwrap();
        assert_eq!(frame, r#"["CLOSE","sub-1"]"#);
    }

    #[test]
    fn event_frame_carries_wire_event() {
        let keypair = IdentityKeypair::generate();
        let event = signed_event(&keypair, &EventDraft::text_note("hi"));
        let frame = ClientMessage::Event(event.clone()).to_json().unwrap();

        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed[0], "EVENT");
        assert_eq!(parsed[1]["id"], event.id_hex());
        assert_eq!(parsed[1]["sig"].as_str().unwrap().len(), 128);
    }

    #[test]
    fn parses_each_inbound_type() {
        assert_eq!(
            RelayMessage::from_json(r#"["EVENT","s",{"id":"x"}]"#).unwrap(),
            RelayMessage::Event {
                subscription_id: "s".to_string(),
                event: json!({"id": "x"}),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","s"]"#).unwrap(),
            RelayMessage::Eose {
                subscription_id: "s".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","slow down"]"#).unwrap(),
            RelayMessage::Notice {
                message: "slow down".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["OK","abcd",false,"blocked: spam"]"#).unwrap(),
            RelayMessage::Ok {
                event_id: "abcd".to_string(),
                accepted: false,
                message: "blocked: spam".to_string(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","s","error: shutting down"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: "s".to_string(),
                message: "error: shutting down".to_string(),
            }
        );
    }

    #[test]
    fn ok_without_message_defaults_to_empty() {
        assert_eq!(
            RelayMessage::from_json(r#"["OK","abcd",true]"#).unwrap(),
            RelayMessage::Ok {
                event_id: "abcd".to_string(),
                accepted: true,
                message: String::new(),
            }
        );
    }

    #[test]
    fn malformed_frames_are_protocol_violations() {
        for frame in [
            "not json",
            r#"{"EVENT":1}"#,
            "[]",
            "[1,2]",
            r#"["AUTH","challenge"]"#,
            r#"["EVENT","s"]"#,
            r#"["EVENT","s","not an object"]"#,
            r#"["EOSE"]"#,
            r#"["OK","abcd","yes"]"#,
        ] {
            assert!(
                matches!(
                    RelayMessage::from_json(frame),
                    Err(RelayError::ProtocolViolation(_))
                ),
                "accepted {frame}"
            );
        }
    }
}
