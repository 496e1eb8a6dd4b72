//! Transport abstraction for relay sessions.
//!
//! A [`Connector`] turns a relay URL into a [`Transport`]: a sink for
//! outbound text frames and a stream of inbound ones. Production code uses
//! [`WebSocketConnector`]; tests use the in-memory relays in [`testing`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use super::error::{RelayError, RelayResult};
use super::types::RelayUrl;

/// Outbound half of a session.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = RelayError> + Send>>;

/// Inbound half of a session. The stream ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = RelayResult<String>> + Send>>;

/// An established session with a relay.
pub struct Transport {
    /// Outbound frames.
    pub sink: FrameSink,
    /// Inbound frames.
    pub stream: FrameStream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Decodes a binary websocket frame. Relays speak text JSON, so bytes that
/// are not UTF-8 are a protocol violation, never rewritten.
pub(crate) fn text_from_binary(bytes: Vec<u8>) -> RelayResult<String> {
    String::from_utf8(bytes)
        .map_err(|e| RelayError::ProtocolViolation(format!("binary frame is not UTF-8: {e}")))
}

/// Opens sessions to relays.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connects to the relay.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the session cannot be established.
    async fn connect(&self, url: &RelayUrl) -> RelayResult<Transport>;
}

/// Websocket transport over `tokio-tungstenite` with rustls.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &RelayUrl) -> RelayResult<Transport> {
        let (socket, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|e| RelayError::Transport {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(relay = %url, "websocket established");

        let (sink, stream) = socket.split();

        let sink_url = url.to_string();
        let sink = sink
            .sink_map_err(move |e| RelayError::Transport {
                url: sink_url.clone(),
                reason: e.to_string(),
            })
            .with(|frame: String| future::ready(Ok::<_, RelayError>(Message::Text(frame))));

        let stream_url = url.to_string();
        let stream = stream.filter_map(move |item| {
            let frame = match item {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(text_from_binary(bytes)),
                // Control frames are answered by tungstenite itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_)) => {
                    None
                }
                Err(e) => Some(Err(RelayError::Transport {
                    url: stream_url.clone(),
                    reason: e.to_string(),
                })),
            };
            future::ready(frame)
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// In-memory relays for tests.
///
/// Each [`SimulatedRelay`] accepts connections from a [`SimulatedConnector`]
/// and hands the server side of every session to the test as a
/// [`SimulatedSession`].
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};

    use super::{text_from_binary, Connector, Transport};
    use crate::nostr::Event;
    use crate::relay::error::{RelayError, RelayResult};
    use crate::relay::types::RelayUrl;

    struct Endpoint {
        sessions: mpsc::UnboundedSender<SimulatedSession>,
        reachable: Arc<AtomicBool>,
        attempts: Arc<AtomicU32>,
    }

    /// Connector that routes to registered in-memory relays.
    ///
    /// Unregistered URLs fail to connect.
    #[derive(Clone, Default)]
    pub struct SimulatedConnector {
        endpoints: Arc<Mutex<HashMap<RelayUrl, Endpoint>>>,
    }

    impl SimulatedConnector {
        /// Creates a connector with no relays.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a reachable relay and returns its server handle.
        ///
        /// # Panics
        ///
        /// Panics if `url` is not a valid relay URL.
        #[must_use]
        pub fn relay(&self, url: &str) -> SimulatedRelay {
            let url = RelayUrl::parse(url).expect("valid relay url");
            let (sessions_tx, sessions_rx) = mpsc::unbounded();
            let reachable = Arc::new(AtomicBool::new(true));
            let attempts = Arc::new(AtomicU32::new(0));

            self.endpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    url.clone(),
                    Endpoint {
                        sessions: sessions_tx,
                        reachable: Arc::clone(&reachable),
                        attempts: Arc::clone(&attempts),
                    },
                );

            SimulatedRelay {
                url,
                sessions: sessions_rx,
                reachable,
                attempts,
            }
        }
    }

    #[async_trait]
    impl Connector for SimulatedConnector {
        async fn connect(&self, url: &RelayUrl) -> RelayResult<Transport> {
            let refused = || RelayError::Transport {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            };

            let endpoints = self
                .endpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let endpoint = endpoints.get(url).ok_or_else(refused)?;
            endpoint.attempts.fetch_add(1, Ordering::SeqCst);
            if !endpoint.reachable.load(Ordering::SeqCst) {
                return Err(refused());
            }

            let (client_tx, server_rx) = mpsc::unbounded::<String>();
            let (server_tx, client_rx) = mpsc::unbounded::<RelayResult<String>>();
            endpoint
                .sessions
                .unbounded_send(SimulatedSession {
                    incoming: server_rx,
                    outgoing: server_tx,
                })
                .map_err(|_| refused())?;
            drop(endpoints);

            let sink_url = url.to_string();
            Ok(Transport {
                sink: Box::pin(client_tx.sink_map_err(move |e| RelayError::Transport {
                    url: sink_url.clone(),
                    reason: e.to_string(),
                })),
                stream: Box::pin(client_rx),
            })
        }
    }

    /// Server side of a simulated relay.
    pub struct SimulatedRelay {
        url: RelayUrl,
        sessions: mpsc::UnboundedReceiver<SimulatedSession>,
        reachable: Arc<AtomicBool>,
        attempts: Arc<AtomicU32>,
    }

    impl SimulatedRelay {
        /// The relay's URL.
        #[must_use]
        pub const fn url(&self) -> &RelayUrl {
            &self.url
        }

        /// Waits for the next client session.
        pub async fn accept(&mut self) -> Option<SimulatedSession> {
            self.sessions.next().await
        }

        /// Makes future connection attempts succeed or fail.
        pub fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
        }

        /// Number of connection attempts seen so far.
        #[must_use]
        pub fn connect_attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    /// Server side of one client session. Dropping it closes the session.
    pub struct SimulatedSession {
        incoming: mpsc::UnboundedReceiver<String>,
        outgoing: mpsc::UnboundedSender<RelayResult<String>>,
    }

    impl SimulatedSession {
        /// Next raw frame sent by the client, or `None` once it disconnects.
        pub async fn recv(&mut self) -> Option<String> {
            self.incoming.next().await
        }

        /// Next frame sent by the client, parsed as JSON.
        ///
        /// # Panics
        ///
        /// Panics if the client sent invalid JSON.
        pub async fn recv_json(&mut self) -> Option<Value> {
            let frame = self.recv().await?;
            Some(serde_json::from_str(&frame).expect("client frames are JSON"))
        }

        /// Waits for the next `REQ` and returns its subscription id and filters.
        pub async fn expect_req(&mut self) -> Option<(String, Vec<Value>)> {
            loop {
                let frame = self.recv_json().await?;
                if frame[0] == "REQ" {
                    let id = frame[1].as_str().unwrap_or_default().to_string();
                    let filters = frame
                        .as_array()
                        .map(|items| items.iter().skip(2).cloned().collect())
                        .unwrap_or_default();
                    return Some((id, filters));
                }
            }
        }

        /// Sends a raw text frame to the client.
        pub fn send_raw(&self, frame: impl Into<String>) {
            let _ = self.outgoing.unbounded_send(Ok(frame.into()));
        }

        /// Sends a JSON frame to the client.
        pub fn send_json(&self, frame: &Value) {
            self.send_raw(frame.to_string());
        }

        /// Sends `["EVENT", sub, event]`.
        pub fn send_event(&self, subscription_id: &str, event: &Event) {
            self.send_json(&json!(["EVENT", subscription_id, event]));
        }

        /// Sends `["EOSE", sub]`.
        pub fn send_eose(&self, subscription_id: &str) {
            self.send_json(&json!(["EOSE", subscription_id]));
        }

        /// Sends `["OK", id, accepted, message]`.
        pub fn send_ok(&self, event_id: &str, accepted: bool, message: &str) {
            self.send_json(&json!(["OK", event_id, accepted, message]));
        }

        /// Sends `["CLOSED", sub, message]`.
        pub fn send_closed(&self, subscription_id: &str, message: &str) {
            self.send_json(&json!(["CLOSED", subscription_id, message]));
        }

        /// Sends `["NOTICE", message]`.
        pub fn send_notice(&self, message: &str) {
            self.send_json(&json!(["NOTICE", message]));
        }

        /// Sends a binary frame, decoded the way the websocket transport does.
        pub fn send_binary(&self, bytes: &[u8]) {
            let _ = self.outgoing.unbounded_send(text_from_binary(bytes.to_vec()));
        }

        /// Injects a transport error on the client's read side.
        pub fn fail(&self, reason: &str) {
            let _ = self.outgoing.unbounded_send(Err(RelayError::Transport {
                url: "simulated".to_string(),
                reason: reason.to_string(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::SimulatedConnector;
    use super::*;

    #[tokio::test]
    async fn simulated_session_carries_frames_both_ways() {
        let connector = SimulatedConnector::new();
        let mut relay = connector.relay("wss://sim.example");

        let mut transport = connector.connect(relay.url()).await.unwrap();
        let mut session = relay.accept().await.unwrap();

        transport.sink.send("hello".to_string()).await.unwrap();
        assert_eq!(session.recv().await.as_deref(), Some("hello"));

        session.send_notice("hi");
        let frame = transport.stream.next().await.unwrap().unwrap();
        assert_eq!(frame, r#"["NOTICE","hi"]"#);

        drop(session);
        assert!(transport.stream.next().await.is_none());
    }

    #[test]
    fn binary_frames_must_be_utf8() {
        assert_eq!(
            text_from_binary(br#"["EOSE","s"]"#.to_vec()).unwrap(),
            r#"["EOSE","s"]"#
        );
        assert!(matches!(
            text_from_binary(vec![b'[', 0xff, 0xfe, b']']),
            Err(RelayError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_and_unknown_relays_refuse() {
        let connector = SimulatedConnector::new();
        let relay = connector.relay("wss://down.example");
        relay.set_reachable(false);

        assert!(matches!(
            connector.connect(relay.url()).await,
            Err(RelayError::Transport { .. })
        ));
        assert_eq!(relay.connect_attempts(), 1);

        let unknown = RelayUrl::parse("wss://unknown.example").unwrap();
        assert!(connector.connect(&unknown).await.is_err());
    }
}
