//! A single relay session with automatic reconnection.
//!
//! Each [`RelayConnection`] owns one background task that walks the state
//! machine
//!
//! ```text
//! Disconnected → Connecting → Connected → BackingOff → Connecting → …
//!                                   any state ── close() ──▶ Closed
//! ```
//!
//! and forwards every well-formed inbound frame, in arrival order, into the
//! owner's notification channel. Nothing is buffered across a disconnect:
//! outbound requests made while not connected fail with
//! [`RelayError::NotConnected`], and pending `OK` waiters are dropped when
//! the session ends.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::ExponentialBackoff;
use super::error::{RelayError, RelayResult};
use super::message::{ClientMessage, RelayMessage};
use super::transport::{Connector, FrameSink, Transport};
use super::types::{RelayNotification, RelaySnapshot, RelayStatus, RelayUrl};
use crate::nostr::{Event, Filter};

/// Depth of each connection's command queue.
const COMMAND_BUFFER: usize = 64;

/// Timing and tolerance knobs for a relay connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Deadline for establishing a session.
    pub connect_timeout: Duration,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay cap.
    pub backoff_max: Duration,
    /// Jitter fraction applied to reconnect delays, below 1.
    pub backoff_jitter: f64,
    /// A session must stay up this long before the attempt counter resets.
    pub stable_after: Duration,
    /// Consecutive unparseable frames tolerated before forcing a reconnect.
    pub max_protocol_violations: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            backoff_jitter: 0.2,
            stable_after: Duration::from_secs(30),
            max_protocol_violations: 10,
        }
    }
}

/// A relay's answer to a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkReply {
    /// Whether the relay accepted the event.
    pub accepted: bool,
    /// Relay-supplied message, possibly empty.
    pub message: String,
}

type Ack = oneshot::Sender<RelayResult<()>>;

enum Command {
    Subscribe {
        subscription_id: String,
        filters: Vec<Filter>,
        ack: Ack,
    },
    Unsubscribe {
        subscription_id: String,
        ack: Ack,
    },
    Publish {
        event: Event,
        reply: oneshot::Sender<OkReply>,
        ack: Ack,
    },
}

impl Command {
    fn reject(self, error: RelayError) {
        let ack = match self {
            Self::Subscribe { ack, .. } | Self::Unsubscribe { ack, .. } | Self::Publish { ack, .. } => {
                ack
            }
        };
        let _ = ack.send(Err(error));
    }
}

#[derive(Debug)]
struct SharedState {
    status: RelayStatus,
    subscriptions: BTreeSet<String>,
    last_message_at: Option<i64>,
    reconnect_attempts: u32,
    protocol_violations: u64,
}

fn lock(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one relay's background session task.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct RelayConnection {
    url: RelayUrl,
    shared: Arc<Mutex<SharedState>>,
    commands: mpsc::Sender<Command>,
    notifications: mpsc::Sender<RelayNotification>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Spawns the session task and starts connecting.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn open(
        url: RelayUrl,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
        notifications: mpsc::Sender<RelayNotification>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(SharedState {
            status: RelayStatus::Disconnected,
            subscriptions: BTreeSet::new(),
            last_message_at: None,
            reconnect_attempts: 0,
            protocol_violations: 0,
        }));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);

        let backoff = ExponentialBackoff::new(
            settings.backoff_base,
            settings.backoff_max,
            settings.backoff_jitter,
        );
        let worker = Worker {
            url: url.clone(),
            connector,
            settings,
            backoff,
            shared: Arc::clone(&shared),
            notifications: notifications.clone(),
            pending: HashMap::new(),
        };
        let task = tokio::spawn(worker.run(commands_rx));

        Self {
            url,
            shared,
            commands: commands_tx,
            notifications,
            task: Mutex::new(Some(task)),
        }
    }

    /// The relay's URL.
    #[must_use]
    pub const fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        lock(&self.shared).status
    }

    /// Point-in-time view of the connection.
    #[must_use]
    pub fn snapshot(&self) -> RelaySnapshot {
        let state = lock(&self.shared);
        RelaySnapshot {
            url: self.url.clone(),
            status: state.status,
            subscriptions: state.subscriptions.len(),
            last_message_at: state.last_message_at,
            reconnect_attempts: state.reconnect_attempts,
            protocol_violations: state.protocol_violations,
        }
    }

    async fn submit(&self, build: impl FnOnce(Ack) -> Command) -> RelayResult<()> {
        match self.status() {
            RelayStatus::Connected => {}
            RelayStatus::Closed => return Err(RelayError::Closed(self.url.to_string())),
            _ => return Err(RelayError::NotConnected(self.url.to_string())),
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(build(ack_tx))
            .await
            .map_err(|_| RelayError::Closed(self.url.to_string()))?;
        ack_rx
            .await
            .map_err(|_| RelayError::Closed(self.url.to_string()))?
    }

    /// Sends `REQ` for the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotConnected`] unless the relay is connected, or
    /// a transport error if the write fails.
    pub async fn subscribe(&self, subscription_id: &str, filters: &[Filter]) -> RelayResult<()> {
        self.submit(|ack| Command::Subscribe {
            subscription_id: subscription_id.to_string(),
            filters: filters.to_vec(),
            ack,
        })
        .await
    }

    /// Sends `CLOSE` for the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotConnected`] unless the relay is connected.
    pub async fn unsubscribe(&self, subscription_id: &str) -> RelayResult<()> {
        self.submit(|ack| Command::Unsubscribe {
            subscription_id: subscription_id.to_string(),
            ack,
        })
        .await
    }

    /// Sends `EVENT` and returns a receiver for the relay's `OK`.
    ///
    /// The receiver errors if the session ends before `OK` arrives.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotConnected`] unless the relay is connected.
    pub async fn send_event(&self, event: &Event) -> RelayResult<oneshot::Receiver<OkReply>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(|ack| Command::Publish {
            event: event.clone(),
            reply: reply_tx,
            ack,
        })
        .await?;
        Ok(reply_rx)
    }

    /// Stops the session task and drops the socket. Terminal.
    pub async fn close(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        task.abort();
        let _ = task.await;

        {
            let mut state = lock(&self.shared);
            state.status = RelayStatus::Closed;
            state.subscriptions.clear();
        }
        let _ = self.notifications.try_send(RelayNotification::Status {
            relay: self.url.clone(),
            status: RelayStatus::Closed,
        });
        info!(relay = %self.url, "relay connection closed");
    }

    /// Returns `true` once [`Self::close`] has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status() == RelayStatus::Closed
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

enum SessionEnd {
    /// Transport failed, the peer closed, or too many violations.
    Lost,
    /// The owner is gone; stop the task.
    Shutdown,
}

struct Worker {
    url: RelayUrl,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    backoff: ExponentialBackoff,
    shared: Arc<Mutex<SharedState>>,
    notifications: mpsc::Sender<RelayNotification>,
    pending: HashMap<String, oneshot::Sender<OkReply>>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            if !self.set_status(RelayStatus::Connecting).await {
                return;
            }

            let connector = Arc::clone(&self.connector);
            let url = self.url.clone();
            let connect = tokio::time::timeout(self.settings.connect_timeout, async move {
                connector.connect(&url).await
            });
            tokio::pin!(connect);

            let outcome = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    command = commands.recv() => match command {
                        Some(command) => command.reject(RelayError::NotConnected(self.url.to_string())),
                        None => return,
                    },
                }
            };

            match outcome {
                Ok(Ok(transport)) => {
                    info!(relay = %self.url, "relay connected");
                    if !self.set_status(RelayStatus::Connected).await {
                        return;
                    }
                    let connected_at = Instant::now();
                    let end = self.session(transport, &mut commands).await;
                    self.end_session();
                    if matches!(end, SessionEnd::Shutdown) {
                        return;
                    }
                    if connected_at.elapsed() >= self.settings.stable_after {
                        self.backoff.reset();
                    }
                }
                Ok(Err(e)) => warn!(relay = %self.url, error = %e, "relay connection failed"),
                Err(_) => warn!(
                    relay = %self.url,
                    timeout = ?self.settings.connect_timeout,
                    "relay connection timed out"
                ),
            }

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            lock(&self.shared).reconnect_attempts = attempt;
            debug!(relay = %self.url, attempt, ?delay, "backing off");
            if !self
                .set_status(RelayStatus::BackingOff { attempt, delay })
                .await
            {
                return;
            }

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    command = commands.recv() => match command {
                        Some(command) => command.reject(RelayError::NotConnected(self.url.to_string())),
                        None => return,
                    },
                }
            }
        }
    }

    async fn session(
        &mut self,
        transport: Transport,
        commands: &mut mpsc::Receiver<Command>,
    ) -> SessionEnd {
        let Transport { mut sink, mut stream } = transport;
        let mut consecutive_violations = 0u32;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(text)) => {
                        lock(&self.shared).last_message_at = Some(Utc::now().timestamp());
                        match RelayMessage::from_json(&text) {
                            Ok(message) => {
                                consecutive_violations = 0;
                                if !self.handle_message(message).await {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            Err(e) => {
                                if self.violation(&mut consecutive_violations, &e) {
                                    return SessionEnd::Lost;
                                }
                            }
                        }
                    }
                    Some(Err(e @ RelayError::ProtocolViolation(_))) => {
                        if self.violation(&mut consecutive_violations, &e) {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(relay = %self.url, error = %e, "relay transport error");
                        return SessionEnd::Lost;
                    }
                    None => {
                        info!(relay = %self.url, "relay closed the connection");
                        return SessionEnd::Lost;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.execute(command, &mut sink).await {
                            warn!(relay = %self.url, error = %e, "relay write failed");
                            return SessionEnd::Lost;
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },
            }
        }
    }

    /// Records an unusable frame. Returns `true` once the streak exceeds the
    /// budget and the session should be dropped.
    fn violation(&self, streak: &mut u32, error: &RelayError) -> bool {
        *streak += 1;
        lock(&self.shared).protocol_violations += 1;
        warn!(relay = %self.url, error = %error, "dropping invalid frame");
        if *streak > self.settings.max_protocol_violations {
            warn!(
                relay = %self.url,
                violations = *streak,
                "too many protocol violations, reconnecting"
            );
            return true;
        }
        false
    }

    /// Returns `false` if the owner has gone away.
    async fn handle_message(&mut self, message: RelayMessage) -> bool {
        match &message {
            RelayMessage::Ok {
                event_id,
                accepted,
                message: reason,
            } => {
                if let Some(reply) = self.pending.remove(event_id) {
                    let _ = reply.send(OkReply {
                        accepted: *accepted,
                        message: reason.clone(),
                    });
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message: reason,
            } => {
                lock(&self.shared).subscriptions.remove(subscription_id);
                debug!(relay = %self.url, %subscription_id, %reason, "relay closed subscription");
            }
            RelayMessage::Notice { message: text } => {
                info!(relay = %self.url, notice = %text, "relay notice");
            }
            RelayMessage::Event { .. } | RelayMessage::Eose { .. } => {}
        }

        self.notifications
            .send(RelayNotification::Message {
                relay: self.url.clone(),
                message,
            })
            .await
            .is_ok()
    }

    /// Performs one outbound command. An `Err` means the transport is broken.
    async fn execute(&mut self, command: Command, sink: &mut FrameSink) -> RelayResult<()> {
        match command {
            Command::Subscribe {
                subscription_id,
                filters,
                ack,
            } => {
                let frame = ClientMessage::Req {
                    subscription_id: subscription_id.clone(),
                    filters,
                };
                let result = self.write(sink, &frame).await;
                if matches!(result, Ok(true)) {
                    lock(&self.shared).subscriptions.insert(subscription_id);
                }
                Self::finish(result, ack)
            }
            Command::Unsubscribe {
                subscription_id,
                ack,
            } => {
                lock(&self.shared).subscriptions.remove(&subscription_id);
                let frame = ClientMessage::Close { subscription_id };
                let result = self.write(sink, &frame).await;
                Self::finish(result, ack)
            }
            Command::Publish { event, reply, ack } => {
                let event_id = event.id_hex();
                // Waiters that gave up (timed out or dropped) are forgotten.
                self.pending.retain(|_, waiter| !waiter.is_closed());
                self.pending.insert(event_id.clone(), reply);
                let result = self.write(sink, &ClientMessage::Event(event)).await;
                if !matches!(result, Ok(true)) {
                    self.pending.remove(&event_id);
                }
                Self::finish(result, ack)
            }
        }
    }

    /// `Ok(true)` when written, `Ok(false)` when the frame could not be
    /// encoded (reported to the caller only), `Err` on transport failure.
    async fn write(&self, sink: &mut FrameSink, frame: &ClientMessage) -> RelayResult<bool> {
        match frame.to_json() {
            Ok(text) => {
                sink.send(text).await?;
                Ok(true)
            }
            Err(e) => {
                warn!(relay = %self.url, error = %e, "cannot encode frame");
                Ok(false)
            }
        }
    }

    fn finish(result: RelayResult<bool>, ack: Ack) -> RelayResult<()> {
        match result {
            Ok(true) => {
                let _ = ack.send(Ok(()));
                Ok(())
            }
            Ok(false) => {
                let _ = ack.send(Err(RelayError::Serialization(
                    "frame could not be encoded".to_string(),
                )));
                Ok(())
            }
            Err(e) => {
                let _ = ack.send(Err(e.clone()));
                Err(e)
            }
        }
    }

    fn end_session(&mut self) {
        // Dropping the senders wakes every publisher still waiting for OK.
        self.pending.clear();
        lock(&self.shared).subscriptions.clear();
    }

    /// Records and announces a status change. Returns `false` if the owner
    /// has gone away.
    async fn set_status(&self, status: RelayStatus) -> bool {
        lock(&self.shared).status = status;
        self.notifications
            .send(RelayNotification::Status {
                relay: self.url.clone(),
                status,
            })
            .await
            .is_ok()
    }
}
