//! Presentation-layer interface.
//!
//! [`GnostrCore`] is the single entry point a front end talks to: live
//! subscription streams, point-in-time store queries, publishing with a
//! per-relay report, and relay status notifications. Key material never
//! crosses this boundary; only the public identity does.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveError, EventArchive};
use crate::config::{ClientConfig, ConfigError};
use crate::nostr::{
    Event, EventDraft, Filter, IdentityError, IdentityManager, PublicIdentity, Signer, TagBuilder,
    KIND_CONTACTS, KIND_METADATA, KIND_REACTION, KIND_REPOST, KIND_RELAY_LIST, KIND_TEXT_NOTE,
};
use crate::publisher::{PublishError, Publisher};
use crate::relay::{
    Connector, PublishReport, RelayError, RelaySnapshot, RelayUrl, WebSocketConnector,
};
use crate::social::{EngagementMetrics, Profile, SocialIndex, SocialUpdate};
use crate::store::{EventStore, QueryIter, QueryOrder};
use crate::subscription::{
    EventObserver, ManagerSettings, RelayStats, StatusChange, SubscriptionHandle,
    SubscriptionManager, SubscriptionPolicy,
};

/// Depth of the social update broadcast.
const SOCIAL_BUFFER: usize = 256;

/// Replies fetched with a thread.
const THREAD_REPLY_LIMIT: usize = 50;

/// Reactions and reposts fetched with a thread.
const THREAD_ENGAGEMENT_LIMIT: usize = 100;

/// Errors surfaced by [`GnostrCore`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// Key custody failed or no identity is loaded.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The event could not be produced.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Configuration could not be loaded or saved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The local archive failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A relay address was rejected.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Result type for facade operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Configuration shared with the indexer, persisted on change.
struct ConfigHandle {
    config: Mutex<ClientConfig>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    fn lock(&self) -> MutexGuard<'_, ClientConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, config: &ClientConfig) -> Result<()> {
        if let Some(path) = &self.path {
            config.save(path)?;
        }
        Ok(())
    }
}

/// Feeds newly stored events into the social index and archive.
struct Indexer {
    identity: Arc<IdentityManager>,
    social: Arc<SocialIndex>,
    archive: Option<Arc<EventArchive>>,
    updates: broadcast::Sender<SocialUpdate>,
    config: Arc<ConfigHandle>,
    manager: Weak<SubscriptionManager>,
}

impl Indexer {
    fn index(&self, event: &Event) {
        let updates = self.social.ingest(event);

        if let Some(archive) = &self.archive {
            if let Err(e) = self.archive_event(archive, event, &updates) {
                warn!(event_id = %event.id_hex(), error = %e, "archive write failed");
            }
        }

        let own = self.identity.public_key().ok().map(hex::encode);
        for update in updates {
            if let SocialUpdate::RelayList(pubkey) = &update {
                if own.as_deref() == Some(pubkey.as_str()) {
                    self.merge_relays(&self.social.relay_list(pubkey));
                }
            }
            let _ = self.updates.send(update);
        }
    }

    fn archive_event(
        &self,
        archive: &EventArchive,
        event: &Event,
        updates: &[SocialUpdate],
    ) -> std::result::Result<(), ArchiveError> {
        archive.save_event(event)?;
        for update in updates {
            match update {
                SocialUpdate::Profile(pubkey) => {
                    if let Some(profile) = self.social.profile(pubkey) {
                        archive.save_profile(pubkey, &profile)?;
                    }
                }
                SocialUpdate::Contacts(pubkey) => {
                    archive.save_following(pubkey, &self.social.following(pubkey))?;
                }
                SocialUpdate::RelayList(_) | SocialUpdate::Metrics { .. } => {}
            }
        }
        Ok(())
    }

    /// Adds relays the user advertises that are not configured yet.
    fn merge_relays(&self, relays: &[RelayUrl]) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut config = self.config.lock();
        let mut changed = false;
        for url in relays {
            if matches!(config.add_relay(url.as_str()), Ok(true)) {
                info!(relay = %url, "adding relay from own relay list");
                manager.add_relay(url.clone());
                changed = true;
            }
        }
        if changed {
            if let Err(e) = self.config.persist(&config) {
                warn!(error = %e, "could not save merged relay list");
            }
        }
    }
}

impl EventObserver for Indexer {
    fn on_event(&self, event: &Event, _relay: &RelayUrl) {
        self.index(event);
    }
}

/// Builder for [`GnostrCore`].
pub struct GnostrCoreBuilder {
    identity: Arc<IdentityManager>,
    config: ClientConfig,
    config_path: Option<PathBuf>,
    connector: Arc<dyn Connector>,
    archive: Option<Arc<EventArchive>>,
}

impl GnostrCoreBuilder {
    /// Uses this configuration instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Saves relay list changes to this file.
    #[must_use]
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Opens relay sessions through this connector instead of websockets.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Persists accepted events, profiles and follow lists.
    #[must_use]
    pub fn archive(mut self, archive: Arc<EventArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Starts the core and connects to every configured relay.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn build(self) -> GnostrCore {
        let store = Arc::new(EventStore::new(self.config.max_events));
        let manager = Arc::new(SubscriptionManager::new(
            self.connector,
            store,
            ManagerSettings::from(&self.config),
        ));
        let publisher = Publisher::new(
            Arc::clone(&self.identity) as Arc<dyn Signer>,
            self.config.publish_timeout(),
            self.config.validation.clone(),
        );
        let relays = self.config.relay_urls();
        let config = Arc::new(ConfigHandle {
            config: Mutex::new(self.config),
            path: self.config_path,
        });

        let (updates, _) = broadcast::channel(SOCIAL_BUFFER);
        let indexer = Arc::new(Indexer {
            identity: Arc::clone(&self.identity),
            social: Arc::new(SocialIndex::new()),
            archive: self.archive,
            updates,
            config: Arc::clone(&config),
            manager: Arc::downgrade(&manager),
        });
        manager.add_observer(Arc::clone(&indexer) as Arc<dyn EventObserver>);

        for url in relays {
            manager.add_relay(url);
        }
        info!(relays = manager.relays().len(), "gnostr core started");

        GnostrCore {
            identity: self.identity,
            manager,
            publisher,
            indexer,
            config,
            requested_profiles: Mutex::new(HashSet::new()),
        }
    }
}

/// Nostr client core: relays, subscriptions, store, publishing and identity.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use gnostr_core::GnostrCore;
/// use gnostr_core::nostr::{EventDraft, Filter, IdentityManager, SecureKeyStorage};
/// use gnostr_core::subscription::SubscriptionPolicy;
///
/// # async fn run(storage: Arc<dyn SecureKeyStorage>) -> Result<(), gnostr_core::CoreError> {
/// let identity = Arc::new(IdentityManager::new(storage));
/// identity.load_or_generate()?;
///
/// let core = GnostrCore::builder(identity).build();
/// let mut timeline = core.subscribe(
///     vec![Filter::new().kind(1).limit(50)],
///     SubscriptionPolicy::HistoricalThenLive,
/// );
/// let report = core.publish(&EventDraft::text_note("hello nostr")).await?;
/// println!("accepted by {} relays", report.success_count());
/// while let Some(item) = timeline.recv().await {
///     println!("{item:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct GnostrCore {
    identity: Arc<IdentityManager>,
    manager: Arc<SubscriptionManager>,
    publisher: Publisher,
    indexer: Arc<Indexer>,
    config: Arc<ConfigHandle>,
    requested_profiles: Mutex<HashSet<String>>,
}

impl GnostrCore {
    /// Starts configuring a core that signs with `identity`.
    #[must_use]
    pub fn builder(identity: Arc<IdentityManager>) -> GnostrCoreBuilder {
        GnostrCoreBuilder {
            identity,
            config: ClientConfig::default(),
            config_path: None,
            connector: Arc::new(WebSocketConnector),
            archive: None,
        }
    }

    /// Starts a core with the configuration and archive in their per-user
    /// default locations.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or the archive
    /// cannot be opened.
    pub fn open_default(identity: Arc<IdentityManager>) -> Result<Self> {
        let config_path = ClientConfig::default_path()?;
        let config = ClientConfig::load(&config_path)?;
        let archive_path = dirs::data_dir()
            .map(|dir| dir.join("gnostr").join("gnostr.db"))
            .ok_or(ConfigError::NoConfigDir)?;
        let archive = EventArchive::open(&archive_path)?;

        Ok(Self::builder(identity)
            .config(config)
            .config_path(config_path)
            .archive(Arc::new(archive))
            .build())
    }

    // ==================== Identity ====================

    /// Public half of the loaded identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyUnavailable`] if no identity is loaded.
    pub fn public_identity(&self) -> Result<PublicIdentity> {
        Ok(self.identity.public_identity()?)
    }

    /// Returns `true` if an identity is loaded.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        self.identity.has_identity()
    }

    fn own_pubkey(&self) -> Result<String> {
        Ok(hex::encode(self.identity.public_key()?))
    }

    // ==================== Subscriptions & store ====================

    /// Opens a live subscription on every relay.
    #[must_use]
    pub fn subscribe(&self, filters: Vec<Filter>, policy: SubscriptionPolicy) -> SubscriptionHandle {
        self.manager.subscribe(filters, policy)
    }

    /// Closes a subscription and sends `CLOSE` to its relays.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.manager.unsubscribe(handle)
    }

    /// Stored events matching `filter`, newest first.
    #[must_use]
    pub fn query(&self, filter: &Filter) -> QueryIter {
        self.manager.store().query(filter)
    }

    /// Stored events matching `filter` in the requested order.
    #[must_use]
    pub fn query_ordered(&self, filter: &Filter, order: QueryOrder) -> QueryIter {
        self.manager.store().query_ordered(filter, order)
    }

    /// The in-memory event store.
    #[must_use]
    pub fn store(&self) -> &Arc<EventStore> {
        self.manager.store()
    }

    // ==================== Publishing ====================

    /// Signs `draft` and sends it to every relay.
    ///
    /// The event is also stored and indexed locally.
    ///
    /// # Errors
    ///
    /// Returns an error only if the event could not be signed or validated;
    /// per-relay failures are in the report.
    pub async fn publish(&self, draft: &EventDraft) -> Result<PublishReport> {
        let (event, report) = self
            .publisher
            .publish(draft, &self.manager.connections())
            .await?;
        if self.manager.store().insert(event.clone()) {
            self.indexer.index(&event);
        }
        Ok(report)
    }

    /// Publishes a text note.
    ///
    /// # Errors
    ///
    /// See [`Self::publish`].
    pub async fn publish_text_note(&self, content: &str) -> Result<PublishReport> {
        self.publish(&EventDraft::text_note(content)).await
    }

    /// Reacts to `target` (`"+"` is a like).
    ///
    /// # Errors
    ///
    /// See [`Self::publish`].
    pub async fn react(&self, target: &Event, reaction: &str) -> Result<PublishReport> {
        let draft = EventDraft::new(KIND_REACTION, reaction)
            .tag(TagBuilder::e_tag(&target.id_hex(), None, None))
            .tag(TagBuilder::p_tag(&target.pubkey_hex()));
        self.publish(&draft).await
    }

    /// Replies to `target`, referencing it as the root.
    ///
    /// # Errors
    ///
    /// See [`Self::publish`].
    pub async fn reply(&self, target: &Event, content: &str) -> Result<PublishReport> {
        let draft = EventDraft::text_note(content)
            .tag(TagBuilder::e_tag(&target.id_hex(), None, Some("root")))
            .tag(TagBuilder::p_tag(&target.pubkey_hex()));
        self.publish(&draft).await
    }

    /// Publishes the configured relays as the user's relay list (kind 10002).
    ///
    /// # Errors
    ///
    /// See [`Self::publish`].
    pub async fn publish_relay_list(&self) -> Result<PublishReport> {
        let relays = self.config.lock().relay_urls();
        let draft = EventDraft::new(KIND_RELAY_LIST, "")
            .tags(relays.iter().map(|url| TagBuilder::r_tag(url.as_str(), None)));
        self.publish(&draft).await
    }

    // ==================== Relays ====================

    /// Adds a relay, connects to it and saves the configuration.
    /// Returns `false` if it was already configured.
    ///
    /// With an identity loaded the updated relay list (kind 10002) is
    /// republished.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-websocket URL or if saving fails.
    pub async fn add_relay(&self, url: &str) -> Result<bool> {
        let url = RelayUrl::parse(url)?;
        {
            let mut config = self.config.lock();
            if !config.add_relay(url.as_str())? {
                return Ok(false);
            }
            self.manager.add_relay(url);
            self.config.persist(&config)?;
        }
        self.republish_relay_list().await;
        Ok(true)
    }

    /// Disconnects from a relay and removes it from the configuration.
    /// Returns `false` if it was not configured.
    ///
    /// With an identity loaded the updated relay list (kind 10002) is
    /// republished.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid URL or if saving fails.
    pub async fn remove_relay(&self, url: &str) -> Result<bool> {
        let url = RelayUrl::parse(url)?;
        let removed = {
            let mut config = self.config.lock();
            let removed = config.remove_relay(&url);
            if removed {
                self.config.persist(&config)?;
            }
            removed
        };
        let disconnected = self.manager.remove_relay(&url).await;
        if removed {
            self.republish_relay_list().await;
        }
        Ok(removed || disconnected)
    }

    /// Relay edits stand even if the list cannot be published.
    async fn republish_relay_list(&self) {
        if !self.has_identity() {
            return;
        }
        match self.publish_relay_list().await {
            Ok(report) => debug!(
                accepted = report.success_count(),
                attempted = report.total_attempted(),
                "relay list republished"
            ),
            Err(e) => warn!(error = %e, "failed to republish relay list"),
        }
    }

    /// Configured relay addresses.
    #[must_use]
    pub fn relays(&self) -> Vec<RelayUrl> {
        self.config.lock().relay_urls()
    }

    /// Status snapshot of every relay.
    #[must_use]
    pub fn relay_statuses(&self) -> Vec<RelaySnapshot> {
        self.manager.relay_statuses()
    }

    /// Stream of relay status changes.
    #[must_use]
    pub fn status_events(&self) -> broadcast::Receiver<StatusChange> {
        self.manager.status_events()
    }

    /// Delivery counters for one relay.
    #[must_use]
    pub fn relay_stats(&self, url: &RelayUrl) -> RelayStats {
        self.manager.relay_stats(url)
    }

    /// Every relay that served the event.
    #[must_use]
    pub fn relay_credits(&self, event_id: &[u8; 32]) -> Vec<RelayUrl> {
        self.manager.relay_credits(event_id)
    }

    // ==================== Social ====================

    /// Stream of profile, contact, relay list and engagement changes.
    #[must_use]
    pub fn social_updates(&self) -> broadcast::Receiver<SocialUpdate> {
        self.indexer.updates.subscribe()
    }

    /// Latest known profile, from memory or the archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive read fails.
    pub fn profile(&self, pubkey: &str) -> Result<Option<Profile>> {
        if let Some(profile) = self.indexer.social.profile(pubkey) {
            return Ok(Some(profile));
        }
        match &self.indexer.archive {
            Some(archive) => Ok(archive.profile(pubkey)?),
            None => Ok(None),
        }
    }

    /// Pubkeys the user follows.
    ///
    /// # Errors
    ///
    /// Returns an error if no identity is loaded or the archive read fails.
    pub fn following(&self) -> Result<Vec<String>> {
        let owner = self.own_pubkey()?;
        let follows = self.indexer.social.following(&owner);
        if !follows.is_empty() {
            return Ok(follows);
        }
        match &self.indexer.archive {
            Some(archive) => Ok(archive.following(&owner)?),
            None => Ok(follows),
        }
    }

    /// Engagement counts for a note.
    #[must_use]
    pub fn metrics(&self, event_id: &str) -> EngagementMetrics {
        self.indexer.social.metrics(event_id)
    }

    /// Newest text notes from followed users, from the archive when one is
    /// configured and the in-memory store otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if no identity is loaded or the archive read fails.
    pub fn feed_following(&self, limit: usize) -> Result<Vec<Event>> {
        let owner = self.own_pubkey()?;
        if let Some(archive) = &self.indexer.archive {
            return Ok(archive.feed_following(&owner, limit)?);
        }
        let follows = self.following()?;
        if follows.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::new()
            .kind(KIND_TEXT_NOTE)
            .authors(follows)
            .limit(limit);
        Ok(self.query(&filter).collect())
    }

    /// Requests the latest profile of `pubkey`, once per pubkey.
    ///
    /// Returns `None` if it was requested before.
    #[must_use]
    pub fn fetch_profile(&self, pubkey: &str) -> Option<SubscriptionHandle> {
        let first = self
            .requested_profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pubkey.to_string());
        first.then(|| {
            self.subscribe(
                vec![Filter::new().kind(KIND_METADATA).author(pubkey).limit(1)],
                SubscriptionPolicy::HistoricalThenLive,
            )
        })
    }

    /// Requests the user's latest contact list.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyUnavailable`] if no identity is loaded.
    pub fn fetch_contacts(&self) -> Result<SubscriptionHandle> {
        let owner = self.own_pubkey()?;
        Ok(self.subscribe(
            vec![Filter::new().kind(KIND_CONTACTS).author(owner).limit(1)],
            SubscriptionPolicy::HistoricalThenLive,
        ))
    }

    /// Requests the user's latest relay list. Relays found in it are added.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::KeyUnavailable`] if no identity is loaded.
    pub fn fetch_relay_list(&self) -> Result<SubscriptionHandle> {
        let owner = self.own_pubkey()?;
        Ok(self.subscribe(
            vec![Filter::new().kind(KIND_RELAY_LIST).author(owner).limit(1)],
            SubscriptionPolicy::HistoricalThenLive,
        ))
    }

    /// Requests a note with its replies, reactions and reposts.
    #[must_use]
    pub fn fetch_thread(&self, root_id: &str) -> SubscriptionHandle {
        self.subscribe(
            vec![
                Filter::new().id(root_id),
                Filter::new()
                    .kind(KIND_TEXT_NOTE)
                    .event_ref(root_id)
                    .limit(THREAD_REPLY_LIMIT),
                Filter::new()
                    .kinds([KIND_REPOST, KIND_REACTION])
                    .event_ref(root_id)
                    .limit(THREAD_ENGAGEMENT_LIMIT),
            ],
            SubscriptionPolicy::HistoricalThenLive,
        )
    }

    // ==================== Lifecycle ====================

    /// Closes every subscription and relay connection.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

impl std::fmt::Debug for GnostrCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GnostrCore")
            .field("identity", &self.identity)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}
