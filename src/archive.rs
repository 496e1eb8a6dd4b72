//! `SQLite` archive of accepted events.
//!
//! Keeps events, profiles and follow lists across restarts so a client can
//! render a feed before any relay has answered. Events read back are
//! re-validated; a tampered row is skipped, never returned.

// SQLite operations need to hold the lock for the duration of the operation.
#![allow(clippy::significant_drop_tightening)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::warn;

use crate::nostr::{validate, Event, RawEvent, ValidationPolicy, KIND_TEXT_NOTE};
use crate::social::Profile;

/// Error type for archive operations.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error from `SQLite`.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored value could not be encoded or decoded.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

const EVENT_COLUMNS: &str = "id, pubkey, created_at, kind, content, tags, sig";

type EventRow = (String, String, i64, i64, String, String, String);

/// Thread-safe wrapper around a `SQLite` connection.
pub struct EventArchive {
    conn: Mutex<Connection>,
}

impl EventArchive {
    /// Opens (or creates) the archive at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ArchiveError::Storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    /// Creates an in-memory archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let archive = Self {
            conn: Mutex::new(conn),
        };
        archive.initialize_schema()?;
        Ok(archive)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ArchiveError::Storage(format!("Failed to acquire database lock: {e}")))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                content TEXT NOT NULL,
                tags TEXT NOT NULL,
                sig TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_author
                ON events(pubkey, kind, created_at DESC);

            CREATE TABLE IF NOT EXISTS profiles (
                pubkey TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                display_name TEXT NOT NULL DEFAULT '',
                about TEXT NOT NULL DEFAULT '',
                picture TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS following (
                owner_pubkey TEXT NOT NULL,
                followed_pubkey TEXT NOT NULL,
                UNIQUE(owner_pubkey, followed_pubkey)
            );
            ",
        )?;
        Ok(())
    }

    /// Stores an event. Returns `false` if it was already archived.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_event(&self, event: &Event) -> Result<bool> {
        let tags = serde_json::to_string(event.tags())
            .map_err(|e| ArchiveError::InvalidData(format!("Failed to encode tags: {e}")))?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            r"
            INSERT OR IGNORE INTO events (id, pubkey, created_at, kind, content, tags, sig)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                event.id_hex(),
                event.pubkey_hex(),
                event.created_at(),
                i64::from(event.kind()),
                event.content(),
                tags,
                hex::encode(event.sig()),
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Stores a profile unless a newer one is already held. Returns `true`
    /// if the row changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_profile(&self, pubkey: &str, profile: &Profile) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r"
            INSERT INTO profiles (pubkey, name, display_name, about, picture, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(pubkey) DO UPDATE SET
                name = excluded.name,
                display_name = excluded.display_name,
                about = excluded.about,
                picture = excluded.picture,
                updated_at = excluded.updated_at
            WHERE excluded.updated_at > profiles.updated_at
            ",
            params![
                pubkey,
                &profile.name,
                &profile.display_name,
                &profile.about,
                &profile.picture,
                profile.updated_at,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Archived profile for `pubkey`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn profile(&self, pubkey: &str) -> Result<Option<Profile>> {
        let conn = self.lock()?;
        let profile = conn
            .query_row(
                r"
                SELECT name, display_name, about, picture, updated_at
                FROM profiles
                WHERE pubkey = ?1
                ",
                params![pubkey],
                |row| {
                    Ok(Profile {
                        name: row.get(0)?,
                        display_name: row.get(1)?,
                        about: row.get(2)?,
                        picture: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    /// Replaces the follow list of `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn save_following(&self, owner: &str, followed: &[String]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM following WHERE owner_pubkey = ?1",
            params![owner],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO following (owner_pubkey, followed_pubkey) VALUES (?1, ?2)",
            )?;
            for pubkey in followed {
                stmt.execute(params![owner, pubkey])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Pubkeys `owner` follows.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn following(&self, owner: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT followed_pubkey FROM following WHERE owner_pubkey = ?1 ORDER BY rowid",
        )?;
        let followed = stmt
            .query_map(params![owner], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(followed)
    }

    /// Archived event with this hex id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn event_by_id(&self, id: &str) -> Result<Option<Event>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id],
                read_row,
            )
            .optional()?;
        Ok(row.and_then(row_to_event))
    }

    /// Newest text notes written by `pubkey`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn feed_for_user(&self, pubkey: &str, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events
                 WHERE pubkey = ?1 AND kind = ?2
                 ORDER BY created_at DESC LIMIT ?3"
            ),
            pubkey,
            limit,
        )
    }

    /// Newest text notes written by anyone `owner` follows.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn feed_following(&self, owner: &str, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            "SELECT e.id, e.pubkey, e.created_at, e.kind, e.content, e.tags, e.sig
             FROM events e
             INNER JOIN following f ON e.pubkey = f.followed_pubkey
             WHERE f.owner_pubkey = ?1 AND e.kind = ?2
             ORDER BY e.created_at DESC LIMIT ?3",
            owner,
            limit,
        )
    }

    /// Number of archived events.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn event_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|e| ArchiveError::InvalidData(e.to_string()))
    }

    fn query_events(&self, sql: &str, key: &str, limit: usize) -> Result<Vec<Event>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![key, i64::from(KIND_TEXT_NOTE), limit], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().filter_map(row_to_event).collect())
    }
}

impl std::fmt::Debug for EventArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventArchive").finish_non_exhaustive()
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn row_to_event((id, pubkey, created_at, kind, content, tags, sig): EventRow) -> Option<Event> {
    let tags = match serde_json::from_str(&tags) {
        Ok(tags) => tags,
        Err(e) => {
            warn!(event_id = %id, error = %e, "skipping archived event with unreadable tags");
            return None;
        }
    };
    let raw = RawEvent {
        id,
        pubkey,
        created_at,
        kind: u64::try_from(kind).unwrap_or(u64::MAX),
        tags,
        content,
        sig,
    };
    match validate(&raw, &ValidationPolicy::permissive()) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(event_id = %raw.id, error = %e, "skipping archived event that fails validation");
            None
        }
    }
}
