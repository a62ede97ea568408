//! Dokumenten-Store
//!
//! SQLite-Datenbank für Presence-Einträge und Chat-Nachrichten.
//! Nach jedem Schreibzugriff wird eine `StoreChange` gebroadcastet, damit
//! Live-Ansichten neu abfragen können.

mod chat;
mod presence;

use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Write permission denied: {0}")]
    PermissionDenied(String),

    #[error("Stored value could not be decoded: {0}")]
    Serialization(String),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::ReadOnly) | Some(ErrorCode::PermissionDenied) => {
                StoreError::PermissionDenied(e.to_string())
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

/// Änderung an einer Collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// Presence-Einträge eines Channels
    Presence(String),
    /// Nachrichten eines Chat-Raums
    Chat(String),
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank (Thread-safe durch Mutex)
pub struct Database {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<StoreChange>,
    read_only: AtomicBool,
}

impl Database {
    /// Öffnet oder erstellt die Datenbank
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!("Opening database at {:?}", path);
        Self::with_connection(Connection::open(path)?)
    }

    /// In-Memory Datenbank (Tests, Loopback-Demo)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let (changes, _) = broadcast::channel(256);
        let db = Self {
            conn: Mutex::new(conn),
            changes,
            read_only: AtomicBool::new(false),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS presence (
                channel TEXT NOT NULL,
                user_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                avatar_url TEXT,
                peer_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                last_renewed_at INTEGER NOT NULL,
                PRIMARY KEY (channel, user_id)
            );

            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                room TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL,
                user_avatar TEXT,
                text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chat_room_created
                ON chat_messages(room, created_at);
            "#,
        )?;
        Ok(())
    }

    /// Abonniert Änderungs-Benachrichtigungen
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Sperrt oder erlaubt Schreibzugriffe
    ///
    /// Gesperrte Writes schlagen mit `PermissionDenied` fehl, wie bei
    /// abgelehnten Security Rules des Remote-Stores.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(
                "store is read-only".to_string(),
            ));
        }
        Ok(())
    }

    fn notify(&self, change: StoreChange) {
        // Keine Empfänger ist kein Fehler
        let _ = self.changes.send(change);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("read_only", &self.read_only.load(Ordering::SeqCst))
            .field("subscribers", &self.changes.receiver_count())
            .finish()
    }
}

/// Millisekunden seit Epoch zurück in einen Zeitstempel
fn timestamp_from_millis(millis: i64) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
    chrono::DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Serialization(format!("invalid timestamp {}", millis)))
}
