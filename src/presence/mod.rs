//! Voice Presence
//!
//! Ein Presence-Eintrag pro `(channel, user_id)` signalisiert, dass ein
//! Benutzer im Voice-Channel ist und unter welcher `peer_id` er erreichbar
//! ist. Einträge werden regelmäßig erneuert; wer das Freshness-Fenster
//! verpasst, gilt als weg.

mod binding;

pub use binding::{LivePeerSubscription, PresenceBinding};

use crate::database::{StoreChange, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// PRESENCE RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// Adresse, unter der der Transport diesen Benutzer anruft
    pub peer_id: String,
    pub joined_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        avatar_url: Option<String>,
        peer_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url,
            peer_id: peer_id.into(),
            joined_at: now,
            last_renewed_at: now,
        }
    }

    /// Noch innerhalb des Freshness-Fensters?
    pub fn is_live(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_renewed_at) <= window
    }
}

/// Filtert die Live-Peers aus allen Einträgen eines Channels
///
/// Ohne den eigenen Eintrag und ohne veraltete Einträge, zuletzt erneuerte
/// zuerst.
pub fn live_peers(
    records: Vec<PresenceRecord>,
    self_user_id: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<PresenceRecord> {
    let mut live: Vec<_> = records
        .into_iter()
        .filter(|r| r.user_id != self_user_id && r.is_live(now, window))
        .collect();

    live.sort_by(|a, b| {
        b.last_renewed_at
            .cmp(&a.last_renewed_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    live
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Speicher für Presence-Einträge
pub trait PresenceStore: Send + Sync + 'static {
    /// Legt den Eintrag an oder überschreibt ihn (`joined_at` bleibt erhalten)
    fn upsert_presence(&self, channel: &str, record: &PresenceRecord) -> Result<(), StoreError>;

    fn delete_presence(&self, channel: &str, user_id: &str) -> Result<(), StoreError>;

    /// Alle Einträge des Channels, ungefiltert
    fn list_presence(&self, channel: &str) -> Result<Vec<PresenceRecord>, StoreError>;

    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange>;
}
