//! Presence Binding
//!
//! Schreibt und erneuert den eigenen Eintrag und liefert die Live-Ansicht
//! der anderen Einträge eines Channels.

use super::{live_peers, PresenceRecord, PresenceStore};
use crate::database::{StoreChange, StoreError};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ============================================================================
// RENEWAL
// ============================================================================

struct Renewal {
    channel: String,
    user_id: String,
    /// Unter diesem Lock wird geschrieben; `false` heißt beendet
    active: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

impl Renewal {
    /// Beendet die Erneuerung; ein laufender Write wird abgewartet
    fn stop(self) {
        *self.active.lock() = false;
        self.task.abort();
    }
}

// ============================================================================
// PRESENCE BINDING
// ============================================================================

pub struct PresenceBinding {
    store: Arc<dyn PresenceStore>,
    renew_interval: Duration,
    freshness_window: Duration,
    renewal: Mutex<Option<Renewal>>,
}

impl PresenceBinding {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        renew_interval: Duration,
        freshness_window: Duration,
    ) -> Self {
        Self {
            store,
            renew_interval,
            freshness_window,
            renewal: Mutex::new(None),
        }
    }

    /// Schreibt den Eintrag und startet die Erneuerung
    ///
    /// Die Erneuerung läuft auch dann, wenn der erste Write fehlschlägt;
    /// der nächste Tick versucht es erneut.
    pub fn join(&self, channel: &str, record: PresenceRecord) -> Result<(), StoreError> {
        if let Some(previous) = self.renewal.lock().take() {
            previous.stop();
        }

        let result = self.store.upsert_presence(channel, &record);
        if result.is_ok() {
            tracing::info!("Presence written for {} in {}", record.user_id, channel);
        }

        let active = Arc::new(Mutex::new(true));
        let task = tokio::spawn(Self::renew_loop(
            Arc::clone(&self.store),
            channel.to_string(),
            record.clone(),
            self.renew_interval,
            Arc::clone(&active),
        ));

        *self.renewal.lock() = Some(Renewal {
            channel: channel.to_string(),
            user_id: record.user_id,
            active,
            task,
        });

        result
    }

    /// Stoppt die Erneuerung und löscht den Eintrag
    ///
    /// Ohne vorheriges `join` wird nur gelöscht.
    pub fn leave(&self, channel: &str, user_id: &str) -> Result<(), StoreError> {
        if let Some(renewal) = self.renewal.lock().take() {
            if renewal.channel != channel || renewal.user_id != user_id {
                tracing::warn!(
                    "Leaving {}/{} while renewing {}/{}",
                    channel,
                    user_id,
                    renewal.channel,
                    renewal.user_id
                );
            }
            renewal.stop();
        }

        self.store.delete_presence(channel, user_id)?;
        tracing::info!("Presence removed for {} in {}", user_id, channel);
        Ok(())
    }

    pub fn is_renewing(&self) -> bool {
        self.renewal.lock().is_some()
    }

    /// Live-Ansicht der anderen Peers im Channel
    pub fn subscribe_live_peers(&self, channel: &str, self_user_id: &str) -> LivePeerSubscription {
        LivePeerSubscription {
            store: Arc::clone(&self.store),
            channel: channel.to_string(),
            self_user_id: self_user_id.to_string(),
            freshness_window: self.freshness_window,
            reevaluate_every: self.renew_interval,
            producer: None,
            disposed: false,
        }
    }

    async fn renew_loop(
        store: Arc<dyn PresenceStore>,
        channel: String,
        mut record: PresenceRecord,
        every: Duration,
        active: Arc<Mutex<bool>>,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Erster Tick feuert sofort
        ticker.tick().await;

        loop {
            ticker.tick().await;

            {
                let running = active.lock();
                if !*running {
                    break;
                }
                record.last_renewed_at = Utc::now();
                if let Err(e) = store.upsert_presence(&channel, &record) {
                    tracing::warn!("Presence renewal for {} failed: {}", record.user_id, e);
                }
            }
        }
    }
}

impl Drop for PresenceBinding {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.lock().take() {
            renewal.stop();
        }
    }
}

impl std::fmt::Debug for PresenceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceBinding")
            .field("renew_interval", &self.renew_interval)
            .field("freshness_window", &self.freshness_window)
            .field("renewing", &self.is_renewing())
            .finish()
    }
}

// ============================================================================
// LIVE PEER SUBSCRIPTION
// ============================================================================

struct Producer {
    rx: mpsc::Receiver<Vec<PresenceRecord>>,
    task: JoinHandle<()>,
}

/// Strom von Live-Peer-Snapshots
///
/// Startet beim ersten `next()`. Jeder Snapshot ersetzt den vorherigen
/// vollständig.
pub struct LivePeerSubscription {
    store: Arc<dyn PresenceStore>,
    channel: String,
    self_user_id: String,
    freshness_window: Duration,
    reevaluate_every: Duration,
    producer: Option<Producer>,
    disposed: bool,
}

impl LivePeerSubscription {
    /// Nächster Snapshot; `None` nach `dispose()`
    ///
    /// Cancel-safe, kann in `tokio::select!` verwendet werden.
    pub async fn next(&mut self) -> Option<Vec<PresenceRecord>> {
        if self.disposed {
            return None;
        }

        if self.producer.is_none() {
            self.producer = Some(self.start());
        }

        match self.producer.as_mut() {
            Some(producer) => producer.rx.recv().await,
            None => None,
        }
    }

    /// Beendet die Subscription sofort, danach kommt kein Snapshot mehr
    pub fn dispose(&mut self) {
        self.disposed = true;
        if let Some(mut producer) = self.producer.take() {
            producer.task.abort();
            producer.rx.close();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn start(&self) -> Producer {
        let (tx, rx) = mpsc::channel(16);
        // Vor der ersten Abfrage abonnieren, damit keine Änderung verloren geht
        let changes = self.store.subscribe_changes();

        let task = tokio::spawn(produce_snapshots(
            Arc::clone(&self.store),
            changes,
            self.channel.clone(),
            self.self_user_id.clone(),
            self.freshness_window,
            self.reevaluate_every,
            tx,
        ));

        tracing::debug!("Live peer subscription started for {}", self.channel);
        Producer { rx, task }
    }
}

impl Drop for LivePeerSubscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for LivePeerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivePeerSubscription")
            .field("channel", &self.channel)
            .field("started", &self.producer.is_some())
            .field("disposed", &self.disposed)
            .finish()
    }
}

async fn produce_snapshots(
    store: Arc<dyn PresenceStore>,
    mut changes: broadcast::Receiver<StoreChange>,
    channel: String,
    self_user_id: String,
    window: Duration,
    reevaluate_every: Duration,
    tx: mpsc::Sender<Vec<PresenceRecord>>,
) {
    let mut ticker = tokio::time::interval(reevaluate_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut last: Option<Vec<PresenceRecord>> = None;

    loop {
        match store.list_presence(&channel) {
            Ok(records) => {
                let snapshot = live_peers(records, &self_user_id, Utc::now(), window);
                if last.as_ref() != Some(&snapshot) {
                    if tx.send(snapshot.clone()).await.is_err() {
                        break;
                    }
                    last = Some(snapshot);
                }
            }
            Err(e) => tracing::warn!("Failed to query presence in {}: {}", channel, e),
        }

        // Warten auf Änderung im Channel oder den nächsten Tick
        let keep_going = loop {
            tokio::select! {
                _ = ticker.tick() => break true,
                change = changes.recv() => match change {
                    Ok(StoreChange::Presence(changed)) if changed == channel => break true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => break true,
                    Err(broadcast::error::RecvError::Closed) => break false,
                },
            }
        };

        if !keep_going {
            break;
        }
    }

    tracing::debug!("Live peer subscription for {} ended", channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn binding(db: &Arc<Database>, renew: Duration, window: Duration) -> PresenceBinding {
        PresenceBinding::new(Arc::clone(db) as Arc<dyn PresenceStore>, renew, window)
    }

    fn ids(snapshot: &[PresenceRecord]) -> Vec<&str> {
        snapshot.iter().map(|r| r.user_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_join_renews_and_leave_deletes() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let presence = binding(&db, Duration::from_millis(20), Duration::from_secs(30));

        let record = PresenceRecord::new("ada", "Ada", None, "ada");
        let first_renewal = record.last_renewed_at;
        presence.join("gameWorld", record).unwrap();
        assert!(presence.is_renewing());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let stored = db.list_presence("gameWorld").unwrap();
        assert!(stored[0].last_renewed_at > first_renewal);

        presence.leave("gameWorld", "ada").unwrap();
        assert!(!presence.is_renewing());

        // Keine Erneuerung nach leave
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(db.list_presence("gameWorld").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leave_without_join_is_harmless() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let presence = binding(&db, Duration::from_secs(10), Duration::from_secs(30));
        presence.leave("gameWorld", "ada").unwrap();
    }

    #[tokio::test]
    async fn test_failed_first_write_is_retried_by_renewal() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let presence = binding(&db, Duration::from_millis(20), Duration::from_secs(30));

        db.set_read_only(true);
        let result = presence.join("gameWorld", PresenceRecord::new("ada", "Ada", None, "ada"));
        assert!(matches!(result, Err(StoreError::PermissionDenied(_))));

        db.set_read_only(false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(db.list_presence("gameWorld").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_follows_store_changes() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let presence = binding(&db, Duration::from_secs(10), Duration::from_secs(30));
        let mut live = presence.subscribe_live_peers("gameWorld", "me");

        let initial = timeout(WAIT, live.next()).await.unwrap().unwrap();
        assert!(initial.is_empty());

        db.upsert_presence("gameWorld", &PresenceRecord::new("me", "Me", None, "me"))
            .unwrap();
        db.upsert_presence("gameWorld", &PresenceRecord::new("ada", "Ada", None, "ada"))
            .unwrap();

        let snapshot = loop {
            let snapshot = timeout(WAIT, live.next()).await.unwrap().unwrap();
            if !snapshot.is_empty() {
                break snapshot;
            }
        };
        assert_eq!(ids(&snapshot), vec!["ada"]);

        db.delete_presence("gameWorld", "ada").unwrap();
        let snapshot = timeout(WAIT, live.next()).await.unwrap().unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_stale_records_expire_without_writes() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let presence = binding(&db, Duration::from_millis(20), Duration::from_millis(100));
        db.upsert_presence("gameWorld", &PresenceRecord::new("ada", "Ada", None, "ada"))
            .unwrap();

        let mut live = presence.subscribe_live_peers("gameWorld", "me");
        let first = timeout(WAIT, live.next()).await.unwrap().unwrap();
        assert_eq!(ids(&first), vec!["ada"]);

        // Der Tick bemerkt den Ablauf ohne Store-Änderung
        let expired = timeout(WAIT, live.next()).await.unwrap().unwrap();
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn test_identical_snapshots_are_coalesced() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let presence = binding(&db, Duration::from_millis(10), Duration::from_secs(30));
        let mut live = presence.subscribe_live_peers("gameWorld", "me");
        timeout(WAIT, live.next()).await.unwrap().unwrap();

        // Änderungen in anderen Channels und Ticks ändern den Snapshot nicht
        db.upsert_presence("lobby", &PresenceRecord::new("bob", "Bob", None, "bob"))
            .unwrap();
        assert!(timeout(Duration::from_millis(100), live.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_dispose_stops_delivery() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let presence = binding(&db, Duration::from_secs(10), Duration::from_secs(30));
        let mut live = presence.subscribe_live_peers("gameWorld", "me");
        timeout(WAIT, live.next()).await.unwrap().unwrap();

        live.dispose();
        db.upsert_presence("gameWorld", &PresenceRecord::new("ada", "Ada", None, "ada"))
            .unwrap();

        assert!(live.is_disposed());
        assert!(live.next().await.is_none());
    }
}
