//! Presence-Tabelle

use super::{timestamp_from_millis, Database, StoreChange, StoreError};
use crate::presence::{PresenceRecord, PresenceStore};
use rusqlite::{params, Result as SqliteResult};
use tokio::sync::broadcast;

impl PresenceStore for Database {
    fn upsert_presence(&self, channel: &str, record: &PresenceRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                INSERT INTO presence
                    (channel, user_id, display_name, avatar_url, peer_id, joined_at, last_renewed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(channel, user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    avatar_url = excluded.avatar_url,
                    peer_id = excluded.peer_id,
                    last_renewed_at = excluded.last_renewed_at
                "#,
                params![
                    channel,
                    record.user_id,
                    record.display_name,
                    record.avatar_url,
                    record.peer_id,
                    record.joined_at.timestamp_millis(),
                    record.last_renewed_at.timestamp_millis(),
                ],
            )?;
        }

        self.notify(StoreChange::Presence(channel.to_string()));
        Ok(())
    }

    fn delete_presence(&self, channel: &str, user_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let removed = {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                DELETE FROM presence
                WHERE channel = ?1 AND user_id = ?2
                "#,
                params![channel, user_id],
            )?
        };

        if removed > 0 {
            self.notify(StoreChange::Presence(channel.to_string()));
        }
        Ok(())
    }

    fn list_presence(&self, channel: &str) -> Result<Vec<PresenceRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, display_name, avatar_url, peer_id, joined_at, last_renewed_at
            FROM presence
            WHERE channel = ?1
            ORDER BY last_renewed_at DESC
            "#,
        )?;

        let rows = stmt
            .query_map(params![channel], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(user_id, display_name, avatar_url, peer_id, joined_at, last_renewed_at)| {
                    Ok(PresenceRecord {
                        user_id,
                        display_name,
                        avatar_url,
                        peer_id,
                        joined_at: timestamp_from_millis(joined_at)?,
                        last_renewed_at: timestamp_from_millis(last_renewed_at)?,
                    })
                },
            )
            .collect()
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        Database::subscribe_changes(self)
    }
}
