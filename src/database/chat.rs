//! Chat-Tabelle

use super::{timestamp_from_millis, Database, StoreChange, StoreError};
use crate::chat::ChatMessage;
use rusqlite::{params, Result as SqliteResult};
use uuid::Uuid;

impl Database {
    /// Speichert eine Nachricht
    pub fn insert_chat_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.check_writable()?;
        {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                INSERT INTO chat_messages
                    (id, room, user_id, user_name, user_avatar, text, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    message.id.to_string(),
                    message.room,
                    message.user_id,
                    message.user_name,
                    message.user_avatar,
                    message.text,
                    message.created_at.timestamp_millis(),
                ],
            )?;
        }

        self.notify(StoreChange::Chat(message.room.clone()));
        Ok(())
    }

    /// Die letzten `limit` Nachrichten eines Raums, älteste zuerst
    pub fn recent_chat_messages(
        &self,
        room: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, room, user_id, user_name, user_avatar, text, created_at
            FROM chat_messages
            WHERE room = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt
            .query_map(params![room, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        let mut messages = rows
            .into_iter()
            .map(|(id, room, user_id, user_name, user_avatar, text, created_at)| {
                Ok(ChatMessage {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    room,
                    user_id,
                    user_name,
                    user_avatar,
                    text,
                    created_at: timestamp_from_millis(created_at)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        messages.reverse();
        Ok(messages)
    }
}
