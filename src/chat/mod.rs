//! Raum-Chat
//!
//! Textnachrichten pro Raum. Die Live-Ansicht zeigt die letzten 50
//! Nachrichten, älteste zuerst.

use crate::database::{Database, StoreChange, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Größe der Live-Ansicht
pub const HISTORY_LIMIT: usize = 50;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// CHAT MESSAGE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room: String,
    pub user_id: String,
    pub user_name: String,
    pub user_avatar: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// CHAT ROOM
// ============================================================================

/// Ein Chat-Raum aus Sicht eines Benutzers
#[derive(Clone)]
pub struct ChatRoom {
    db: Arc<Database>,
    room: String,
    user_id: String,
    user_name: String,
    user_avatar: Option<String>,
}

impl ChatRoom {
    pub fn new(
        db: Arc<Database>,
        room: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        user_avatar: Option<String>,
    ) -> Self {
        Self {
            db,
            room: room.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            user_avatar,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Sendet eine Nachricht; der Text wird unverändert gespeichert
    pub fn send(&self, text: &str) -> Result<ChatMessage, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            room: self.room.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_avatar: self.user_avatar.clone(),
            text: text.to_string(),
            created_at: Utc::now(),
        };

        self.db.insert_chat_message(&message)?;
        tracing::debug!("Chat message {} sent to {}", message.id, self.room);
        Ok(message)
    }

    pub fn history(&self) -> Result<Vec<ChatMessage>, ChatError> {
        Ok(self.db.recent_chat_messages(&self.room, HISTORY_LIMIT)?)
    }

    /// Live-Ansicht: sofort die aktuelle Historie, danach bei jeder Änderung
    pub fn subscribe(&self) -> ChatSubscription {
        let (tx, rx) = mpsc::channel(16);
        let changes = self.db.subscribe_changes();
        let task = tokio::spawn(watch_room(Arc::clone(&self.db), changes, self.room.clone(), tx));
        ChatSubscription { rx, task }
    }
}

impl std::fmt::Debug for ChatRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRoom")
            .field("room", &self.room)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Strom der Chat-Historie eines Raums
pub struct ChatSubscription {
    rx: mpsc::Receiver<Vec<ChatMessage>>,
    task: JoinHandle<()>,
}

impl ChatSubscription {
    pub async fn next(&mut self) -> Option<Vec<ChatMessage>> {
        self.rx.recv().await
    }
}

impl Drop for ChatSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_room(
    db: Arc<Database>,
    mut changes: broadcast::Receiver<StoreChange>,
    room: String,
    tx: mpsc::Sender<Vec<ChatMessage>>,
) {
    loop {
        match db.recent_chat_messages(&room, HISTORY_LIMIT) {
            Ok(messages) => {
                if tx.send(messages).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("Failed to load chat history for {}: {}", room, e),
        }

        let keep_going = loop {
            match changes.recv().await {
                Ok(StoreChange::Chat(changed)) if changed == room => break true,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => break true,
                Err(broadcast::error::RecvError::Closed) => break false,
            }
        };

        if !keep_going {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn room(db: &Arc<Database>, user: &str) -> ChatRoom {
        ChatRoom::new(Arc::clone(db), "gameWorld", user, user.to_uppercase(), None)
    }

    #[test]
    fn test_blank_messages_rejected() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let chat = room(&db, "ada");

        assert!(matches!(chat.send(""), Err(ChatError::EmptyMessage)));
        assert!(matches!(chat.send("  \n\t"), Err(ChatError::EmptyMessage)));
        assert!(chat.history().unwrap().is_empty());
    }

    #[test]
    fn test_text_is_stored_untrimmed() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let chat = room(&db, "ada");

        chat.send("  hello ").unwrap();
        assert_eq!(chat.history().unwrap()[0].text, "  hello ");
        assert_eq!(chat.history().unwrap()[0].user_name, "ADA");
    }

    #[test]
    fn test_history_keeps_last_fifty_in_order() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let chat = room(&db, "ada");

        for i in 0..55 {
            chat.send(&format!("message {}", i)).unwrap();
        }

        let history = chat.history().unwrap();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.first().unwrap().text, "message 5");
        assert_eq!(history.last().unwrap().text, "message 54");
    }

    #[test]
    fn test_rooms_are_isolated() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        room(&db, "ada").send("hi").unwrap();

        let other = ChatRoom::new(Arc::clone(&db), "lobby", "bob", "Bob", None);
        assert!(other.history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_pushes_new_messages() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ada = room(&db, "ada");
        let bob = room(&db, "bob");

        let mut live = ada.subscribe();
        let initial = live.next().await.unwrap();
        assert!(initial.is_empty());

        bob.send("hey ada").unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), live.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].user_id, "bob");
    }
}
