//! Durable message log with reply-thread integrity.
//!
//! Mutations are serialized per conversation; different conversations never
//! wait on each other's locks.

use crate::db::Database;
use crate::error::CoreResult;
use crate::model::{Message, User};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// `now - window`, saturating at the earliest representable instant.
pub(crate) fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Clone, Default)]
struct ConversationLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ConversationLocks {
    fn get(&self, conversation_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if locks.len() > LOCK_PRUNE_THRESHOLD {
            // Only drop locks nobody is holding or waiting on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(conversation_id).or_default().clone()
    }
}

#[derive(Clone)]
pub struct MessageStore {
    db: Database,
    locks: ConversationLocks,
}

impl MessageStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: ConversationLocks::default(),
        }
    }

    pub async fn append(&self, message: Message) -> CoreResult<()> {
        let lock = self.locks.get(message.conversation_id);
        let _guard = lock.lock().await;
        self.db
            .run_blocking(move |db| db.insert_message(&message))
            .await
    }

    /// Messages with `created_at >= now - window`, oldest first.
    pub async fn get_since(&self, conversation_id: i64, window: Duration) -> CoreResult<Vec<Message>> {
        let since = cutoff(Utc::now(), window);
        self.db
            .run_blocking(move |db| db.get_messages_since(conversation_id, since))
            .await
    }

    /// Resolves ids within one conversation, oldest first. Unknown ids are skipped.
    pub async fn get_by_ids(
        &self,
        conversation_id: i64,
        ids: &HashSet<i64>,
    ) -> CoreResult<Vec<Message>> {
        let ids: Vec<i64> = ids.iter().copied().collect();
        self.db
            .run_blocking(move |db| db.get_messages_by_ids(conversation_id, &ids))
            .await
    }

    pub async fn get_members(&self, conversation_id: i64) -> CoreResult<Vec<User>> {
        self.db
            .run_blocking(move |db| db.get_members(conversation_id))
            .await
    }

    pub async fn edit_text(&self, conversation_id: i64, message_id: i64, text: String) -> CoreResult<()> {
        let lock = self.locks.get(conversation_id);
        let _guard = lock.lock().await;
        debug!("Store: editing message {} in conversation {}", message_id, conversation_id);
        self.db
            .run_blocking(move |db| db.update_message_text(conversation_id, message_id, &text))
            .await
    }

    // --- Users ---

    pub async fn get_user(&self, user_id: i64) -> CoreResult<Option<User>> {
        self.db.run_blocking(move |db| db.get_user(user_id)).await
    }

    /// Creates the user row if absent. Returns whether a row was created.
    pub async fn ensure_user(&self, user: User) -> CoreResult<bool> {
        self.db
            .run_blocking(move |db| db.insert_user_if_absent(&user))
            .await
    }

    /// Refreshes sender metadata inside the conversation's critical section.
    pub async fn refresh_user(&self, conversation_id: i64, user: User) -> CoreResult<bool> {
        let lock = self.locks.get(conversation_id);
        let _guard = lock.lock().await;
        self.db.run_blocking(move |db| db.refresh_user(&user)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    fn store() -> MessageStore {
        let db = Database::open_in_memory().unwrap();
        db.execute_init().unwrap();
        MessageStore::new(db)
    }

    fn message(id: i64, conversation_id: i64, age: TimeDelta) -> Message {
        Message {
            id,
            conversation_id,
            sender_id: 1,
            text: format!("message {}", id),
            media_path: None,
            reply_to_id: None,
            created_at: Utc::now() - age,
        }
    }

    #[test]
    fn test_cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(cutoff(now, Duration::from_secs(60)), now - TimeDelta::seconds(60));
        assert_eq!(cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn test_append_then_get_since() {
        let store = store();
        assert!(store.ensure_user(User::new(1)).await.unwrap());
        assert!(!store.ensure_user(User::new(1)).await.unwrap());

        store.append(message(1, 10, TimeDelta::hours(3))).await.unwrap();
        store.append(message(2, 10, TimeDelta::minutes(5))).await.unwrap();

        let recent = store.get_since(10, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(recent.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);

        let all = store.get_since(10, Duration::from_secs(4 * 3600)).await.unwrap();
        assert_eq!(all.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_append_requires_user() {
        let store = store();
        let err = store.append(message(1, 10, TimeDelta::zero())).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownSender(1)));
    }

    #[tokio::test]
    async fn test_concurrent_appends_across_conversations() {
        let store = store();
        store.ensure_user(User::new(1)).await.unwrap();

        let mut handles = Vec::new();
        for conversation_id in 0..4 {
            for id in 0..5 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    store.append(message(id, conversation_id, TimeDelta::zero())).await
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for conversation_id in 0..4 {
            let messages = store.get_since(conversation_id, Duration::from_secs(60)).await.unwrap();
            assert_eq!(messages.len(), 5);
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends_and_edits_in_one_conversation() {
        let store = store();
        store.ensure_user(User::new(1)).await.unwrap();
        store.append(message(0, 10, TimeDelta::minutes(1))).await.unwrap();

        let mut handles = Vec::new();
        for id in 1..=10 {
            let appender = store.clone();
            handles.push(tokio::spawn(async move {
                let mut reply = message(id, 10, TimeDelta::zero());
                reply.reply_to_id = Some(0);
                appender.append(reply).await
            }));
            let editor = store.clone();
            handles.push(tokio::spawn(async move {
                editor.edit_text(10, 0, format!("edit {}", id)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let messages = store.get_since(10, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(messages.len(), 11);
        assert_eq!(messages[0].id, 0);
        assert!(messages[0].text.starts_with("edit "));
        assert!(messages[1..].iter().all(|m| m.reply_to_id == Some(0)));
    }

    #[tokio::test]
    async fn test_edit_text() {
        let store = store();
        store.ensure_user(User::new(1)).await.unwrap();
        store.append(message(1, 10, TimeDelta::zero())).await.unwrap();

        store.edit_text(10, 1, "fixed typo".to_string()).await.unwrap();
        let ids = HashSet::from([1]);
        assert_eq!(store.get_by_ids(10, &ids).await.unwrap()[0].text, "fixed typo");

        let err = store.edit_text(10, 2, "nope".to_string()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }
}
