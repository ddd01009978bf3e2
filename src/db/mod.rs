use crate::error::{CoreError, CoreResult};
use crate::model::{EmbeddingRecord, Message, User};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, text, media_path, reply_to_id, created_at";

/// SQLite handle shared by the message store and the semantic index.
///
/// Every method is blocking; async callers go through [`Database::run_blocking`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` on the blocking pool so SQLite never stalls the runtime.
    pub async fn run_blocking<T, F>(&self, f: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> CoreResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub fn execute_init(&self) -> CoreResult<()> {
        info!("Database: Initializing schema...");
        let sql = "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                first_name TEXT,
                last_name TEXT,
                handle TEXT
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER NOT NULL,
                conversation_id INTEGER NOT NULL,
                sender_id INTEGER NOT NULL REFERENCES users (id),
                text TEXT NOT NULL,
                media_path TEXT,
                reply_to_id INTEGER,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (id, conversation_id),
                CONSTRAINT fk_reply_to FOREIGN KEY (reply_to_id, conversation_id)
                    REFERENCES messages (id, conversation_id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS embeddings (
                message_id INTEGER NOT NULL,
                conversation_id INTEGER NOT NULL,
                created_at REAL NOT NULL,
                vector BLOB NOT NULL,
                PRIMARY KEY (message_id, conversation_id)
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_conversation
                ON embeddings (conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
        ";
        self.lock().execute_batch(sql)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    // --- Users ---

    pub fn get_user(&self, id: i64) -> CoreResult<Option<User>> {
        let conn = self.lock();
        let user = conn
            .query_row(
                "SELECT id, first_name, last_name, handle FROM users WHERE id = ?1",
                [id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Inserts the user unless the id is already present. Returns whether a row was created.
    pub fn insert_user_if_absent(&self, user: &User) -> CoreResult<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (id, first_name, last_name, handle) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.first_name, user.last_name, user.handle],
        )?;
        Ok(inserted > 0)
    }

    /// Overwrites name metadata of an existing user. Returns whether the user exists.
    pub fn refresh_user(&self, user: &User) -> CoreResult<bool> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE users SET first_name = ?2, last_name = ?3, handle = ?4 WHERE id = ?1",
            params![user.id, user.first_name, user.last_name, user.handle],
        )?;
        Ok(updated > 0)
    }

    // --- Messages ---

    /// Inserts a message atomically, checking sender and reply-thread integrity first.
    pub fn insert_message(&self, message: &Message) -> CoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists = tx
            .prepare("SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2")?
            .exists([message.id, message.conversation_id])?;
        if exists {
            return Err(CoreError::Duplicate {
                conversation_id: message.conversation_id,
                message_id: message.id,
            });
        }

        let sender_known = tx
            .prepare("SELECT 1 FROM users WHERE id = ?1")?
            .exists([message.sender_id])?;
        if !sender_known {
            return Err(CoreError::UnknownSender(message.sender_id));
        }

        if let Some(reply_to_id) = message.reply_to_id {
            let target_known = tx
                .prepare("SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2")?
                .exists([reply_to_id, message.conversation_id])?;
            if !target_known {
                return Err(CoreError::IntegrityViolation {
                    conversation_id: message.conversation_id,
                    reply_to_id,
                });
            }
        }

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, text, media_path, reply_to_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.conversation_id,
                message.sender_id,
                message.text,
                message.media_path,
                message.reply_to_id,
                message.created_at.timestamp_millis(),
            ],
        )
        .map_err(|e| match message.reply_to_id {
            Some(reply_to_id) if is_constraint_violation(&e) => CoreError::IntegrityViolation {
                conversation_id: message.conversation_id,
                reply_to_id,
            },
            _ => CoreError::Storage(e),
        })?;
        tx.commit()?;

        debug!(
            "Database: Saved message {} from user {} in conversation {}",
            message.id, message.sender_id, message.conversation_id
        );
        Ok(())
    }

    pub fn get_messages_since(
        &self,
        conversation_id: i64,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<Message>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1 AND created_at >= ?2 ORDER BY created_at ASC, id ASC",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![conversation_id, cutoff.timestamp_millis()],
            message_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_messages_by_ids(
        &self,
        conversation_id: i64,
        ids: &[i64],
    ) -> CoreResult<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ? AND id IN ({}) ORDER BY created_at ASC, id ASC",
            MESSAGE_COLUMNS,
            vec!["?"; ids.len()].join(", ")
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(ids.len() + 1);
        params.push(&conversation_id);
        for id in ids {
            params.push(id);
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(&params[..], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_members(&self, conversation_id: i64) -> CoreResult<Vec<User>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT u.id, u.first_name, u.last_name, u.handle
             FROM users u
             JOIN messages m ON m.sender_id = u.id
             WHERE m.conversation_id = ?1
             ORDER BY u.id",
        )?;
        let rows = stmt.query_map([conversation_id], user_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_message_text(
        &self,
        conversation_id: i64,
        message_id: i64,
        text: &str,
    ) -> CoreResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE messages SET text = ?3 WHERE id = ?1 AND conversation_id = ?2",
            params![message_id, conversation_id, text],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound {
                conversation_id,
                message_id,
            });
        }
        Ok(())
    }

    // --- Embeddings ---

    /// Records the vector dimensions on first use and returns the value the index is bound to.
    pub fn init_index_dimensions(&self, dimensions: usize) -> CoreResult<usize> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO index_meta (key, value) VALUES ('dimensions', ?1)",
            [dimensions as i64],
        )?;
        let stored: i64 = conn.query_row(
            "SELECT value FROM index_meta WHERE key = 'dimensions'",
            [],
            |row| row.get(0),
        )?;
        Ok(stored as usize)
    }

    pub fn insert_embedding(&self, record: &EmbeddingRecord) -> CoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO embeddings (message_id, conversation_id, created_at, vector) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.message_id,
                record.conversation_id,
                record.created_at,
                encode_vector(&record.vector),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                CoreError::Duplicate {
                    conversation_id: record.conversation_id,
                    message_id: record.message_id,
                }
            } else {
                CoreError::Storage(e)
            }
        })?;
        Ok(())
    }

    /// All vectors of a conversation created strictly before `cutoff` (epoch seconds).
    pub fn get_embeddings_before(
        &self,
        conversation_id: i64,
        cutoff: f64,
    ) -> CoreResult<Vec<(i64, Vec<f32>)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT message_id, vector FROM embeddings WHERE conversation_id = ?1 AND created_at < ?2",
        )?;
        let rows = stmt.query_map(params![conversation_id, cutoff], |row| {
            let blob: Vec<u8> = row.get(1)?;
            Ok((row.get(0)?, decode_vector(&blob)))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_embedding(&self, message_id: i64, conversation_id: i64) -> CoreResult<usize> {
        let conn = self.lock();
        let count = conn.execute(
            "DELETE FROM embeddings WHERE message_id = ?1 AND conversation_id = ?2",
            [message_id, conversation_id],
        )?;
        Ok(count)
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        handle: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let created_at_ms: i64 = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        text: row.get(3)?,
        media_path: row.get(4)?,
        reply_to_id: row.get(5)?,
        created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or_default(),
    })
}

// Little-endian f32 blob.
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.execute_init().unwrap();
        db.insert_user_if_absent(&User::new(1)).unwrap();
        db
    }

    fn message(id: i64, conversation_id: i64, reply_to_id: Option<i64>) -> Message {
        Message {
            id,
            conversation_id,
            sender_id: 1,
            text: format!("message {}", id),
            media_path: None,
            reply_to_id,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_db_init_and_save() {
        let db = test_db();
        db.insert_message(&message(1, 100, None)).unwrap();

        let conn = db.lock();
        let mut stmt = conn
            .prepare("SELECT id FROM messages WHERE id = 1 AND conversation_id = 100")
            .unwrap();
        assert!(stmt.exists([]).unwrap());
    }

    #[test]
    fn test_reply_must_resolve_in_same_conversation() {
        let db = test_db();
        db.insert_message(&message(1, 100, None)).unwrap();
        db.insert_message(&message(2, 100, Some(1))).unwrap();

        let err = db.insert_message(&message(3, 200, Some(1))).unwrap_err();
        assert!(matches!(
            err,
            CoreError::IntegrityViolation { conversation_id: 200, reply_to_id: 1 }
        ));

        // Nothing partial left behind.
        assert!(db.get_messages_by_ids(200, &[3]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_sender_and_duplicate() {
        let db = test_db();
        let mut stranger = message(1, 100, None);
        stranger.sender_id = 99;
        assert!(matches!(
            db.insert_message(&stranger).unwrap_err(),
            CoreError::UnknownSender(99)
        ));

        db.insert_message(&message(1, 100, None)).unwrap();
        assert!(matches!(
            db.insert_message(&message(1, 100, None)).unwrap_err(),
            CoreError::Duplicate { conversation_id: 100, message_id: 1 }
        ));

        // Same id in another conversation is a different message.
        db.insert_message(&message(1, 200, None)).unwrap();
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let db = test_db();
        let conn = db.lock();
        let result = conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, text, reply_to_id, created_at)
             VALUES (5, 100, 1, 'orphan', 42, 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_messages_since_and_by_ids() {
        let db = test_db();
        let mut old = message(1, 100, None);
        old.created_at = Utc::now() - Duration::hours(48);
        db.insert_message(&old).unwrap();
        db.insert_message(&message(2, 100, None)).unwrap();
        db.insert_message(&message(3, 200, None)).unwrap();

        let recent = db
            .get_messages_since(100, Utc::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, 2);

        let by_ids = db.get_messages_by_ids(100, &[2, 1, 3]).unwrap();
        let ids: Vec<i64> = by_ids.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(db.get_messages_by_ids(100, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_members_and_user_refresh() {
        let db = test_db();
        db.insert_user_if_absent(&User::new(2)).unwrap();
        db.insert_user_if_absent(&User::new(3)).unwrap();
        assert!(!db.insert_user_if_absent(&User::new(2)).unwrap());

        db.insert_message(&message(1, 100, None)).unwrap();
        let mut from_two = message(2, 100, None);
        from_two.sender_id = 2;
        db.insert_message(&from_two).unwrap();
        let mut again = message(3, 100, None);
        again.sender_id = 2;
        db.insert_message(&again).unwrap();

        let members: Vec<i64> = db.get_members(100).unwrap().iter().map(|u| u.id).collect();
        assert_eq!(members, vec![1, 2]);

        let refreshed = User {
            id: 2,
            first_name: Some("Grace".to_string()),
            last_name: None,
            handle: Some("grace".to_string()),
        };
        assert!(db.refresh_user(&refreshed).unwrap());
        assert_eq!(db.get_user(2).unwrap(), Some(refreshed));
        assert!(!db.refresh_user(&User::new(42)).unwrap());
    }

    #[test]
    fn test_update_text() {
        let db = test_db();
        db.insert_message(&message(1, 100, None)).unwrap();
        db.update_message_text(100, 1, "edited").unwrap();
        assert_eq!(db.get_messages_by_ids(100, &[1]).unwrap()[0].text, "edited");

        assert!(matches!(
            db.update_message_text(100, 9, "ghost").unwrap_err(),
            CoreError::NotFound { conversation_id: 100, message_id: 9 }
        ));
        assert!(db.get_messages_by_ids(100, &[9]).unwrap().is_empty());
    }

    #[test]
    fn test_embedding_storage() {
        let db = test_db();
        assert_eq!(db.init_index_dimensions(3).unwrap(), 3);
        assert_eq!(db.init_index_dimensions(8).unwrap(), 3);

        let record = EmbeddingRecord {
            message_id: 1,
            conversation_id: 100,
            created_at: 1_000.0,
            vector: vec![0.5, -1.25, 3.0],
        };
        db.insert_embedding(&record).unwrap();
        assert!(matches!(
            db.insert_embedding(&record).unwrap_err(),
            CoreError::Duplicate { .. }
        ));

        assert_eq!(
            db.get_embeddings_before(100, 1_000.5).unwrap(),
            vec![(1, vec![0.5, -1.25, 3.0])]
        );
        assert!(db.get_embeddings_before(100, 1_000.0).unwrap().is_empty());
        assert!(db.get_embeddings_before(200, 2_000.0).unwrap().is_empty());

        assert_eq!(db.delete_embedding(1, 100).unwrap(), 1);
        assert!(db.get_embeddings_before(100, 2_000.0).unwrap().is_empty());
    }
}
