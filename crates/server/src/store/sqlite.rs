//! SQLite-backed conversation store
//!
//! Each conversation is one row in `conversations`, unique on
//! `(kind, key_a, key_b)`. Direct conversations store the sorted participant
//! pair in `key_a`/`key_b`; group conversations store the group id in
//! `key_a`. Create-or-append runs in a single transaction so concurrent
//! appends to the same key never lose a message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{seed_members, ConversationStore};
use crate::error::StoreError;
use crate::models::{ConversationKey, ConversationRecord, Message, WireMessage};

type MessageRow = (String, Option<String>, Option<String>, String, DateTime<Utc>);

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and ensure the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("[Store] SQLite conversation store ready at {}", url);
        Ok(store)
    }

    /// Private in-memory database, mostly useful in tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // every pooled connection would otherwise get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let stmts = [
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                kind       TEXT NOT NULL,
                key_a      TEXT NOT NULL,
                key_b      TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                UNIQUE(kind, key_a, key_b)
            )"#,
            r#"
            CREATE TABLE IF NOT EXISTS conversation_members (
                conversation_id INTEGER NOT NULL,
                user_id         TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )"#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                sender          TEXT NOT NULL,
                recipient       TEXT,
                group_id        TEXT,
                content         TEXT NOT NULL,
                sent_at         TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )"#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, id)"#,
        ];
        for stmt in stmts {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert the conversation row if absent; returns its id and whether it
    /// was created by this call.
    async fn upsert_conversation(
        tx: &mut Transaction<'_, Sqlite>,
        key: &ConversationKey,
    ) -> Result<(i64, bool), StoreError> {
        let (kind, key_a, key_b) = key_columns(key);
        let created = sqlx::query(
            "INSERT INTO conversations (kind, key_a, key_b, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(kind, key_a, key_b) DO NOTHING",
        )
        .bind(kind)
        .bind(key_a)
        .bind(key_b)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?
        .rows_affected()
            == 1;

        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM conversations WHERE kind = ? AND key_a = ? AND key_b = ?",
        )
        .bind(kind)
        .bind(key_a)
        .bind(key_b)
        .fetch_one(&mut **tx)
        .await?;

        if created {
            debug!("[Store] Created conversation {} (id {})", key, id);
        }
        Ok((id, created))
    }

    async fn add_members(
        tx: &mut Transaction<'_, Sqlite>,
        conversation_id: i64,
        members: &[String],
    ) -> Result<(), StoreError> {
        for member in members {
            sqlx::query(
                "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id) VALUES (?, ?)",
            )
            .bind(conversation_id)
            .bind(member)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn conversation_id(&self, key: &ConversationKey) -> Result<Option<i64>, StoreError> {
        let (kind, key_a, key_b) = key_columns(key);
        let id = sqlx::query_scalar(
            "SELECT id FROM conversations WHERE kind = ? AND key_a = ? AND key_b = ?",
        )
        .bind(kind)
        .bind(key_a)
        .bind(key_b)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn messages_of(
        &self,
        key: &ConversationKey,
        conversation_id: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT sender, recipient, group_id, content, sent_at FROM messages
             WHERE conversation_id = ? ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| decode_message(key, row))
            .collect()
    }
}

fn key_columns(key: &ConversationKey) -> (&'static str, &str, &str) {
    match key {
        ConversationKey::Direct(pair) => (key.kind().as_str(), pair.first(), pair.second()),
        ConversationKey::Group(group) => (key.kind().as_str(), group.as_str(), ""),
    }
}

fn decode_message(key: &ConversationKey, row: MessageRow) -> Result<Message, StoreError> {
    let (sender, recipient, group, content, sent_at) = row;
    let wire = WireMessage {
        sender,
        recipient,
        group,
        content,
        timestamp: Some(sent_at),
    };
    Message::try_from(wire).map_err(|source| StoreError::Corrupt {
        conversation: key.to_string(),
        source,
    })
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn append(&self, key: &ConversationKey, message: &Message) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let (conversation_id, created) = Self::upsert_conversation(&mut tx, key).await?;
        if created {
            Self::add_members(&mut tx, conversation_id, &seed_members(key, message)).await?;
        }

        sqlx::query(
            "INSERT INTO messages (conversation_id, sender, recipient, group_id, content, sent_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(message.sender())
        .bind(message.recipient())
        .bind(message.group_id())
        .bind(message.content())
        .bind(message.timestamp().unwrap_or_else(Utc::now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, key: &ConversationKey) -> Result<Vec<Message>, StoreError> {
        match self.conversation_id(key).await? {
            Some(id) => self.messages_of(key, id).await,
            None => Ok(Vec::new()),
        }
    }

    async fn seed_group(&self, group: &str, members: &[String]) -> Result<(), StoreError> {
        let key = ConversationKey::group(group);
        let mut tx = self.pool.begin().await?;
        let (conversation_id, _) = Self::upsert_conversation(&mut tx, &key).await?;
        Self::add_members(&mut tx, conversation_id, members).await?;
        tx.commit().await?;

        info!("[Store] Seeded {} member(s) into {}", members.len(), key);
        Ok(())
    }

    async fn members(&self, key: &ConversationKey) -> Result<Vec<String>, StoreError> {
        let (kind, key_a, key_b) = key_columns(key);
        let members = sqlx::query_scalar(
            "SELECT m.user_id FROM conversation_members m
             JOIN conversations c ON c.id = m.conversation_id
             WHERE c.kind = ? AND c.key_a = ? AND c.key_b = ?
             ORDER BY m.user_id",
        )
        .bind(kind)
        .bind(key_a)
        .bind(key_b)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationRecord>, StoreError> {
        let Some(id) = self.conversation_id(key).await? else {
            return Ok(None);
        };

        let members: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM conversation_members WHERE conversation_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let messages = self.messages_of(key, id).await?;

        Ok(Some(ConversationRecord {
            key: key.clone(),
            members: members.into_iter().collect::<BTreeSet<_>>(),
            messages,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn file_store(dir: &TempDir) -> SqliteStore {
        let url = format!("sqlite://{}", dir.path().join("relay.sqlite").display());
        SqliteStore::connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_direct_conversation_shared_by_both_directions() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;

        let ab = Message::direct("alice", "bob", "hi bob").stamped(Utc::now());
        let ba = Message::direct("bob", "alice", "hi alice").stamped(Utc::now());
        store.append(&ab.conversation_key(), &ab).await.unwrap();
        store.append(&ba.conversation_key(), &ba).await.unwrap();

        let history = store
            .history(&ConversationKey::direct("bob", "alice"))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content(), "hi bob");
        assert_eq!(history[1].content(), "hi alice");

        let record = store
            .conversation(&ConversationKey::direct("alice", "bob"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.members.into_iter().collect::<Vec<_>>(),
            vec!["alice", "bob"]
        );
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_empty() {
        let store = SqliteStore::in_memory().await.unwrap();
        let history = store
            .history(&ConversationKey::group("never-used"))
            .await
            .unwrap();
        assert!(history.is_empty());
        assert!(store
            .conversation(&ConversationKey::group("never-used"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_group_created_on_first_message_seeds_sender() {
        let store = SqliteStore::in_memory().await.unwrap();
        let first = Message::group("carol", "g1", "first").stamped(Utc::now());
        let second = Message::group("dave", "g1", "second").stamped(Utc::now());
        store.append(&first.conversation_key(), &first).await.unwrap();
        store.append(&second.conversation_key(), &second).await.unwrap();

        let record = store
            .conversation(&ConversationKey::group("g1"))
            .await
            .unwrap()
            .unwrap();
        // members are only seeded when the record is created
        assert_eq!(record.members.into_iter().collect::<Vec<_>>(), vec!["carol"]);
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[1].sender(), "dave");
        assert_eq!(record.messages[1].group_id(), Some("g1"));
    }

    #[tokio::test]
    async fn test_members_lists_sorted_users_only() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store
            .members(&ConversationKey::group("g1"))
            .await
            .unwrap()
            .is_empty());

        let msg = Message::direct("zed", "amy", "hi").stamped(Utc::now());
        store.append(&msg.conversation_key(), &msg).await.unwrap();
        store
            .seed_group("g1", &["erin".to_string(), "bob".to_string()])
            .await
            .unwrap();

        assert_eq!(
            store.members(&ConversationKey::direct("amy", "zed")).await.unwrap(),
            vec!["amy", "zed"]
        );
        assert_eq!(
            store.members(&ConversationKey::group("g1")).await.unwrap(),
            vec!["bob", "erin"]
        );
    }

    #[tokio::test]
    async fn test_seed_group_is_idempotent_and_keeps_messages() {
        let store = SqliteStore::in_memory().await.unwrap();
        let msg = Message::group("carol", "g1", "hello").stamped(Utc::now());
        store.append(&msg.conversation_key(), &msg).await.unwrap();

        let members = vec!["dave".to_string(), "erin".to_string()];
        store.seed_group("g1", &members).await.unwrap();
        store.seed_group("g1", &members).await.unwrap();

        let record = store
            .conversation(&ConversationKey::group("g1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.members.into_iter().collect::<Vec<_>>(),
            vec!["carol", "dave", "erin"]
        );
        assert_eq!(record.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_to_one_key_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(file_store(&dir).await);

        let mut tasks = Vec::new();
        for i in 0..40 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let (from, to) = if i % 2 == 0 { ("a", "b") } else { ("b", "a") };
                let msg = Message::direct(from, to, format!("m{}", i)).stamped(Utc::now());
                store.append(&msg.conversation_key(), &msg).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let history = store
            .history(&ConversationKey::direct("a", "b"))
            .await
            .unwrap();
        assert_eq!(history.len(), 40);

        let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(conversations, 1);
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = file_store(&dir).await;
            let msg = Message::direct("d", "e", "persisted").stamped(Utc::now());
            store.append(&msg.conversation_key(), &msg).await.unwrap();
            store.close().await;
        }

        let store = file_store(&dir).await;
        let history = store
            .history(&ConversationKey::direct("e", "d"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content(), "persisted");
        assert!(history[0].timestamp().is_some());
    }
}
