//! History reader
//!
//! Read-only access to persisted conversations for the history endpoints.

use std::sync::Arc;

use crate::error::StoreError;
use crate::models::{ConversationKey, Message};
use crate::store::ConversationStore;

#[derive(Clone)]
pub struct HistoryReader {
    store: Arc<dyn ConversationStore>,
}

impl HistoryReader {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Full message log of `key` in append order, empty if it was never used.
    pub async fn history(&self, key: &ConversationKey) -> Result<Vec<Message>, StoreError> {
        self.store.history(key).await
    }

    pub async fn direct(&self, a: &str, b: &str) -> Result<Vec<Message>, StoreError> {
        self.history(&ConversationKey::direct(a, b)).await
    }

    pub async fn group(&self, group: &str) -> Result<Vec<Message>, StoreError> {
        self.history(&ConversationKey::group(group)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_reads_both_directions_and_groups() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        for message in [
            Message::direct("a", "b", "one"),
            Message::direct("b", "a", "two"),
            Message::group("a", "g", "three"),
        ] {
            let message = message.stamped(Utc::now());
            store
                .append(&message.conversation_key(), &message)
                .await
                .unwrap();
        }

        let reader = HistoryReader::new(store);
        let direct = reader.direct("b", "a").await.unwrap();
        assert_eq!(
            direct.iter().map(|m| m.content()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        assert_eq!(reader.group("g").await.unwrap().len(), 1);
        assert!(reader.group("nobody").await.unwrap().is_empty());
        assert!(reader.direct("x", "y").await.unwrap().is_empty());
    }
}
