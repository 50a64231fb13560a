//! Conversation storage
//!
//! The relay only ever appends to a conversation or reads it back; the
//! [`ConversationStore`] trait captures exactly that surface so the appender
//! and history reader stay independent of the backend.

pub mod sqlite;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{ConversationKey, ConversationRecord, Message};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create the conversation if needed and append `message` to it, as one
    /// atomic operation.
    async fn append(&self, key: &ConversationKey, message: &Message) -> Result<(), StoreError>;

    /// Messages of `key` in append order; empty when the conversation does
    /// not exist.
    async fn history(&self, key: &ConversationKey) -> Result<Vec<Message>, StoreError>;

    /// Create the group conversation if needed and add `members` to its
    /// member list.
    async fn seed_group(&self, group: &str, members: &[String]) -> Result<(), StoreError>;

    /// Listed members of `key`, sorted; empty when the conversation does not
    /// exist. Does not read the message log.
    async fn members(&self, key: &ConversationKey) -> Result<Vec<String>, StoreError>;

    async fn conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationRecord>, StoreError>;
}

/// Member list written when a conversation is created by its first message.
pub fn seed_members(key: &ConversationKey, message: &Message) -> Vec<String> {
    match key {
        ConversationKey::Direct(pair) => vec![pair.first().to_string(), pair.second().to_string()],
        ConversationKey::Group(_) => vec![message.sender().to_string()],
    }
}
