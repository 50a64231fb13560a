//! Relay data model
//!
//! Messages travel over the wire as a flat JSON object
//! (`sender`, `recipient` or `group`, `content`, `timestamp`) but are held in
//! memory as a sum type so a message is always either direct or group,
//! never both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::FrameError;

/// Where a message is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Direct { recipient: String },
    Group { group: String },
}

/// A relayed chat message.
///
/// Values are never mutated in place; [`Message::stamped`] consumes the
/// message and returns a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct Message {
    sender: String,
    target: Target,
    content: String,
    timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn direct(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            target: Target::Direct {
                recipient: recipient.into(),
            },
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn group(
        sender: impl Into<String>,
        group: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            target: Target::Group {
                group: group.into(),
            },
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn recipient(&self) -> Option<&str> {
        match &self.target {
            Target::Direct { recipient } => Some(recipient),
            Target::Group { .. } => None,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        match &self.target {
            Target::Group { group } => Some(group),
            Target::Direct { .. } => None,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Returns the message carrying the server-assigned receipt time.
    pub fn stamped(self, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(at),
            ..self
        }
    }

    /// The conversation this message is appended to.
    pub fn conversation_key(&self) -> ConversationKey {
        match &self.target {
            Target::Direct { recipient } => ConversationKey::direct(&self.sender, recipient),
            Target::Group { group } => ConversationKey::Group(group.clone()),
        }
    }
}

/// Flat wire representation shared by inbound and outbound frames.
///
/// `receiver` and `group_id` are accepted as aliases so older clients keep
/// working.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub sender: String,
    #[serde(default, alias = "receiver", skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, alias = "group_id", skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Client frame as read off a connection. Receipt time is assigned by the
/// server, so any `timestamp` the client sends is never looked at.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    sender: String,
    #[serde(default, alias = "receiver")]
    recipient: Option<String>,
    #[serde(default, alias = "group_id")]
    group: Option<String>,
    content: String,
}

impl WireMessage {
    /// Parse an inbound client frame. The result never carries a timestamp.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        Ok(Self {
            sender: frame.sender,
            recipient: frame.recipient,
            group: frame.group,
            content: frame.content,
            timestamp: None,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl TryFrom<WireMessage> for Message {
    type Error = FrameError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        if wire.sender.is_empty() {
            return Err(FrameError::MissingSender);
        }
        let target = match (non_empty(wire.recipient), non_empty(wire.group)) {
            (Some(recipient), None) => Target::Direct { recipient },
            (None, Some(group)) => Target::Group { group },
            (Some(_), Some(_)) => return Err(FrameError::AmbiguousTarget),
            (None, None) => return Err(FrameError::MissingTarget),
        };
        Ok(Self {
            sender: wire.sender,
            target,
            content: wire.content,
            timestamp: wire.timestamp,
        })
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let (recipient, group) = match message.target {
            Target::Direct { recipient } => (Some(recipient), None),
            Target::Group { group } => (None, Some(group)),
        };
        Self {
            sender: message.sender,
            recipient,
            group,
            content: message.content,
            timestamp: message.timestamp,
        }
    }
}

/// Order-independent pair of participants in a direct conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserPair {
    low: String,
    high: String,
}

impl UserPair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn first(&self) -> &str {
        &self.low
    }

    pub fn second(&self) -> &str {
        &self.high
    }

    pub fn contains(&self, user: &str) -> bool {
        self.low == user || self.high == user
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

/// Identifies one durable conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Direct(UserPair),
    Group(String),
}

impl ConversationKey {
    pub fn direct(a: impl Into<String>, b: impl Into<String>) -> Self {
        ConversationKey::Direct(UserPair::new(a, b))
    }

    pub fn group(group: impl Into<String>) -> Self {
        ConversationKey::Group(group.into())
    }

    pub fn kind(&self) -> ConversationKind {
        match self {
            ConversationKey::Direct(_) => ConversationKind::Direct,
            ConversationKey::Group(_) => ConversationKind::Group,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Direct(pair) => write!(f, "direct:{}+{}", pair.first(), pair.second()),
            ConversationKey::Group(group) => write!(f, "group:{}", group),
        }
    }
}

/// A persisted conversation: its key, listed members and message log.
///
/// `members` is persisted metadata only. Who receives a live forward is
/// decided by the connection registry, not by this list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub key: ConversationKey,
    pub members: BTreeSet<String>,
    pub messages: Vec<Message>,
}
