//! Connection registry
//!
//! Tracks which users currently hold a live duplex connection. Direct chat
//! keeps one handle per user; group chat keeps one handle per (group, user).
//! The maps sit behind `parking_lot` locks and are only reachable through
//! [`ConnectionRegistry`]. No lock is ever held across an `.await`.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tracing::debug;
use uuid::Uuid;

use crate::error::ForwardError;
use crate::models::Message;

/// Unique identifier for one connection lifecycle.
///
/// Lets a closing connection remove its own entry without clobbering a newer
/// connection that has since replaced it under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Frames a connection may have queued for its writer before it is
/// treated as a stalled consumer.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Outbound side of a live connection.
///
/// Forwarding pushes onto the connection's bounded writer queue; the socket
/// write itself happens in the connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: Sender<Message>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel(id: ConnectionId) -> (Self, Receiver<Message>) {
        Self::with_capacity(id, OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(id: ConnectionId, capacity: usize) -> (Self, Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn forward(&self, message: Message) -> Result<(), ForwardError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => ForwardError::Full(self.id),
            TrySendError::Closed(_) => ForwardError::Closed(self.id),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Registry key for one presence entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PresenceKey {
    User(String),
    Member { group: String, user: String },
}

impl PresenceKey {
    pub fn user(user: impl Into<String>) -> Self {
        PresenceKey::User(user.into())
    }

    pub fn member(group: impl Into<String>, user: impl Into<String>) -> Self {
        PresenceKey::Member {
            group: group.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for PresenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceKey::User(user) => write!(f, "user {}", user),
            PresenceKey::Member { group, user } => write!(f, "user {} in group {}", user, group),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PresenceSnapshot {
    pub direct: usize,
    pub groups: usize,
    pub group_members: usize,
}

#[derive(Default)]
struct Inner {
    direct: RwLock<HashMap<String, ConnectionHandle>>,
    // group_id -> user_id -> handle
    groups: RwLock<HashMap<String, HashMap<String, ConnectionHandle>>>,
}

/// Concurrency-safe map of live connections.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the handle for `key`, returning the handle it replaced.
    ///
    /// Dropping the replaced handle closes that connection's writer queue.
    pub fn register(&self, key: PresenceKey, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let replaced = match key {
            PresenceKey::User(user) => self.inner.direct.write().insert(user, handle),
            PresenceKey::Member { group, user } => self
                .inner
                .groups
                .write()
                .entry(group)
                .or_default()
                .insert(user, handle),
        };
        if let Some(old) = &replaced {
            debug!("Registry entry replaced, dropping connection {}", old.id());
        }
        replaced
    }

    /// Remove whatever handle is registered under `key`. Idempotent.
    pub fn unregister(&self, key: &PresenceKey) -> Option<ConnectionHandle> {
        self.remove_if(key, |_| true)
    }

    /// Remove the entry for `key` only if it still belongs to connection `id`.
    pub fn release(&self, key: &PresenceKey, id: ConnectionId) -> bool {
        self.remove_if(key, |handle| handle.id() == id).is_some()
    }

    fn remove_if(
        &self,
        key: &PresenceKey,
        owned: impl Fn(&ConnectionHandle) -> bool,
    ) -> Option<ConnectionHandle> {
        match key {
            PresenceKey::User(user) => {
                let mut direct = self.inner.direct.write();
                if direct.get(user).is_some_and(|h| owned(h)) {
                    direct.remove(user)
                } else {
                    None
                }
            }
            PresenceKey::Member { group, user } => {
                let mut groups = self.inner.groups.write();
                let members = groups.get_mut(group)?;
                let removed = if members.get(user).is_some_and(|h| owned(h)) {
                    members.remove(user)
                } else {
                    None
                };
                if members.is_empty() {
                    groups.remove(group);
                    debug!("Removed empty group {} from registry", group);
                }
                removed
            }
        }
    }

    /// Current live handle for `key`.
    ///
    /// A handle whose writer has already gone away is purged and reported
    /// as absent.
    pub fn lookup(&self, key: &PresenceKey) -> Option<ConnectionHandle> {
        let found = match key {
            PresenceKey::User(user) => self.inner.direct.read().get(user).cloned(),
            PresenceKey::Member { group, user } => self
                .inner
                .groups
                .read()
                .get(group)
                .and_then(|members| members.get(user))
                .cloned(),
        }?;
        if found.is_closed() {
            self.release(key, found.id());
            return None;
        }
        Some(found)
    }

    /// Snapshot of the members present in `group` right now.
    pub fn members_of(&self, group: &str) -> Vec<(String, ConnectionHandle)> {
        self.inner
            .groups
            .read()
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .map(|(user, handle)| (user.clone(), handle.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        let direct = self.inner.direct.read().len();
        let groups = self.inner.groups.read();
        PresenceSnapshot {
            direct,
            groups: groups.len(),
            group_members: groups.values().map(HashMap::len).sum(),
        }
    }
}
