//! Per-connection lifecycle
//!
//! A [`Session`] moves through `Connecting → Open → Closing → Closed`.
//! Opening registers the connection's presence entry; closing releases it,
//! but only if no newer connection has replaced it under the same key.

use tokio::sync::mpsc::Receiver;
use tracing::{debug, info};

use crate::error::FrameError;
use crate::models::{Message, WireMessage};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, PresenceKey};
use crate::router::{MessageRouter, RouteOutcome, SessionClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Identity a client declares when opening its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Direct { user: String },
    Group { group: String, user: String },
}

impl Identity {
    pub fn user(&self) -> &str {
        match self {
            Identity::Direct { user } | Identity::Group { user, .. } => user,
        }
    }

    pub fn presence_key(&self) -> PresenceKey {
        match self {
            Identity::Direct { user } => PresenceKey::user(user.as_str()),
            Identity::Group { group, user } => PresenceKey::member(group.as_str(), user.as_str()),
        }
    }

    /// Check a decoded frame against this identity, filling in an empty
    /// sender (and, on group connections, an empty group).
    pub fn admit(&self, mut wire: WireMessage) -> Result<Message, FrameError> {
        let user = self.user();
        if wire.sender.is_empty() {
            wire.sender = user.to_string();
        } else if wire.sender != user {
            return Err(FrameError::SenderMismatch {
                claimed: wire.sender,
                actual: user.to_string(),
            });
        }

        let recipient = wire.recipient.take().filter(|r| !r.is_empty());
        let group = wire.group.take().filter(|g| !g.is_empty());
        match self {
            Identity::Direct { .. } => {
                if group.is_some() {
                    return Err(FrameError::GroupOnDirectConnection);
                }
                wire.recipient = recipient;
            }
            Identity::Group { group: own, .. } => {
                if recipient.is_some() {
                    return Err(FrameError::DirectOnGroupConnection);
                }
                match group {
                    Some(claimed) if &claimed != own => {
                        return Err(FrameError::GroupMismatch {
                            claimed,
                            actual: own.clone(),
                        });
                    }
                    _ => wire.group = Some(own.clone()),
                }
            }
        }

        Message::try_from(wire)
    }

    /// Parse one text frame and admit it.
    pub fn decode_frame(&self, text: &str) -> Result<Message, FrameError> {
        self.admit(WireMessage::parse(text)?)
    }
}

pub struct Session {
    id: ConnectionId,
    identity: Identity,
    key: PresenceKey,
    state: ConnectionState,
    clock: SessionClock,
    routed: u64,
    rejected: u64,
}

impl Session {
    pub fn new(identity: Identity) -> Self {
        let key = identity.presence_key();
        Self {
            id: ConnectionId::new(),
            identity,
            key,
            state: ConnectionState::Connecting,
            clock: SessionClock::default(),
            routed: 0,
            rejected: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn key(&self) -> &PresenceKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Register this connection and return the queue its writer drains.
    pub fn open(&mut self, registry: &ConnectionRegistry) -> Receiver<Message> {
        let (handle, outbound) = ConnectionHandle::channel(self.id);
        if let Some(previous) = registry.register(self.key.clone(), handle) {
            info!(
                "Connection {} for {} replaces connection {}",
                self.id,
                self.key,
                previous.id()
            );
        } else {
            info!("Connection {} opened for {}", self.id, self.key);
        }
        self.state = ConnectionState::Open;
        outbound
    }

    /// Decode and route one inbound text frame.
    pub fn receive(
        &mut self,
        text: &str,
        router: &MessageRouter,
    ) -> Result<RouteOutcome, FrameError> {
        match self.identity.decode_frame(text) {
            Ok(message) => {
                self.routed += 1;
                Ok(router.route_with(message, &mut self.clock))
            }
            Err(e) => {
                self.rejected += 1;
                Err(e)
            }
        }
    }

    pub fn begin_close(&mut self, reason: &str) {
        if self.state == ConnectionState::Open {
            debug!("Connection {} closing: {}", self.id, reason);
            self.state = ConnectionState::Closing;
        }
    }

    /// Release the presence entry. Safe to call more than once.
    pub fn close(&mut self, registry: &ConnectionRegistry) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let released = registry.release(&self.key, self.id);
        self.state = ConnectionState::Closed;
        info!(
            "Connection {} for {} closed ({} routed, {} rejected{})",
            self.id,
            self.key,
            self.routed,
            self.rejected,
            if released { "" } else { ", already replaced" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender::{Appender, AppenderConfig};
    use crate::store::SqliteStore;
    use std::sync::Arc;

    fn direct(user: &str) -> Identity {
        Identity::Direct {
            user: user.to_string(),
        }
    }

    fn group(group: &str, user: &str) -> Identity {
        Identity::Group {
            group: group.to_string(),
            user: user.to_string(),
        }
    }

    #[test]
    fn empty_sender_is_filled_from_identity() {
        let message = direct("alice")
            .decode_frame(r#"{"recipient":"bob","content":"hi"}"#)
            .unwrap();
        assert_eq!(message.sender(), "alice");
        assert_eq!(message.recipient(), Some("bob"));
    }

    #[test]
    fn spoofed_sender_is_rejected() {
        let err = direct("alice")
            .decode_frame(r#"{"sender":"mallory","recipient":"bob","content":"hi"}"#)
            .unwrap_err();
        assert!(matches!(err, FrameError::SenderMismatch { .. }));
    }

    #[test]
    fn group_connection_fills_and_checks_group() {
        let id = group("g1", "alice");
        let message = id.decode_frame(r#"{"content":"hey"}"#).unwrap();
        assert_eq!(message.group_id(), Some("g1"));

        let message = id
            .decode_frame(r#"{"sender":"alice","group_id":"g1","content":"hey"}"#)
            .unwrap();
        assert_eq!(message.group_id(), Some("g1"));

        assert!(matches!(
            id.decode_frame(r#"{"group":"g2","content":"hey"}"#),
            Err(FrameError::GroupMismatch { .. })
        ));
        assert!(matches!(
            id.decode_frame(r#"{"recipient":"bob","content":"hey"}"#),
            Err(FrameError::DirectOnGroupConnection)
        ));
    }

    #[test]
    fn direct_connection_rejects_group_frames() {
        assert!(matches!(
            direct("alice").decode_frame(r#"{"group":"g1","content":"hey"}"#),
            Err(FrameError::GroupOnDirectConnection)
        ));
        assert!(matches!(
            direct("alice").decode_frame(r#"{"content":"hey"}"#),
            Err(FrameError::MissingTarget)
        ));
        assert!(matches!(
            direct("alice").decode_frame("not json"),
            Err(FrameError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn lifecycle_registers_and_releases() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let registry = ConnectionRegistry::new();
        let appender = Arc::new(Appender::start(store, AppenderConfig::default()));
        let router = MessageRouter::new(registry.clone(), appender);

        let mut session = Session::new(direct("alice"));
        assert_eq!(session.state(), ConnectionState::Connecting);

        let _outbound = session.open(&registry);
        assert_eq!(session.state(), ConnectionState::Open);
        assert!(registry.lookup(session.key()).is_some());

        let outcome = session
            .receive(r#"{"recipient":"bob","content":"hi"}"#, &router)
            .unwrap();
        assert!(outcome.queued_for_persistence);
        assert!(session.receive("{", &router).is_err());

        session.begin_close("client closed");
        assert_eq!(session.state(), ConnectionState::Closing);
        session.close(&registry);
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(registry.lookup(&PresenceKey::user("alice")).is_none());
    }

    #[tokio::test]
    async fn client_timestamp_is_replaced_by_receipt_time() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let registry = ConnectionRegistry::new();
        let appender = Arc::new(Appender::start(store, AppenderConfig::default()));
        let router = MessageRouter::new(registry.clone(), appender);

        let mut bob = Session::new(direct("bob"));
        let mut inbox = bob.open(&registry);
        let mut alice = Session::new(direct("alice"));
        let _alice_rx = alice.open(&registry);

        let before = chrono::Utc::now();
        for frame in [
            r#"{"recipient":"bob","content":"epoch","timestamp":1700000000}"#,
            r#"{"recipient":"bob","content":"loose","timestamp":"2024-01-01 10:00"}"#,
            r#"{"recipient":"bob","content":"old","timestamp":"2001-01-01T00:00:00Z"}"#,
        ] {
            let outcome = alice.receive(frame, &router).unwrap();
            assert_eq!(outcome.delivered, 1);

            let received = inbox.try_recv().unwrap();
            assert!(received.timestamp().unwrap() >= before);
        }
    }

    #[test]
    fn closing_a_replaced_session_keeps_the_newer_one() {
        let registry = ConnectionRegistry::new();
        let mut first = Session::new(direct("alice"));
        let mut second = Session::new(direct("alice"));
        let _first_rx = first.open(&registry);
        let _second_rx = second.open(&registry);

        first.close(&registry);
        let live = registry.lookup(&PresenceKey::user("alice")).unwrap();
        assert_eq!(live.id(), second.id());
    }
}
