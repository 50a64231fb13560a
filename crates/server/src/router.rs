//! Message router
//!
//! Stamps an inbound message, hands it to the appender and forwards it to
//! every live recipient. Forwarding is best-effort: one attempt per present
//! recipient, no retry, nothing buffered for recipients that are offline.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::appender::Appender;
use crate::models::{Message, Target};
use crate::registry::{ConnectionHandle, ConnectionRegistry, PresenceKey};

/// What happened to one routed message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Live handles the message was forwarded to
    pub delivered: usize,
    /// Handles that were closed or had a full outbound queue
    pub failed: usize,
    /// Whether the appender accepted the message
    pub queued_for_persistence: bool,
}

/// Receipt clock for one connection.
///
/// Never goes backwards, even if the system clock does.
#[derive(Debug, Default)]
pub struct SessionClock {
    last: Option<DateTime<Utc>>,
}

impl SessionClock {
    pub fn now(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

pub struct MessageRouter {
    registry: ConnectionRegistry,
    appender: Arc<Appender>,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry, appender: Arc<Appender>) -> Self {
        Self { registry, appender }
    }

    /// Route a message stamped with the current server time.
    pub fn route(&self, message: Message) -> RouteOutcome {
        self.dispatch(message.stamped(Utc::now()))
    }

    /// Route a message stamped by a connection's own clock.
    pub fn route_with(&self, message: Message, clock: &mut SessionClock) -> RouteOutcome {
        self.dispatch(message.stamped(clock.now()))
    }

    fn dispatch(&self, message: Message) -> RouteOutcome {
        let queued = self
            .appender
            .submit(message.conversation_key(), message.clone());

        let mut outcome = RouteOutcome {
            queued_for_persistence: queued,
            ..RouteOutcome::default()
        };

        for (key, handle) in self.recipients(&message) {
            match handle.forward(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!("Forward to {} failed: {}", key, e);
                    self.registry.release(&key, handle.id());
                }
            }
        }

        if outcome.delivered == 0 {
            debug!(
                "No live recipient for message from {} to {}",
                message.sender(),
                message.conversation_key()
            );
        }
        outcome
    }

    fn recipients(&self, message: &Message) -> Vec<(PresenceKey, ConnectionHandle)> {
        match message.target() {
            Target::Direct { recipient } => {
                let key = PresenceKey::user(recipient.as_str());
                self.registry
                    .lookup(&key)
                    .map(|handle| vec![(key, handle)])
                    .unwrap_or_default()
            }
            Target::Group { group } => self
                .registry
                .members_of(group)
                .into_iter()
                .filter(|(user, _)| user != message.sender())
                .map(|(user, handle)| (PresenceKey::member(group.as_str(), user), handle))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender::AppenderConfig;
    use crate::models::ConversationKey;
    use crate::registry::ConnectionId;
    use crate::store::{ConversationStore, SqliteStore};
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        registry: ConnectionRegistry,
        appender: Arc<Appender>,
        router: MessageRouter,
        store: Arc<SqliteStore>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let registry = ConnectionRegistry::new();
        let appender = Arc::new(Appender::start(store.clone(), AppenderConfig::default()));
        let router = MessageRouter::new(registry.clone(), appender.clone());
        Fixture {
            registry,
            appender,
            router,
            store,
        }
    }

    fn connect(registry: &ConnectionRegistry, key: PresenceKey) -> Receiver<Message> {
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::new());
        registry.register(key, handle);
        rx
    }

    #[tokio::test]
    async fn test_direct_message_reaches_recipient_once() {
        let f = fixture().await;
        let _alice = connect(&f.registry, PresenceKey::user("alice"));
        let mut bob = connect(&f.registry, PresenceKey::user("bob"));

        let outcome = f.router.route(Message::direct("alice", "bob", "hi"));
        assert_eq!(outcome.delivered, 1);
        assert!(outcome.queued_for_persistence);

        let received = bob.try_recv().unwrap();
        assert_eq!(received.sender(), "alice");
        assert_eq!(received.content(), "hi");
        assert!(received.timestamp().is_some());
        assert!(bob.try_recv().is_err());

        f.appender.wait_idle().await;
        let history = f
            .store
            .history(&ConversationKey::direct("bob", "alice"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_group_message_skips_sender() {
        let f = fixture().await;
        let mut a = connect(&f.registry, PresenceKey::member("g", "a"));
        let mut b = connect(&f.registry, PresenceKey::member("g", "b"));
        let mut c = connect(&f.registry, PresenceKey::member("g", "c"));
        let mut other = connect(&f.registry, PresenceKey::member("h", "d"));

        let outcome = f.router.route(Message::group("a", "g", "hello all"));
        assert_eq!(outcome.delivered, 2);

        assert_eq!(b.try_recv().unwrap().content(), "hello all");
        assert_eq!(c.try_recv().unwrap().content(), "hello all");
        assert!(a.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_recipient_is_still_persisted() {
        let f = fixture().await;
        let outcome = f.router.route(Message::direct("erin", "dave", "are you there"));
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.queued_for_persistence);

        f.appender.wait_idle().await;
        let history = f
            .store
            .history(&ConversationKey::direct("dave", "erin"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content(), "are you there");
    }

    #[tokio::test]
    async fn test_dead_handle_is_released_and_others_still_served() {
        let f = fixture().await;
        let dead = connect(&f.registry, PresenceKey::member("g", "b"));
        let mut live = connect(&f.registry, PresenceKey::member("g", "c"));
        drop(dead);

        let outcome = f.router.route(Message::group("a", "g", "ping"));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 1);
        assert!(live.try_recv().is_ok());
        assert!(f.registry.lookup(&PresenceKey::member("g", "b")).is_none());

        f.appender.wait_idle().await;
        assert_eq!(
            f.store
                .history(&ConversationKey::group("g"))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stalled_reader_is_released_without_blocking_others() {
        let f = fixture().await;
        let (stalled, _undrained) = ConnectionHandle::with_capacity(ConnectionId::new(), 2);
        f.registry.register(PresenceKey::member("g", "slow"), stalled);
        let mut fast = connect(&f.registry, PresenceKey::member("g", "fast"));

        for i in 0..2 {
            let outcome = f.router.route(Message::group("a", "g", format!("m{}", i)));
            assert_eq!(outcome.delivered, 2);
        }

        let outcome = f.router.route(Message::group("a", "g", "m2"));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 1);
        assert!(f.registry.lookup(&PresenceKey::member("g", "slow")).is_none());

        for i in 0..3 {
            assert_eq!(fast.try_recv().unwrap().content(), format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_unregistered_user_gets_nothing() {
        let f = fixture().await;
        let mut bob = connect(&f.registry, PresenceKey::user("bob"));
        f.registry.unregister(&PresenceKey::user("bob"));

        let outcome = f.router.route(Message::direct("alice", "bob", "gone?"));
        assert_eq!(outcome.delivered, 0);
        assert!(bob.try_recv().is_err());
    }

    #[test]
    fn session_clock_never_goes_backwards() {
        let mut clock = SessionClock::default();
        let mut previous = clock.now();
        for _ in 0..100 {
            let next = clock.now();
            assert!(next >= previous);
            previous = next;
        }
    }
}
