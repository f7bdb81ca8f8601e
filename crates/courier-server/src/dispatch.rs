//! Wiring between the connection registry and the notification bus.
//!
//! Outbound: messages arriving on a user's delivery topic are queued on
//! every local connection of that user.
//!
//! Subscriptions follow the configured [`SubscriptionMode`]: `PerUser`
//! subscribes a user's topic when the user gets its first local connection
//! and unsubscribes when the last one goes away; `Pattern` subscribes the
//! prefix pattern once and filters locally.
//!
//! Inbound: a text frame `{"to": "<user>", "data": ...}` from a client is
//! published to the recipient's delivery topic.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use courier_bus::{BusError, NotificationBus};
use courier_core::{UserId, UserTopic};
use courier_settings::SubscriptionMode;
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::RegistryError;
use crate::metrics::{INBOUND_PUBLISHES_TOTAL, INBOUND_REJECTED_TOTAL};
use crate::websocket::{ConnectionRegistry, WsMessage};

/// Client-to-client envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    to: String,
    data: serde_json::Value,
}

/// Routes messages between the bus and local connections.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn NotificationBus>,
    topic: UserTopic,
    mode: SubscriptionMode,
}

impl Dispatcher {
    /// Create a dispatcher. Call [`Dispatcher::wire`] to connect the pieces.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bus: Arc<dyn NotificationBus>,
        topic: UserTopic,
        mode: SubscriptionMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            bus,
            topic,
            mode,
        })
    }

    /// Install the bus message handler and the subscription policy.
    pub fn wire(&self) {
        let registry = Arc::downgrade(&self.registry);
        let topic = self.topic.clone();
        self.bus
            .set_message_handler(Arc::new(move |channel: &str, payload: Bytes| {
                deliver(&registry, &topic, channel, payload);
            }));

        match self.mode {
            SubscriptionMode::PerUser => {
                let (bus, topic) = (Arc::clone(&self.bus), self.topic.clone());
                self.registry.on_user_connected(Arc::new(move |user: &UserId| {
                    bus.subscribe(&topic.for_user(user));
                }));
                let (bus, topic) = (Arc::clone(&self.bus), self.topic.clone());
                self.registry.on_user_disconnected(Arc::new(move |user: &UserId| {
                    bus.unsubscribe(&topic.for_user(user));
                }));
            }
            SubscriptionMode::Pattern => {
                self.bus.psubscribe(&self.topic.pattern());
            }
        }
        debug!(mode = ?self.mode, prefix = self.topic.prefix(), "dispatcher wired");
    }

    /// Handle a message a client sent over its socket.
    pub fn handle_inbound(&self, from: &UserId, message: &WsMessage) {
        let Some(text) = message.as_text() else {
            debug!(user = %from, "ignoring binary frame from client");
            counter!(INBOUND_REJECTED_TOTAL).increment(1);
            return;
        };
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(user = %from, error = %e, "ignoring malformed envelope");
                counter!(INBOUND_REJECTED_TOTAL).increment(1);
                return;
            }
        };
        if envelope.to.is_empty() {
            debug!(user = %from, "ignoring envelope without recipient");
            counter!(INBOUND_REJECTED_TOTAL).increment(1);
            return;
        }

        let payload = match envelope.data {
            serde_json::Value::String(s) => Bytes::from(s),
            other => Bytes::from(other.to_string()),
        };
        let topic = self.topic.for_user(&UserId::from(envelope.to));
        match self.bus.publish(&topic, payload) {
            Ok(()) => counter!(INBOUND_PUBLISHES_TOTAL).increment(1),
            Err(BusError::NoLiveNodes) => {
                warn!(user = %from, topic, "no live bus nodes, dropping client message");
            }
            Err(e) => warn!(user = %from, topic, error = %e, "publish failed"),
        }
    }
}

fn deliver(registry: &Weak<ConnectionRegistry>, topic: &UserTopic, channel: &str, payload: Bytes) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let Some(user) = topic.user_of(channel) else {
        debug!(channel, "message on non-user topic, ignoring");
        return;
    };
    match registry.send_message(&user, &WsMessage::from_payload(payload)) {
        Ok(delivered) => debug!(user = %user, delivered, "delivered bus message"),
        Err(RegistryError::NotFound(_)) => {
            debug!(user = %user, "no local connections for user");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_bus::MessageHandler;
    use futures::StreamExt;
    use parking_lot::Mutex;

    use crate::websocket::{Connection, ConnectionConfig, FrameKind, loopback};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Publish(String, Bytes),
        Subscribe(String),
        Unsubscribe(String),
        PSubscribe(String),
    }

    #[derive(Default)]
    struct RecordingBus {
        calls: Mutex<Vec<Call>>,
        handler: Mutex<Option<MessageHandler>>,
        live: usize,
    }

    impl RecordingBus {
        fn new(live: usize) -> Arc<Self> {
            Arc::new(Self {
                live,
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn emit(&self, channel: &str, payload: &'static [u8]) {
            let handler = self.handler.lock().clone().unwrap();
            handler(channel, Bytes::from_static(payload));
        }
    }

    impl NotificationBus for RecordingBus {
        fn publish(&self, topic: &str, payload: Bytes) -> courier_bus::Result<()> {
            if self.live == 0 {
                return Err(BusError::NoLiveNodes);
            }
            self.calls.lock().push(Call::Publish(topic.into(), payload));
            Ok(())
        }

        fn subscribe(&self, topic: &str) {
            self.calls.lock().push(Call::Subscribe(topic.into()));
        }

        fn unsubscribe(&self, topic: &str) {
            self.calls.lock().push(Call::Unsubscribe(topic.into()));
        }

        fn psubscribe(&self, pattern: &str) {
            self.calls.lock().push(Call::PSubscribe(pattern.into()));
        }

        fn punsubscribe(&self, _pattern: &str) {}

        fn set_message_handler(&self, handler: MessageHandler) {
            *self.handler.lock() = Some(handler);
        }

        fn live_nodes(&self) -> usize {
            self.live
        }

        fn close(&self) -> futures::future::BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn setup(mode: SubscriptionMode) -> (Arc<Dispatcher>, Arc<ConnectionRegistry>, Arc<RecordingBus>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = RecordingBus::new(1);
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            bus.clone(),
            UserTopic::default(),
            mode,
        );
        dispatcher.wire();
        (dispatcher, registry, bus)
    }

    #[tokio::test]
    async fn per_user_mode_follows_first_and_last_connection() {
        let (_d, registry, bus) = setup(SubscriptionMode::PerUser);
        let u1 = UserId::from("u1");
        let (t1, _p1) = loopback(8);
        let (t2, _p2) = loopback(8);
        let a = Connection::spawn(t1, &ConnectionConfig::default());
        let b = Connection::spawn(t2, &ConnectionConfig::default());

        registry.add_connection(&u1, Arc::clone(&a));
        registry.add_connection(&u1, Arc::clone(&b));
        assert_eq!(bus.calls(), vec![Call::Subscribe("/to/user/u1".into())]);

        registry.remove_connection(&u1, a.id()).unwrap();
        registry.remove_connection(&u1, b.id()).unwrap();
        assert_eq!(
            bus.calls(),
            vec![
                Call::Subscribe("/to/user/u1".into()),
                Call::Unsubscribe("/to/user/u1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn pattern_mode_subscribes_once() {
        let (_d, registry, bus) = setup(SubscriptionMode::Pattern);
        let (t, _p) = loopback(8);
        registry.add_connection(&UserId::from("u1"), Connection::spawn(t, &ConnectionConfig::default()));
        assert_eq!(bus.calls(), vec![Call::PSubscribe("/to/user/*".into())]);
    }

    #[tokio::test]
    async fn bus_message_reaches_user_connection() {
        let (_d, registry, bus) = setup(SubscriptionMode::PerUser);
        let (t, mut peer) = loopback(8);
        registry.add_connection(&UserId::from("u1"), Connection::spawn(t, &ConnectionConfig::default()));

        bus.emit("/to/user/u1", b"hello");
        let msg = peer.recv_message().await.unwrap();
        assert_eq!(msg.kind, FrameKind::Text);
        assert_eq!(msg.as_text(), Some("hello"));

        bus.emit("/to/user/u1", &[0xff, 0xfe]);
        let msg = peer.recv_message().await.unwrap();
        assert_eq!(msg.kind, FrameKind::Binary);
    }

    #[tokio::test]
    async fn bus_message_for_unknown_user_is_ignored() {
        let (_d, _registry, bus) = setup(SubscriptionMode::Pattern);
        bus.emit("/to/user/nobody", b"x");
        bus.emit("/elsewhere", b"x");
    }

    #[tokio::test]
    async fn inbound_envelope_is_published() {
        let (d, _registry, bus) = setup(SubscriptionMode::Pattern);
        let from = UserId::from("u1");

        d.handle_inbound(&from, &WsMessage::text(r#"{"to":"u2","data":"hi"}"#));
        d.handle_inbound(&from, &WsMessage::text(r#"{"to":"u3","data":{"n":1}}"#));

        let calls = bus.calls();
        assert_eq!(calls[1], Call::Publish("/to/user/u2".into(), Bytes::from_static(b"hi")));
        assert_eq!(
            calls[2],
            Call::Publish("/to/user/u3".into(), Bytes::from_static(br#"{"n":1}"#))
        );
    }

    #[tokio::test]
    async fn malformed_inbound_is_dropped() {
        let (d, _registry, bus) = setup(SubscriptionMode::PerUser);
        let from = UserId::from("u1");
        d.handle_inbound(&from, &WsMessage::text("not json"));
        d.handle_inbound(&from, &WsMessage::text(r#"{"to":"","data":1}"#));
        d.handle_inbound(&from, &WsMessage::binary(&b"{}"[..]));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn inbound_without_live_nodes_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = RecordingBus::new(0);
        let d = Dispatcher::new(registry, bus.clone(), UserTopic::default(), SubscriptionMode::PerUser);
        d.handle_inbound(&UserId::from("u1"), &WsMessage::text(r#"{"to":"u2","data":"x"}"#));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn receive_stream_feeds_dispatcher() {
        let (d, _registry, bus) = setup(SubscriptionMode::Pattern);
        let (t, mut peer) = loopback(8);
        let conn = Connection::spawn(t, &ConnectionConfig::default());
        let mut inbound = conn.receive();

        assert!(
            peer.send(crate::websocket::Frame::Message(WsMessage::text(
                r#"{"to":"u9","data":"yo"}"#
            )))
            .await
        );
        let msg = inbound.next().await.unwrap();
        d.handle_inbound(&UserId::from("u1"), &msg);
        assert!(bus.calls().contains(&Call::Publish(
            "/to/user/u9".into(),
            Bytes::from_static(b"yo")
        )));
    }
}
