//! One socket session: register, pump inbound messages, unregister.

use std::sync::Arc;

use courier_core::UserId;
use futures::StreamExt;
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::connection::{Connection, ConnectionConfig};
use super::registry::ConnectionRegistry;
use super::transport::Transport;
use crate::dispatch::Dispatcher;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};

/// Shared pieces a session needs.
#[derive(Clone)]
pub struct SessionContext {
    /// Where the connection is registered.
    pub registry: Arc<ConnectionRegistry>,
    /// Handles inbound client messages.
    pub dispatcher: Arc<Dispatcher>,
    /// Per-connection timing and buffering.
    pub connection: ConnectionConfig,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
}

/// Run a session for `user` over `transport` until either side closes.
#[instrument(skip_all, fields(user = %user))]
pub async fn run_session<T: Transport>(transport: T, user: UserId, ctx: SessionContext) {
    let conn = Connection::spawn(transport, &ctx.connection);
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(conn_id = %conn.id(), "client connected");

    ctx.registry.add_connection(&user, Arc::clone(&conn));

    let mut inbound = conn.receive();
    loop {
        tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => {
                conn.close();
                break;
            }
            () = conn.done() => break,
            msg = inbound.next() => match msg {
                Some(msg) => ctx.dispatcher.handle_inbound(&user, &msg),
                None => break,
            },
        }
    }

    conn.close();
    if let Err(e) = ctx.registry.remove_connection(&user, conn.id()) {
        warn!(conn_id = %conn.id(), error = %e, "connection already unregistered");
    }

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(conn_id = %conn.id(), dropped = conn.dropped_count(), "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use courier_bus::{MessageHandler, NotificationBus};
    use courier_core::UserTopic;
    use courier_settings::SubscriptionMode;

    use crate::websocket::loopback;

    struct NullBus;

    impl NotificationBus for NullBus {
        fn publish(&self, _topic: &str, _payload: bytes::Bytes) -> courier_bus::Result<()> {
            Ok(())
        }
        fn subscribe(&self, _topic: &str) {}
        fn unsubscribe(&self, _topic: &str) {}
        fn psubscribe(&self, _pattern: &str) {}
        fn punsubscribe(&self, _pattern: &str) {}
        fn set_message_handler(&self, _handler: MessageHandler) {}
        fn live_nodes(&self) -> usize {
            1
        }
        fn close(&self) -> futures::future::BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn context() -> SessionContext {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(NullBus),
            UserTopic::default(),
            SubscriptionMode::PerUser,
        );
        SessionContext {
            registry,
            dispatcher,
            connection: ConnectionConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn session_registers_and_unregisters() {
        let ctx = context();
        let registry = Arc::clone(&ctx.registry);
        let (transport, mut peer) = loopback(8);
        let session = tokio::spawn(run_session(transport, UserId::from("u1"), ctx));

        wait_for(|| registry.is_connected(&UserId::from("u1"))).await;
        peer.disconnect();
        session.await.unwrap();
        assert_eq!(registry.user_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_session() {
        let ctx = context();
        let registry = Arc::clone(&ctx.registry);
        let shutdown = ctx.shutdown.clone();
        let (transport, _peer) = loopback(8);
        let session = tokio::spawn(run_session(transport, UserId::from("u1"), ctx));

        wait_for(|| registry.connection_count() == 1).await;
        shutdown.cancel();
        session.await.unwrap();
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn registry_messages_reach_peer() {
        let ctx = context();
        let registry = Arc::clone(&ctx.registry);
        let (transport, mut peer) = loopback(8);
        let _session = tokio::spawn(run_session(transport, UserId::from("u1"), ctx));

        wait_for(|| registry.is_connected(&UserId::from("u1"))).await;
        assert_eq!(registry.send_text(&UserId::from("u1"), "ping!").unwrap(), 1);
        assert_eq!(peer.recv_message().await.unwrap().as_text(), Some("ping!"));
    }
}
