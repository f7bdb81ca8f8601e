//! Per-node client and bus traits.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::NodeDescriptor;
use futures::future::BoxFuture;

use crate::errors::Result;

/// Callback for every inbound message: `(topic, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

/// Callback fired once when a node connection drops on its own.
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// One connection to one backend pub/sub node.
///
/// Subscription calls made before [`start`](Self::start) are queued and
/// applied once the connection is up.
#[async_trait]
pub trait NodeBus: Send + Sync + 'static {
    /// The node this connection is bound to.
    fn node(&self) -> &NodeDescriptor;

    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a literal topic.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Drop a literal topic subscription.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Subscribe to a glob pattern.
    async fn psubscribe(&self, pattern: &str) -> Result<()>;

    /// Drop a pattern subscription.
    async fn punsubscribe(&self, pattern: &str) -> Result<()>;

    /// Install the inbound message handler (replaces any previous one).
    fn set_message_handler(&self, handler: MessageHandler);

    /// Install the handler fired when the transport drops unexpectedly.
    fn set_disconnect_handler(&self, handler: DisconnectHandler);

    /// Begin connecting. Does not wait for the connection to be established.
    fn start(&self) -> Result<()>;

    /// Close the connection. The disconnect handler does not fire.
    async fn close(&self);
}

/// Builds a [`NodeBus`] for a discovered node.
pub trait NodeBusFactory: Send + Sync + 'static {
    /// Create an unstarted connection to `node`.
    fn create(&self, node: &NodeDescriptor) -> Arc<dyn NodeBus>;
}

/// The notification bus as seen by the connection service.
///
/// Subscription calls update the desired state and replicate it in the
/// background; they never fail.
pub trait NotificationBus: Send + Sync + 'static {
    /// Hand `payload` to one live node. Fails when no node is live.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Add a literal topic to the desired subscription set.
    fn subscribe(&self, topic: &str);

    /// Remove a literal topic from the desired subscription set.
    fn unsubscribe(&self, topic: &str);

    /// Add a pattern to the desired subscription set.
    fn psubscribe(&self, pattern: &str);

    /// Remove a pattern from the desired subscription set.
    fn punsubscribe(&self, pattern: &str);

    /// Install the handler for messages arriving on any node. Last writer wins.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Number of currently live nodes.
    fn live_nodes(&self) -> usize;

    /// Stop following membership and close every node connection. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}
