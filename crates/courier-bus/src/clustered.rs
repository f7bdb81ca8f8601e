//! Clustered notification bus.
//!
//! Keeps one [`NodeBus`] per node reported by a [`DiscoveryWatcher`]:
//!
//! - removed nodes are dropped from the live set and closed
//! - added nodes get the shared message handler, a disconnect handler that
//!   evicts them, a replay of the desired subscription state, and are then
//!   started and made live
//! - subscription calls update the desired state and are queued on every
//!   live node
//! - a publish goes to one live node picked uniformly at random
//!
//! Replication is fire-and-forget for the caller. Each node drains its own
//! queue with a single task, so calls reach a node in the order they were
//! made. A node that joins queues the full state under the same lock that
//! subscription calls take, so its queue starts from a consistent snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use courier_core::{ClusterDiffEvent, NodeDescriptor};
use courier_discovery::{DiscoveryError, DiscoveryWatcher};
use futures::future::BoxFuture;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::errors::{BusError, Result};
use crate::metrics::{
    BUS_LIVE_NODES, BUS_NODE_JOINS_TOTAL, BUS_NODE_LEAVES_TOTAL, BUS_PUBLISH_FAILURES_TOTAL,
    BUS_PUBLISHES_TOTAL, BUS_REPLICATION_FAILURES_TOTAL,
};
use crate::node::{MessageHandler, NodeBus, NodeBusFactory, NotificationBus};
use crate::subscriptions::{SubscriptionOp, SubscriptionState};

type Replication = (SubscriptionOp, String);

/// A live node connection. `generation` tells apart successive connections
/// to the same descriptor.
struct LiveNode {
    generation: u64,
    bus: Arc<dyn NodeBus>,
    replication: mpsc::UnboundedSender<Replication>,
}

impl LiveNode {
    fn enqueue(&self, op: SubscriptionOp, arg: &str) {
        if self.replication.send((op, arg.to_string())).is_err() {
            debug!(node = %self.bus.node(), op = op.name(), arg, "replication queue closed");
        }
    }
}

struct Inner {
    watcher: DiscoveryWatcher,
    factory: Arc<dyn NodeBusFactory>,
    nodes: RwLock<HashMap<NodeDescriptor, LiveNode>>,
    subscriptions: Mutex<SubscriptionState>,
    handler: RwLock<Option<MessageHandler>>,
    generation: AtomicU64,
    closed: AtomicBool,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

/// Notification bus over a discovered set of backend nodes.
pub struct ClusteredBus {
    inner: Arc<Inner>,
}

impl ClusteredBus {
    /// Create a bus driven by `watcher`, building node connections with `factory`.
    pub fn new(watcher: DiscoveryWatcher, factory: Arc<dyn NodeBusFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                watcher,
                factory,
                nodes: RwLock::new(HashMap::new()),
                subscriptions: Mutex::new(SubscriptionState::new()),
                handler: RwLock::new(None),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                reconciler: Mutex::new(None),
            }),
        }
    }

    /// Start the discovery watcher and the reconciliation loop.
    pub fn start(&self) -> Result<()> {
        let mut events = self
            .inner
            .watcher
            .events()
            .ok_or(BusError::Discovery(DiscoveryError::AlreadyStarted))?;
        self.inner.watcher.start()?;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            info!("cluster reconciliation started");
            while let Some(diff) = events.recv().await {
                inner.reconcile(diff);
            }
            info!("membership stream ended, closing node connections");
            inner.close_nodes().await;
        });
        *self.inner.reconciler.lock() = Some(handle);
        Ok(())
    }

    /// Forward `payload` to one live node picked at random.
    ///
    /// Fails with [`BusError::NoLiveNodes`] when the live set is empty; the
    /// message is dropped. Node-level failures are only logged.
    pub fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let bus = self
            .inner
            .nodes
            .read()
            .values()
            .choose(&mut rand::rng())
            .map(|live| Arc::clone(&live.bus));
        let Some(bus) = bus else {
            counter!(BUS_PUBLISH_FAILURES_TOTAL).increment(1);
            return Err(BusError::NoLiveNodes);
        };

        counter!(BUS_PUBLISHES_TOTAL).increment(1);
        let topic = topic.to_string();
        drop(tokio::spawn(async move {
            if let Err(e) = bus.publish(&topic, payload).await {
                counter!(BUS_PUBLISH_FAILURES_TOTAL).increment(1);
                warn!(node = %bus.node(), topic = %topic, error = %e, "publish failed");
            }
        }));
        Ok(())
    }

    /// Subscribe every node to `topic`.
    pub fn subscribe(&self, topic: &str) {
        self.inner.replicate(SubscriptionOp::Subscribe, topic);
    }

    /// Unsubscribe every node from `topic`.
    pub fn unsubscribe(&self, topic: &str) {
        self.inner.replicate(SubscriptionOp::Unsubscribe, topic);
    }

    /// Subscribe every node to `pattern`.
    pub fn psubscribe(&self, pattern: &str) {
        self.inner.replicate(SubscriptionOp::PSubscribe, pattern);
    }

    /// Unsubscribe every node from `pattern`.
    pub fn punsubscribe(&self, pattern: &str) {
        self.inner.replicate(SubscriptionOp::PUnsubscribe, pattern);
    }

    /// Install the handler for messages from any node. Applies to nodes that
    /// already joined as well.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Descriptors of the live nodes.
    pub fn live_nodes(&self) -> Vec<NodeDescriptor> {
        self.inner.nodes.read().keys().cloned().collect()
    }

    /// Snapshot of the desired subscription state.
    pub fn subscriptions(&self) -> SubscriptionState {
        self.inner.subscriptions.lock().clone()
    }

    /// Stop discovery and close every node connection.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.watcher.close();
        self.inner.close_nodes().await;
        let handle = self.inner.reconciler.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("clustered bus closed");
    }
}

impl Drop for ClusteredBus {
    fn drop(&mut self) {
        self.inner.watcher.close();
    }
}

impl NotificationBus for ClusteredBus {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        Self::publish(self, topic, payload)
    }

    fn subscribe(&self, topic: &str) {
        Self::subscribe(self, topic);
    }

    fn unsubscribe(&self, topic: &str) {
        Self::unsubscribe(self, topic);
    }

    fn psubscribe(&self, pattern: &str) {
        Self::psubscribe(self, pattern);
    }

    fn punsubscribe(&self, pattern: &str) {
        Self::punsubscribe(self, pattern);
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        Self::set_message_handler(self, handler);
    }

    fn live_nodes(&self) -> usize {
        self.inner.nodes.read().len()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(Self::close(self))
    }
}

impl Inner {
    #[instrument(skip_all, fields(added = diff.added.len(), removed = diff.removed.len()))]
    fn reconcile(self: &Arc<Self>, diff: ClusterDiffEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // removals first: a node that moved shows up in both sets
        for node in diff.removed {
            let removed = self.nodes.write().remove(&node);
            if let Some(live) = removed {
                info!(node = %node, "node left");
                record_leave();
                drop(tokio::spawn(async move { live.bus.close().await }));
            }
        }
        for node in diff.added {
            self.join(node);
        }
    }

    fn join(self: &Arc<Self>, node: NodeDescriptor) {
        if self.nodes.read().contains_key(&node) {
            debug!(node = %node, "node already live");
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let bus = self.factory.create(&node);
        let gone = Arc::new(AtomicBool::new(false));

        let weak = Arc::downgrade(self);
        bus.set_message_handler(Arc::new(move |topic: &str, payload: Bytes| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(topic, payload);
            }
        }));

        let weak = Arc::downgrade(self);
        let flag = Arc::clone(&gone);
        let descriptor = node.clone();
        bus.set_disconnect_handler(Arc::new(move || {
            flag.store(true, Ordering::Release);
            if let Some(inner) = weak.upgrade() {
                inner.evict(&descriptor, generation);
            }
        }));

        // held until the node is live so no subscription change slips between replay and insert
        let subscriptions = self.subscriptions.lock();
        let (replication, queue) = mpsc::unbounded_channel();
        for item in subscriptions.replay() {
            let _ = replication.send(item);
        }
        spawn_replicator(Arc::clone(&bus), queue);

        if let Err(e) = bus.start() {
            warn!(node = %node, error = %e, "failed to start node connection");
            return;
        }

        {
            let mut nodes = self.nodes.write();
            let live = LiveNode {
                generation,
                bus,
                replication,
            };
            let _ = nodes.insert(node.clone(), live);
            if gone.load(Ordering::Acquire) {
                let _ = nodes.remove(&node);
                warn!(node = %node, "node connection dropped while joining");
                return;
            }
        }
        drop(subscriptions);

        info!(node = %node, generation, "node joined");
        counter!(BUS_NODE_JOINS_TOTAL).increment(1);
        gauge!(BUS_LIVE_NODES).increment(1.0);
    }

    /// Drop `node` from the live set if it is still the given connection.
    fn evict(&self, node: &NodeDescriptor, generation: u64) {
        let mut nodes = self.nodes.write();
        if nodes.get(node).is_some_and(|live| live.generation == generation) {
            let _ = nodes.remove(node);
            drop(nodes);
            warn!(node = %node, "node connection lost, removed from live set");
            record_leave();
        }
    }

    fn dispatch(&self, topic: &str, payload: Bytes) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(topic, payload),
            None => debug!(topic, "no message handler installed"),
        }
    }

    fn replicate(&self, op: SubscriptionOp, arg: &str) {
        let mut subscriptions = self.subscriptions.lock();
        let _ = subscriptions.record(op, arg);
        let nodes = self.nodes.read();
        debug!(op = op.name(), arg, nodes = nodes.len(), "replicating subscription");
        for live in nodes.values() {
            live.enqueue(op, arg);
        }
    }

    async fn close_nodes(&self) {
        let drained: Vec<LiveNode> = self.nodes.write().drain().map(|(_, live)| live).collect();
        for _ in &drained {
            record_leave();
        }
        futures::future::join_all(drained.iter().map(|live| live.bus.close())).await;
    }
}

/// Apply queued subscription calls to `bus` one at a time. Ends once the
/// node's [`LiveNode`] is gone and the queue is drained.
fn spawn_replicator(bus: Arc<dyn NodeBus>, mut queue: mpsc::UnboundedReceiver<Replication>) {
    drop(tokio::spawn(async move {
        while let Some((op, arg)) = queue.recv().await {
            if let Err(e) = op.apply(bus.as_ref(), &arg).await {
                counter!(BUS_REPLICATION_FAILURES_TOTAL).increment(1);
                warn!(node = %bus.node(), op = op.name(), arg = %arg, error = %e, "subscription replication failed");
            }
        }
        debug!(node = %bus.node(), "replication queue drained");
    }));
}

fn record_leave() {
    counter!(BUS_NODE_LEAVES_TOTAL).increment(1);
    gauge!(BUS_LIVE_NODES).decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCluster, MemoryNodeBus, NodeCall};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use courier_discovery::{MembershipSource, ServiceInstance, StaticMembership};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Membership snapshots pushed by the test.
    struct Pushed(mpsc::UnboundedReceiver<Vec<ServiceInstance>>);

    #[async_trait]
    impl MembershipSource for Pushed {
        async fn watch(&mut self) -> courier_discovery::Result<Vec<ServiceInstance>> {
            match self.0.recv().await {
                Some(snapshot) => Ok(snapshot),
                None => std::future::pending().await,
            }
        }
    }

    struct Harness {
        bus: ClusteredBus,
        cluster: Arc<MemoryCluster>,
        membership: mpsc::UnboundedSender<Vec<ServiceInstance>>,
    }

    impl Harness {
        fn new() -> Self {
            let (membership, rx) = mpsc::unbounded_channel();
            let cluster = MemoryCluster::new();
            let bus = ClusteredBus::new(DiscoveryWatcher::new(Pushed(rx)), cluster.clone());
            Self {
                bus,
                cluster,
                membership,
            }
        }

        fn push(&self, ids: &[&str]) {
            self.membership
                .send(ids.iter().map(|id| instance(id, "127.0.0.1")).collect())
                .unwrap();
        }

        fn bus_for(&self, node: &NodeDescriptor) -> Arc<MemoryNodeBus> {
            self.cluster.buses_for(node).pop().expect("no bus created for node")
        }

        async fn wait_live(&self, count: usize) {
            wait_until(|| self.bus.live_nodes().len() == count).await;
        }
    }

    fn instance(id: &str, host: &str) -> ServiceInstance {
        ServiceInstance {
            node_id: id.into(),
            host: host.into(),
            address: String::new(),
            port: 6379,
        }
    }

    fn node(id: &str) -> NodeDescriptor {
        instance(id, "127.0.0.1").descriptor()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn publish_without_live_nodes_fails() {
        let h = Harness::new();
        assert_matches!(h.bus.publish("t", Bytes::from_static(b"x")), Err(BusError::NoLiveNodes));
        h.bus.start().unwrap();
        assert_matches!(h.bus.publish("t", Bytes::from_static(b"x")), Err(BusError::NoLiveNodes));
        assert_eq!(h.cluster.created_count(), 0);
    }

    #[tokio::test]
    async fn subscription_is_replayed_on_join() {
        let h = Harness::new();
        h.bus.subscribe("t1");
        h.bus.psubscribe("/to/user/*");
        h.bus.start().unwrap();
        h.push(&["a"]);
        h.wait_live(1).await;

        let a = h.bus_for(&node("a"));
        wait_until(|| {
            let calls = a.calls();
            calls.contains(&NodeCall::Subscribe("t1".into()))
                && calls.contains(&NodeCall::PSubscribe("/to/user/*".into()))
        })
        .await;
        assert!(a.is_started());
    }

    #[tokio::test]
    async fn subscription_replicates_to_every_live_node() {
        let h = Harness::new();
        h.bus.start().unwrap();
        h.push(&["a", "b"]);
        h.wait_live(2).await;

        h.bus.subscribe("t");
        h.bus.unsubscribe("t");
        for id in ["a", "b"] {
            let bus = h.bus_for(&node(id));
            wait_until(|| {
                let calls = bus.calls();
                calls.contains(&NodeCall::Subscribe("t".into()))
                    && calls.contains(&NodeCall::Unsubscribe("t".into()))
            })
            .await;
        }
        assert!(!h.bus.subscriptions().has_topic("t"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replication_reaches_node_in_call_order() {
        let h = Harness::new();
        h.bus.start().unwrap();
        h.push(&["a"]);
        h.wait_live(1).await;

        let topics: Vec<String> = (0..2000).map(|i| format!("/to/user/u{i}")).collect();
        for topic in &topics {
            h.bus.subscribe(topic);
            h.bus.unsubscribe(topic);
            h.bus.subscribe(topic);
        }

        let a = h.bus_for(&node("a"));
        let last = NodeCall::Subscribe(topics[topics.len() - 1].clone());
        tokio::time::timeout(Duration::from_secs(10), async {
            while a.calls().last() != Some(&last) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("replication did not finish");

        let broker = h.cluster.broker(&node("a"));
        let missing = topics
            .iter()
            .filter(|topic| broker.publish(topic, &Bytes::from_static(b"x")) == 0)
            .count();
        assert_eq!(missing, 0);
        assert_eq!(h.bus.subscriptions().topic_count(), topics.len());
    }

    #[tokio::test]
    async fn removed_node_is_closed() {
        let h = Harness::new();
        h.bus.start().unwrap();
        h.push(&["a", "b"]);
        h.wait_live(2).await;

        h.push(&["b"]);
        h.wait_live(1).await;
        assert_eq!(h.bus.live_nodes(), vec![node("b")]);
        let a = h.bus_for(&node("a"));
        wait_until(|| a.is_closed()).await;
    }

    #[tokio::test]
    async fn moved_node_is_reconnected() {
        let h = Harness::new();
        h.bus.start().unwrap();
        h.membership.send(vec![instance("a", "10.0.0.1")]).unwrap();
        h.wait_live(1).await;
        h.membership.send(vec![instance("a", "10.0.0.2")]).unwrap();
        wait_until(|| h.bus.live_nodes() == vec![instance("a", "10.0.0.2").descriptor()]).await;

        let old = h.bus_for(&instance("a", "10.0.0.1").descriptor());
        wait_until(|| old.is_closed()).await;
        assert!(!h.bus_for(&instance("a", "10.0.0.2").descriptor()).is_closed());
    }

    #[tokio::test]
    async fn disconnected_node_evicts_itself() {
        let h = Harness::new();
        h.bus.start().unwrap();
        h.push(&["a"]);
        h.wait_live(1).await;

        h.bus_for(&node("a")).drop_connection();
        assert!(h.bus.live_nodes().is_empty());
        assert_matches!(h.bus.publish("t", Bytes::new()), Err(BusError::NoLiveNodes));

        // the later discovery removal is a no-op, a re-add builds a fresh connection
        h.push(&[]);
        h.push(&["a"]);
        h.wait_live(1).await;
        assert_eq!(h.cluster.buses_for(&node("a")).len(), 2);
    }

    #[tokio::test]
    async fn inbound_messages_reach_latest_handler() {
        let h = Harness::new();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel::<String>();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel::<(String, Bytes)>();
        h.bus.set_message_handler(Arc::new(move |topic: &str, _: Bytes| {
            let _ = first_tx.send(topic.to_string());
        }));
        h.bus.subscribe("/to/user/u1");
        h.bus.start().unwrap();
        h.push(&["a"]);
        h.wait_live(1).await;

        h.bus.set_message_handler(Arc::new(move |topic: &str, payload: Bytes| {
            let _ = second_tx.send((topic.to_string(), payload));
        }));

        let broker = h.cluster.broker(&node("a"));
        wait_until(|| broker.publish("/to/user/u1", &Bytes::from_static(b"hello")) == 1).await;

        let (topic, payload) = second_rx.recv().await.unwrap();
        assert_eq!(topic, "/to/user/u1");
        assert_eq!(payload, Bytes::from_static(b"hello"));
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_goes_to_exactly_one_node() {
        let h = Harness::new();
        h.bus.start().unwrap();
        h.push(&["a", "b", "c"]);
        h.wait_live(3).await;

        h.bus.publish("t", Bytes::from_static(b"x")).unwrap();
        let publishes = || {
            ["a", "b", "c"]
                .iter()
                .flat_map(|id| h.bus_for(&node(id)).calls())
                .filter(|c| matches!(c, NodeCall::Publish(..)))
                .count()
        };
        wait_until(|| publishes() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(publishes(), 1);
    }

    #[tokio::test]
    async fn close_tears_down_every_node() {
        let h = Harness::new();
        h.bus.start().unwrap();
        h.push(&["a", "b"]);
        h.wait_live(2).await;

        h.bus.close().await;
        h.bus.close().await;
        assert!(h.bus.live_nodes().is_empty());
        for id in ["a", "b"] {
            assert!(h.bus_for(&node(id)).is_closed());
        }
        assert_matches!(h.bus.publish("t", Bytes::new()), Err(BusError::NoLiveNodes));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let h = Harness::new();
        h.bus.start().unwrap();
        assert_matches!(h.bus.start(), Err(BusError::Discovery(DiscoveryError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn single_node_mode() {
        let cluster = MemoryCluster::new();
        let bus = ClusteredBus::new(
            DiscoveryWatcher::new(StaticMembership::single("redis", "127.0.0.1", 6379)),
            cluster.clone(),
        );
        bus.start().unwrap();
        wait_until(|| bus.live_nodes().len() == 1).await;
        assert_eq!(NotificationBus::live_nodes(&bus), 1);
        bus.close().await;
    }
}
