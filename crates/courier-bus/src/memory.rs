//! In-process pub/sub backend.
//!
//! A [`MemoryBroker`] plays one backend node: a publish reaches every started
//! [`MemoryNodeBus`] attached to the same broker whose topics or patterns
//! match. [`MemoryCluster`] is a [`NodeBusFactory`] that keeps one broker per
//! node address, so several buses built from the same cluster see each other.
//! Every call on a [`MemoryNodeBus`] is recorded for inspection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::NodeDescriptor;
use globset::{Glob, GlobMatcher};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::errors::{BusError, Result};
use crate::node::{DisconnectHandler, MessageHandler, NodeBus, NodeBusFactory};

/// A call observed on a [`MemoryNodeBus`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeCall {
    /// `publish(topic, payload)`
    Publish(String, Bytes),
    /// `subscribe(topic)`
    Subscribe(String),
    /// `unsubscribe(topic)`
    Unsubscribe(String),
    /// `psubscribe(pattern)`
    PSubscribe(String),
    /// `punsubscribe(pattern)`
    PUnsubscribe(String),
    /// `start()`
    Start,
    /// `close()`
    Close,
}

/// One in-memory backend node.
#[derive(Default)]
pub struct MemoryBroker {
    members: RwLock<Vec<Weak<MemoryNodeBus>>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver `payload` to every matching attached bus. Returns the receiver count.
    pub fn publish(&self, topic: &str, payload: &Bytes) -> usize {
        let members: Vec<Arc<MemoryNodeBus>> = {
            let mut members = self.members.write();
            members.retain(|m| m.strong_count() > 0);
            members.iter().filter_map(Weak::upgrade).collect()
        };
        members
            .iter()
            .filter(|m| m.deliver(topic, payload))
            .count()
    }

    fn attach(&self, bus: &Arc<MemoryNodeBus>) {
        self.members.write().push(Arc::downgrade(bus));
    }
}

#[derive(Default)]
struct Subscriptions {
    topics: HashSet<String>,
    patterns: HashMap<String, GlobMatcher>,
}

impl Subscriptions {
    fn matches(&self, topic: &str) -> bool {
        self.topics.contains(topic) || self.patterns.values().any(|m| m.is_match(topic))
    }
}

/// A [`NodeBus`] attached to a [`MemoryBroker`].
pub struct MemoryNodeBus {
    node: NodeDescriptor,
    broker: Arc<MemoryBroker>,
    subscriptions: Mutex<Subscriptions>,
    handler: RwLock<Option<MessageHandler>>,
    disconnect: Mutex<Option<DisconnectHandler>>,
    started: AtomicBool,
    closed: AtomicBool,
    calls: Mutex<Vec<NodeCall>>,
}

impl MemoryNodeBus {
    /// Create a bus for `node` attached to `broker`.
    pub fn new(node: NodeDescriptor, broker: Arc<MemoryBroker>) -> Arc<Self> {
        let bus = Arc::new(Self {
            node,
            broker: Arc::clone(&broker),
            subscriptions: Mutex::new(Subscriptions::default()),
            handler: RwLock::new(None),
            disconnect: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        });
        broker.attach(&bus);
        bus
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<NodeCall> {
        self.calls.lock().clone()
    }

    /// Whether `start` has been called.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the bus is closed (locally or by a simulated drop).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Simulate a transport drop: stop delivering and fire the disconnect handler once.
    pub fn drop_connection(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self.disconnect.lock().take();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn record(&self, call: NodeCall) {
        self.calls.lock().push(call);
    }

    fn deliver(&self, topic: &str, payload: &Bytes) -> bool {
        if !self.is_started() || self.is_closed() || !self.subscriptions.lock().matches(topic) {
            return false;
        }
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(topic, payload.clone());
        }
        true
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NodeBus for MemoryNodeBus {
    fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.record(NodeCall::Publish(topic.to_string(), payload.clone()));
        self.ensure_open()?;
        let receivers = self.broker.publish(topic, &payload);
        debug!(node = %self.node, topic, receivers, "memory publish");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        let _ = self.subscriptions.lock().topics.insert(topic.to_string());
        // Recorded after the topic is live.
        self.record(NodeCall::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.record(NodeCall::Unsubscribe(topic.to_string()));
        self.ensure_open()?;
        let _ = self.subscriptions.lock().topics.remove(topic);
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        let matcher = Glob::new(pattern)
            .map_err(|e| BusError::Protocol(format!("invalid pattern {pattern:?}: {e}")))?
            .compile_matcher();
        let _ = self
            .subscriptions
            .lock()
            .patterns
            .insert(pattern.to_string(), matcher);
        self.record(NodeCall::PSubscribe(pattern.to_string()));
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.record(NodeCall::PUnsubscribe(pattern.to_string()));
        self.ensure_open()?;
        let _ = self.subscriptions.lock().patterns.remove(pattern);
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.write() = Some(handler);
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *self.disconnect.lock() = Some(handler);
    }

    fn start(&self) -> Result<()> {
        self.record(NodeCall::Start);
        self.ensure_open()?;
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.record(NodeCall::Close);
        self.closed.store(true, Ordering::Release);
        drop(self.disconnect.lock().take());
    }
}

/// Factory keeping one [`MemoryBroker`] per node address.
#[derive(Default)]
pub struct MemoryCluster {
    brokers: Mutex<HashMap<String, Arc<MemoryBroker>>>,
    created: Mutex<Vec<Arc<MemoryNodeBus>>>,
}

impl MemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The broker playing `node` (created on first use).
    pub fn broker(&self, node: &NodeDescriptor) -> Arc<MemoryBroker> {
        Arc::clone(
            self.brokers
                .lock()
                .entry(node.address())
                .or_insert_with(MemoryBroker::new),
        )
    }

    /// Every bus created for `node`, oldest first.
    pub fn buses_for(&self, node: &NodeDescriptor) -> Vec<Arc<MemoryNodeBus>> {
        self.created
            .lock()
            .iter()
            .filter(|b| b.node() == node)
            .cloned()
            .collect()
    }

    /// Number of buses created so far.
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl NodeBusFactory for MemoryCluster {
    fn create(&self, node: &NodeDescriptor) -> Arc<dyn NodeBus> {
        let bus = MemoryNodeBus::new(node.clone(), self.broker(node));
        self.created.lock().push(Arc::clone(&bus));
        bus
    }
}
