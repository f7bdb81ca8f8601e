//! # courier-bus
//!
//! Notification bus over a dynamic set of pub/sub backend nodes.
//!
//! - [`NodeBus`]: one connection to one backend node (Redis or in-memory)
//! - [`ClusteredBus`]: keeps one [`NodeBus`] per discovered node, replays the
//!   desired subscriptions onto every node and fans publishes out to a random one
//! - [`NotificationBus`]: the surface the connection service talks to

#![deny(unsafe_code)]

pub mod clustered;
pub mod errors;
pub mod memory;
pub mod metrics;
pub mod node;
pub mod redis;
pub mod subscriptions;

pub use clustered::ClusteredBus;
pub use errors::{BusError, Result};
pub use memory::{MemoryBroker, MemoryCluster, MemoryNodeBus, NodeCall};
pub use node::{DisconnectHandler, MessageHandler, NodeBus, NodeBusFactory, NotificationBus};
pub use redis::{RedisNodeBus, RedisNodeBusFactory};
pub use subscriptions::{SubscriptionOp, SubscriptionState};
