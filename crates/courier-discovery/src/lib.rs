//! # courier-discovery
//!
//! Backend cluster membership.
//!
//! - [`MembershipSource`]: a blocking watch over the live instances of a service
//! - [`ConsulCatalog`]: Consul health-API blocking queries
//! - [`StaticMembership`]: a fixed node list, reported once
//! - [`DiscoveryWatcher`]: turns successive snapshots into [`ClusterDiffEvent`]s
//! - [`ConsulRegistration`]: registers this process in Consul with a TTL heartbeat
//!
//! [`ClusterDiffEvent`]: courier_core::ClusterDiffEvent

#![deny(unsafe_code)]

pub mod consul;
pub mod errors;
pub mod registration;
pub mod source;
pub mod tracker;
pub mod watcher;

pub use consul::ConsulCatalog;
pub use errors::{DiscoveryError, Result};
pub use registration::{ConsulRegistration, ServiceRegistration};
pub use source::{MembershipSource, ServiceInstance, StaticMembership};
pub use tracker::MembershipTracker;
pub use watcher::{DiffEvents, DiscoveryWatcher};
