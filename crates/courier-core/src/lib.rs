//! # courier-core
//!
//! Shared vocabulary for the courier crates:
//!
//! - **Branded IDs**: [`UserId`] and [`ConnectionId`] newtypes
//! - **Cluster membership**: [`NodeDescriptor`] and [`ClusterDiffEvent`]
//! - **Topic naming**: [`UserTopic`] maps user ids to delivery topics and back
//! - **Logging**: [`logging::init_subscriber`] for the global `tracing` subscriber

#![deny(unsafe_code)]

pub mod cluster;
pub mod ids;
pub mod logging;
pub mod topic;

pub use cluster::{ClusterDiffEvent, NodeDescriptor};
pub use ids::{ConnectionId, UserId};
pub use topic::UserTopic;
