//! Membership sources.

use async_trait::async_trait;
use courier_core::NodeDescriptor;

use crate::errors::Result;

/// One live instance of the watched service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Id of the node the instance runs on.
    pub node_id: String,
    /// Address of the node itself.
    pub host: String,
    /// Address the service advertises (may be empty).
    pub address: String,
    /// Service port.
    pub port: u16,
}

impl ServiceInstance {
    /// Descriptor used to connect to this instance.
    ///
    /// The advertised service address is preferred; the node address is the
    /// fallback when the service did not register one.
    pub fn descriptor(&self) -> NodeDescriptor {
        let host = if self.address.is_empty() {
            &self.host
        } else {
            &self.address
        };
        NodeDescriptor::new(self.node_id.clone(), host.clone(), self.port)
    }
}

/// A blocking watch over the live instances of one service.
#[async_trait]
pub trait MembershipSource: Send + 'static {
    /// Wait for the next membership snapshot.
    ///
    /// The first call returns the current membership. Later calls block until
    /// the membership may have changed. An error is fatal to the caller's
    /// watch loop.
    async fn watch(&mut self) -> Result<Vec<ServiceInstance>>;
}

/// A fixed membership list, reported once.
///
/// Every call after the first never resolves, so a watcher over this source
/// stays idle until it is closed.
#[derive(Debug)]
pub struct StaticMembership {
    instances: Option<Vec<ServiceInstance>>,
}

impl StaticMembership {
    /// Report `instances` once.
    pub fn new(instances: Vec<ServiceInstance>) -> Self {
        Self {
            instances: Some(instances),
        }
    }

    /// A single node with the given id, host and port.
    pub fn single(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(vec![ServiceInstance {
            node_id: id.into(),
            host: host.into(),
            address: String::new(),
            port,
        }])
    }
}

#[async_trait]
impl MembershipSource for StaticMembership {
    async fn watch(&mut self) -> Result<Vec<ServiceInstance>> {
        match self.instances.take() {
            Some(instances) => Ok(instances),
            None => std::future::pending().await,
        }
    }
}
