//! Backend cluster membership types.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One member of the backend pub/sub cluster.
///
/// Equality is by full value: a node that keeps its id but moves to a new
/// host or port is a different descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node id as reported by the membership source.
    pub id: String,
    /// Host or IP address to connect to.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl NodeDescriptor {
    /// Create a descriptor.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` socket address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Change between two successive membership snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterDiffEvent {
    /// Nodes present in the new snapshot but not the previous one.
    pub added: HashSet<NodeDescriptor>,
    /// Nodes present in the previous snapshot but not the new one.
    pub removed: HashSet<NodeDescriptor>,
}

impl ClusterDiffEvent {
    /// Compute `added = new - old` and `removed = old - new`.
    pub fn between(old: &HashSet<NodeDescriptor>, new: &HashSet<NodeDescriptor>) -> Self {
        Self {
            added: new.difference(old).cloned().collect(),
            removed: old.difference(new).cloned().collect(),
        }
    }

    /// Whether the diff carries no change.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
