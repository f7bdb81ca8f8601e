//! Snapshot-to-diff tracking.

use std::collections::HashSet;

use courier_core::{ClusterDiffEvent, NodeDescriptor};

use crate::source::ServiceInstance;

/// Last-known membership; turns each new snapshot into a diff.
#[derive(Debug, Default)]
pub struct MembershipTracker {
    current: HashSet<NodeDescriptor>,
}

impl MembershipTracker {
    /// Start from an empty membership.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored membership with `instances` and return the change.
    ///
    /// A diff is returned for every snapshot, including unchanged ones.
    pub fn update(&mut self, instances: &[ServiceInstance]) -> ClusterDiffEvent {
        let next: HashSet<NodeDescriptor> = instances.iter().map(ServiceInstance::descriptor).collect();
        let diff = ClusterDiffEvent::between(&self.current, &next);
        self.current = next;
        diff
    }

    /// The stored membership.
    pub fn current(&self) -> &HashSet<NodeDescriptor> {
        &self.current
    }
}
