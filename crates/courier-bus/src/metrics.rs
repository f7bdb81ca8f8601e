//! Metric names recorded by the bus.

/// Counter: nodes joined the live set.
pub const BUS_NODE_JOINS_TOTAL: &str = "courier_bus_node_joins_total";
/// Counter: nodes left the live set (removed or disconnected).
pub const BUS_NODE_LEAVES_TOTAL: &str = "courier_bus_node_leaves_total";
/// Gauge: currently live nodes.
pub const BUS_LIVE_NODES: &str = "courier_bus_live_nodes";
/// Counter: publishes forwarded to a node.
pub const BUS_PUBLISHES_TOTAL: &str = "courier_bus_publishes_total";
/// Counter: publishes that failed (no live node, or node error).
pub const BUS_PUBLISH_FAILURES_TOTAL: &str = "courier_bus_publish_failures_total";
/// Counter: subscription replication calls that failed on a node.
pub const BUS_REPLICATION_FAILURES_TOTAL: &str = "courier_bus_replication_failures_total";
