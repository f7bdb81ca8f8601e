//! Settings types.
//!
//! JSON keys are kebab-case (`ping-interval-ms`, `read-limit`, ...). Every
//! struct carries `#[serde(default)]` so a config file only needs the keys
//! it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CourierSettings {
    /// HTTP listener.
    pub app: AppSettings,
    /// WebSocket connection tuning.
    pub ws: WsSettings,
    /// Notification bus topology and topic naming.
    pub bus: BusSettings,
    /// Optional self-registration in Consul.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<RegistrationSettings>,
    /// Log output.
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.ws.validate()?;
        let _ = self.bus.topology()?;
        if let Some(reg) = &self.registration {
            reg.validate()?;
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` for auto-assign).
    pub port: u16,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Per-connection WebSocket settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WsSettings {
    /// Read/write deadline in milliseconds.
    pub timeout_ms: u64,
    /// Keepalive ping period in milliseconds.
    pub ping_interval_ms: u64,
    /// Maximum inbound frame size in bytes.
    pub read_limit: usize,
    /// Capacity of the inbound and outbound queues.
    pub buffer_size: usize,
}

impl WsSettings {
    /// Read/write deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Keepalive ping period.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 || self.ping_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "ws timeout and ping interval must be positive".into(),
            ));
        }
        // a pong can only extend the read deadline if pings go out before it expires
        if self.ping_interval_ms >= self.timeout_ms {
            return Err(SettingsError::InvalidValue(format!(
                "ws ping interval ({}ms) must be shorter than the timeout ({}ms)",
                self.ping_interval_ms, self.timeout_ms
            )));
        }
        if self.read_limit == 0 {
            return Err(SettingsError::InvalidValue(
                "ws read limit must be positive".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(SettingsError::InvalidValue(
                "ws buffer size must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            ping_interval_ms: 1_000,
            read_limit: 64 * 1024,
            buffer_size: 256,
        }
    }
}

/// How user delivery topics are subscribed on the bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionMode {
    /// Subscribe `<prefix><id>` on a user's first connection, unsubscribe on the last.
    #[default]
    PerUser,
    /// One pattern subscription `<prefix>*` covering every user.
    Pattern,
}

/// Notification bus settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BusSettings {
    /// Prefix of per-user delivery topics.
    pub user_topic: String,
    /// Subscription strategy.
    pub subscription_mode: SubscriptionMode,
    /// A single fixed backend node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single: Option<NodeSettings>,
    /// A discovered backend cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterSettings>,
}

impl BusSettings {
    /// Resolve which backend topology to build.
    ///
    /// A cluster definition wins over a single node when both are present.
    pub fn topology(&self) -> Result<BusTopology> {
        match (&self.cluster, &self.single) {
            (Some(cluster), _) => Ok(BusTopology::Cluster(cluster.consul.clone())),
            (None, Some(node)) => Ok(BusTopology::Single(node.clone())),
            (None, None) => Err(SettingsError::InvalidValue(
                "no notification bus defined, expected either bus.single or bus.cluster".into(),
            )),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            user_topic: "/to/user/".to_string(),
            subscription_mode: SubscriptionMode::PerUser,
            single: None,
            cluster: None,
        }
    }
}

/// The resolved bus topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusTopology {
    /// One fixed node.
    Single(NodeSettings),
    /// Nodes discovered through Consul.
    Cluster(ConsulSettings),
}

/// One fixed backend node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NodeSettings {
    /// Node id.
    pub id: String,
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: "redis".to_string(),
            host: "127.0.0.1".to_string(),
            port: 6379,
        }
    }
}

/// Discovered cluster settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterSettings {
    /// Consul agent used for discovery.
    pub consul: ConsulSettings,
}

/// Consul discovery settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConsulSettings {
    /// Consul agent host.
    pub host: String,
    /// Consul agent HTTP port.
    pub port: u16,
    /// Name of the backend service to watch.
    pub service_name: String,
    /// Maximum blocking-query wait in seconds.
    pub wait_secs: u64,
}

impl ConsulSettings {
    /// Base URL of the Consul HTTP API.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8500,
            service_name: "redis-notification-bus".to_string(),
            wait_secs: 300,
        }
    }
}

/// Self-registration of this process in Consul.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RegistrationSettings {
    /// Consul agent host.
    pub consul_host: String,
    /// Consul agent HTTP port.
    pub consul_port: u16,
    /// Service name to register under.
    pub service_name: String,
    /// Explicit service id (a random one is generated when absent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    /// Service tags.
    pub tags: Vec<String>,
    /// TTL of the health check in seconds; the heartbeat runs at half of it.
    pub ttl_secs: u64,
    /// Check id of the TTL check.
    pub check_id: String,
}

impl RegistrationSettings {
    /// Base URL of the Consul HTTP API.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.consul_host, self.consul_port)
    }

    /// TTL of the health check.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.ttl_secs < 2 {
            return Err(SettingsError::InvalidValue(format!(
                "registration ttl must be at least 2s, got {}s",
                self.ttl_secs
            )));
        }
        Ok(())
    }
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            consul_host: "127.0.0.1".to_string(),
            consul_port: 8500,
            service_name: "connection-service".to_string(),
            service_id: None,
            tags: vec!["connection".to_string()],
            ttl_secs: 30,
            check_id: "alive-check".to_string(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoggingSettings {
    /// Default level filter (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
