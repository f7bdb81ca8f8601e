//! Server configuration.

use courier_core::UserTopic;
use courier_settings::{CourierSettings, SubscriptionMode};

use crate::websocket::ConnectionConfig;

/// Everything the HTTP/WebSocket server needs at startup.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port. `0` picks a free port.
    pub port: u16,
    /// Per-connection timing and buffering.
    pub connection: ConnectionConfig,
    /// Delivery topic naming.
    pub user_topic: UserTopic,
    /// How user topics are subscribed on the bus.
    pub subscription_mode: SubscriptionMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            connection: ConnectionConfig::default(),
            user_topic: UserTopic::default(),
            subscription_mode: SubscriptionMode::PerUser,
        }
    }
}

impl From<&CourierSettings> for ServerConfig {
    fn from(settings: &CourierSettings) -> Self {
        Self {
            host: settings.app.host.clone(),
            port: settings.app.port,
            connection: ConnectionConfig::from(&settings.ws),
            user_topic: UserTopic::new(settings.bus.user_topic.clone()),
            subscription_mode: settings.bus.subscription_mode,
        }
    }
}
