//! # courier
//!
//! Connection service binary: loads settings, joins the notification bus,
//! optionally registers with Consul, and serves WebSocket clients.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use courier_bus::{ClusteredBus, RedisNodeBusFactory};
use courier_discovery::{
    ConsulCatalog, ConsulRegistration, DiscoveryWatcher, ServiceRegistration, StaticMembership,
};
use courier_server::{Authorizer, CourierServer, HeaderAuthorizer, ServerConfig, StaticAuthorizer};
use courier_settings::{BusTopology, CourierSettings, RegistrationSettings};
use tokio_util::sync::CancellationToken;

/// Courier connection service.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Real-time WebSocket delivery service")]
struct Cli {
    /// Path to the JSON settings file (default: `$COURIER_CONFIG` or `config.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Treat every client as this user instead of reading `x-user-id`.
    #[arg(long)]
    static_user: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut CourierSettings) {
        if let Some(host) = &self.host {
            settings.app.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.app.port = port;
        }
    }

    fn authorizer(&self) -> Arc<dyn Authorizer> {
        match &self.static_user {
            Some(user) => Arc::new(StaticAuthorizer::new(user.as_str())),
            None => Arc::new(HeaderAuthorizer::default()),
        }
    }
}

/// Membership source for the configured bus topology.
fn discovery_watcher(settings: &CourierSettings) -> Result<DiscoveryWatcher> {
    let topology = settings
        .bus
        .topology()
        .context("invalid bus configuration")?;
    Ok(match topology {
        BusTopology::Single(node) => {
            tracing::info!(node = %node.id, host = %node.host, port = node.port, "using single bus node");
            DiscoveryWatcher::new(StaticMembership::single(node.id, node.host, node.port))
        }
        BusTopology::Cluster(consul) => {
            tracing::info!(consul = %consul.base_url(), service = %consul.service_name, "discovering bus nodes");
            DiscoveryWatcher::new(
                ConsulCatalog::new(consul.base_url(), consul.service_name.clone())
                    .with_wait(Duration::from_secs(consul.wait_secs)),
            )
        }
    })
}

/// Consul registration for this instance, listening on `addr`.
fn consul_registration(
    reg: &RegistrationSettings,
    bind_host: &str,
    addr: SocketAddr,
) -> ConsulRegistration {
    let id = reg
        .service_id
        .clone()
        .unwrap_or_else(|| format!("{}-{}", reg.service_name, addr.port()));
    // Unspecified bind address: let the agent advertise its own.
    let address = match bind_host {
        "0.0.0.0" | "::" | "" => None,
        host => Some(host.to_string()),
    };
    ConsulRegistration::new(
        reg.base_url(),
        ServiceRegistration {
            id,
            name: reg.service_name.clone(),
            tags: reg.tags.clone(),
            address,
            port: addr.port(),
            ttl: reg.ttl(),
            check_id: reg.check_id.clone(),
        },
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args
        .config
        .clone()
        .unwrap_or_else(courier_settings::default_config_path);
    let mut settings = courier_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);

    courier_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics_handle = courier_server::metrics::install_recorder();

    let bus = Arc::new(ClusteredBus::new(
        discovery_watcher(&settings)?,
        Arc::new(RedisNodeBusFactory),
    ));
    bus.start().context("Failed to start notification bus")?;

    let server = CourierServer::new(
        ServerConfig::from(&settings),
        bus,
        args.authorizer(),
        metrics_handle,
    );
    let addr = server.listen().await.context("Failed to bind server")?;
    tracing::info!("courier listening on ws://{addr}");

    let heartbeat_cancel = CancellationToken::new();
    let registration = match &settings.registration {
        Some(reg) => {
            let registration = consul_registration(reg, &settings.app.host, addr);
            registration
                .register()
                .await
                .context("Failed to register with Consul")?;
            let heartbeat = registration.spawn_heartbeat(heartbeat_cancel.clone());
            Some((registration, heartbeat))
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down...");

    if let Some((registration, heartbeat)) = registration {
        heartbeat_cancel.cancel();
        let _ = heartbeat.await;
        if let Err(e) = registration.deregister().await {
            tracing::warn!(error = %e, "failed to deregister from Consul");
        }
    }
    let report = server.graceful_shutdown(None).await;
    tracing::info!(
        connections = report.connections,
        drained = report.drained,
        "Shutdown complete"
    );
    Ok(())
}
