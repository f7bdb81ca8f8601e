//! Self-registration of this process in Consul.
//!
//! The service is registered with a TTL check. A heartbeat task marks the
//! check as passing every `ttl / 2`; if the process dies the check goes
//! critical and Consul stops reporting the instance.

use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::errors::{Result, ensure_success};

/// What to register.
#[derive(Clone, Debug)]
pub struct ServiceRegistration {
    /// Unique service id on the agent.
    pub id: String,
    /// Service name.
    pub name: String,
    /// Service tags.
    pub tags: Vec<String>,
    /// Advertised address (the agent's address when `None`).
    pub address: Option<String>,
    /// Advertised port.
    pub port: u16,
    /// TTL of the health check.
    pub ttl: Duration,
    /// Id of the TTL check.
    pub check_id: String,
}

/// Registers, heartbeats and deregisters one service on a Consul agent.
#[derive(Clone)]
pub struct ConsulRegistration {
    client: reqwest::Client,
    base_url: String,
    service: ServiceRegistration,
}

impl ConsulRegistration {
    /// Create a registration against the agent at `base_url`.
    pub fn new(base_url: impl Into<String>, service: ServiceRegistration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service,
        }
    }

    /// The registered service.
    pub fn service(&self) -> &ServiceRegistration {
        &self.service
    }

    /// `PUT /v1/agent/service/register`.
    #[instrument(skip(self), fields(service_id = %self.service.id))]
    pub async fn register(&self) -> Result<()> {
        let s = &self.service;
        let mut body = json!({
            "ID": s.id,
            "Name": s.name,
            "Tags": s.tags,
            "Port": s.port,
            "Check": {
                "CheckID": s.check_id,
                "Name": format!("{} alive", s.name),
                "TTL": format!("{}s", s.ttl.as_secs()),
            },
        });
        if let Some(address) = &s.address {
            body["Address"] = json!(address);
        }

        let resp = self
            .client
            .put(format!("{}/v1/agent/service/register", self.base_url))
            .json(&body)
            .send()
            .await?;
        let _ = ensure_success(resp).await?;
        info!(name = %s.name, port = s.port, "registered in consul");
        Ok(())
    }

    /// `PUT /v1/agent/check/update/<check_id>` with status `passing`.
    pub async fn pass_check(&self) -> Result<()> {
        let resp = self
            .client
            .put(format!(
                "{}/v1/agent/check/update/{}",
                self.base_url, self.service.check_id
            ))
            .json(&json!({"Status": "passing", "Output": "online"}))
            .send()
            .await?;
        let _ = ensure_success(resp).await?;
        Ok(())
    }

    /// `PUT /v1/agent/service/deregister/<id>`.
    #[instrument(skip(self), fields(service_id = %self.service.id))]
    pub async fn deregister(&self) -> Result<()> {
        let resp = self
            .client
            .put(format!(
                "{}/v1/agent/service/deregister/{}",
                self.base_url, self.service.id
            ))
            .send()
            .await?;
        let _ = ensure_success(resp).await?;
        info!("deregistered from consul");
        Ok(())
    }

    /// Spawn the TTL heartbeat; it runs until `cancel` fires.
    ///
    /// Failed heartbeats are logged and retried on the next tick.
    pub fn spawn_heartbeat(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        let period = (self.service.ttl / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match this.pass_check().await {
                            Ok(()) => debug!(check_id = %this.service.check_id, "ttl check passed"),
                            Err(e) => error!(check_id = %this.service.check_id, error = %e, "ttl heartbeat failed"),
                        }
                    }
                }
            }
        })
    }
}
