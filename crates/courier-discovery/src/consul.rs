//! Consul health-API membership source.
//!
//! Uses blocking queries against `/v1/health/service/<name>?passing=true`.
//! The `X-Consul-Index` of each response is sent back as `index` on the next
//! request, so the agent holds the request open until the result changes or
//! `wait` elapses.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::errors::{DiscoveryError, Result, ensure_success};
use crate::source::{MembershipSource, ServiceInstance};

/// Default blocking-query wait.
const DEFAULT_WAIT: Duration = Duration::from_secs(300);

/// Extra client-side slack on top of `wait` (Consul adds up to `wait / 16` jitter).
const REQUEST_SLACK: Duration = Duration::from_secs(5);

/// Watches the passing instances of one service through a Consul agent.
pub struct ConsulCatalog {
    client: reqwest::Client,
    base_url: String,
    service_name: String,
    wait: Duration,
    index: u64,
}

impl ConsulCatalog {
    /// Watch `service_name` through the agent at `base_url` (`http://host:port`).
    pub fn new(base_url: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_name: service_name.into(),
            wait: DEFAULT_WAIT,
            index: 0,
        }
    }

    /// Override the blocking-query wait.
    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Index of the last response (0 before the first query or after a reset).
    pub fn last_index(&self) -> u64 {
        self.index
    }

    #[instrument(skip(self), fields(service = %self.service_name, index = self.index))]
    async fn query(&self) -> Result<(u64, Vec<ServiceInstance>)> {
        let url = format!("{}/v1/health/service/{}", self.base_url, self.service_name);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("passing", "true".to_string()),
                ("index", self.index.to_string()),
                ("wait", format!("{}s", self.wait.as_secs())),
            ])
            .timeout(self.wait + self.wait / 16 + REQUEST_SLACK)
            .send()
            .await?;
        let resp = ensure_success(resp).await?;

        let index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(DiscoveryError::MissingIndex)?;

        let body = resp.text().await?;
        let entries: Vec<HealthEntry> = serde_json::from_str(&body)?;
        let instances = entries.into_iter().map(HealthEntry::into_instance).collect();
        Ok((index, instances))
    }
}

#[async_trait]
impl MembershipSource for ConsulCatalog {
    async fn watch(&mut self) -> Result<Vec<ServiceInstance>> {
        loop {
            let (index, instances) = self.query().await?;
            // index 0 never blocks
            let index = index.max(1);
            let changed = index != self.index;
            // an index that goes backwards means the agent's state was reset
            self.index = if index < self.index { 0 } else { index };
            if changed {
                return Ok(instances);
            }
            debug!(index, "blocking query timed out without changes");
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeEntry,
    service: ServiceEntry,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    node: String,
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(default)]
    address: String,
    port: u16,
}

impl HealthEntry {
    fn into_instance(self) -> ServiceInstance {
        ServiceInstance {
            node_id: self.node.node,
            host: self.node.address,
            address: self.service.address,
            port: self.service.port,
        }
    }
}
