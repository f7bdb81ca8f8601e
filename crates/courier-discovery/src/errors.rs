//! Discovery error types.

/// Errors raised while watching membership or talking to the Consul agent.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The agent answered with a non-success status.
    #[error("consul error ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// A blocking query response carried no usable `X-Consul-Index`.
    #[error("missing or invalid X-Consul-Index header")]
    MissingIndex,

    /// [`DiscoveryWatcher::start`](crate::DiscoveryWatcher::start) was called twice.
    #[error("discovery watcher already started")]
    AlreadyStarted,
}

/// Convenience result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Turn a non-success response into [`DiscoveryError::Status`].
pub(crate) async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(DiscoveryError::Status {
        status: status.as_u16(),
        message,
    })
}
