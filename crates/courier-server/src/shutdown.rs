//! Ordered teardown of a running courier server.
//!
//! 1. Cancel the shared token. The HTTP listener stops accepting and every
//!    socket session leaves its loop.
//! 2. Close every registered connection, then wait for the serve task to
//!    finish and for the registry to empty.
//! 3. Close the notification bus.
//!
//! Step 2 is bounded by the shutdown timeout. The bus is closed even when the
//! drain times out.

use std::time::Duration;

use courier_bus::NotificationBus;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::websocket::ConnectionRegistry;

/// Default time to wait for sockets to drain.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// What a shutdown found and how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections registered when shutdown began.
    pub connections: usize,
    /// Whether the serve task and every connection finished in time.
    pub drained: bool,
}

/// Owns the shutdown token and the serve task of a [`CourierServer`](crate::CourierServer).
pub struct ShutdownCoordinator {
    token: CancellationToken,
    serve: Mutex<Option<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no serve task attached.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            serve: Mutex::new(None),
        }
    }

    /// A clone of the shutdown token. Sessions and the HTTP listener stop on it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Track the HTTP serve task so shutdown can wait for it.
    pub fn attach_serve(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.serve.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Run the teardown. A second call finds nothing left to drain and only
    /// closes the bus again.
    pub async fn run(
        &self,
        registry: &ConnectionRegistry,
        bus: &dyn NotificationBus,
        timeout: Option<Duration>,
    ) -> ShutdownReport {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let connections = registry.connection_count();
        info!(
            users = registry.user_count(),
            connections,
            timeout_secs = timeout.as_secs(),
            "shutting down"
        );

        self.token.cancel();
        registry.close_all();

        let serve = self.serve.lock().take();
        let drain = async {
            if let Some(serve) = serve {
                let _ = serve.await;
            }
            while registry.connection_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        let drained = tokio::time::timeout(timeout, drain).await.is_ok();
        if !drained {
            warn!(
                remaining = registry.connection_count(),
                "shutdown timed out after {timeout:?}, closing the bus anyway"
            );
        }

        bus.close().await;
        info!(drained, "shutdown complete");
        ShutdownReport {
            connections,
            drained,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
