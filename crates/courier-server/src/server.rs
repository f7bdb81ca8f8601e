//! `CourierServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use courier_bus::NotificationBus;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::Authorizer;
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::{self as server_metrics, WS_UNAUTHORIZED_TOTAL};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::websocket::session::{SessionContext, run_session};
use crate::websocket::{ConnectionRegistry, axum_transport};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Everything a socket session needs.
    pub session: SessionContext,
    /// Decides who an upgrade request belongs to.
    pub authorizer: Arc<dyn Authorizer>,
    /// Bus, for health reporting.
    pub bus: Arc<dyn NotificationBus>,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
}

/// The courier connection server.
pub struct CourierServer {
    config: ServerConfig,
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
}

impl CourierServer {
    /// Create a server delivering messages from `bus`.
    ///
    /// Wires the registry to the bus according to the configured
    /// subscription mode.
    pub fn new(
        config: ServerConfig,
        bus: Arc<dyn NotificationBus>,
        authorizer: Arc<dyn Authorizer>,
        metrics: PrometheusHandle,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            config.user_topic.clone(),
            config.subscription_mode,
        );
        dispatcher.wire();

        let shutdown = Arc::new(ShutdownCoordinator::new());
        let state = AppState {
            session: SessionContext {
                registry,
                dispatcher,
                connection: config.connection.clone(),
                shutdown: shutdown.token(),
            },
            authorizer,
            bus,
            metrics,
            start_time: Instant::now(),
        };

        Self {
            config,
            state,
            shutdown,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve in the background until shutdown.
    ///
    /// Returns the bound address.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
        });

        self.shutdown.attach_serve(handle);

        info!(addr = %local_addr, "courier server listening");
        Ok(local_addr)
    }

    /// Stop accepting, close every socket, wait for them to drain, then
    /// close the bus.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> ShutdownReport {
        self.shutdown
            .run(&self.state.session.registry, self.state.bus.as_ref(), timeout)
            .await
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.session.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// GET / and GET /ws: authorize, then upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let principal = match state.authorizer.authorize(&headers, &uri).await {
        Ok(principal) => principal,
        Err(e) => {
            counter!(WS_UNAUTHORIZED_TOTAL).increment(1);
            warn!(error = %e, "upgrade rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let limit = state.session.connection.read_limit;
    let ctx = state.session.clone();
    upgrade
        .max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| run_session(axum_transport(socket), principal.id, ctx))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = &state.session.registry;
    Json(health::health_check(
        state.start_time,
        registry.user_count(),
        registry.connection_count(),
        state.bus.live_nodes(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    server_metrics::render(&state.metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use bytes::Bytes;
    use courier_bus::MessageHandler;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    use crate::auth::{DenyAllAuthorizer, StaticAuthorizer};

    struct IdleBus;

    impl NotificationBus for IdleBus {
        fn publish(&self, _topic: &str, _payload: Bytes) -> courier_bus::Result<()> {
            Err(courier_bus::BusError::NoLiveNodes)
        }
        fn subscribe(&self, _topic: &str) {}
        fn unsubscribe(&self, _topic: &str) {}
        fn psubscribe(&self, _pattern: &str) {}
        fn punsubscribe(&self, _pattern: &str) {}
        fn set_message_handler(&self, _handler: MessageHandler) {}
        fn live_nodes(&self) -> usize {
            0
        }
        fn close(&self) -> futures::future::BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn make_server(authorizer: Arc<dyn Authorizer>) -> CourierServer {
        CourierServer::new(
            ServerConfig::default(),
            Arc::new(IdleBus),
            authorizer,
            PrometheusBuilder::new().build_recorder().handle(),
        )
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Bytes) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn health_endpoint_reports_counters() {
        let server = make_server(Arc::new(StaticAuthorizer::new("1")));
        let (status, body) = get(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["users"], 0);
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["live_nodes"], 0);
    }

    #[tokio::test]
    async fn unauthorized_upgrade_is_401_with_reason() {
        let server = make_server(Arc::new(DenyAllAuthorizer));
        for path in ["/", "/ws"] {
            let (status, body) = get(server.router(), path).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(&body[..], b"unimplemented yet");
        }
    }

    #[tokio::test]
    async fn authorized_plain_get_is_rejected_as_not_upgrade() {
        let server = make_server(Arc::new(StaticAuthorizer::new("1")));
        let (status, _) = get(server.router(), "/ws").await;
        assert!(status.is_client_error());
        assert_ne!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        let server = make_server(Arc::new(StaticAuthorizer::new("1")));
        let (status, _) = get(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server(Arc::new(StaticAuthorizer::new("1")));
        let (status, _) = get(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_free_port_and_stops_on_shutdown() {
        let server = make_server(Arc::new(StaticAuthorizer::new("1")));
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        let report = server.graceful_shutdown(Some(Duration::from_secs(5))).await;
        assert!(report.drained);
        assert!(server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn bind_failure_names_address() {
        let server = make_server(Arc::new(StaticAuthorizer::new("1")));
        let addr = server.listen().await.unwrap();

        let config = ServerConfig {
            port: addr.port(),
            ..ServerConfig::default()
        };
        let clash = CourierServer::new(
            config,
            Arc::new(IdleBus),
            Arc::new(StaticAuthorizer::new("1")),
            PrometheusBuilder::new().build_recorder().handle(),
        );
        let err = clash.listen().await.unwrap_err();
        assert!(err.to_string().contains(&addr.port().to_string()));
    }
}
