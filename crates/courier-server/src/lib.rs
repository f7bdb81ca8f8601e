//! # courier-server
//!
//! Axum HTTP + `WebSocket` gateway for the courier connection service.
//!
//! - `WebSocket` connections with read/write pumps, ping/pong liveness and
//!   bounded queues ([`websocket::connection`])
//! - Per-user connection registry with connect/disconnect callbacks
//!   ([`websocket::registry`])
//! - Wiring between the registry and the notification bus ([`dispatch`])
//! - HTTP endpoints: upgrade (`/`, `/ws`), `/health`, `/metrics`
//! - Ordered graceful shutdown: sockets, serve task, then the bus

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{AuthError, Authorizer, DenyAllAuthorizer, HeaderAuthorizer, Principal, StaticAuthorizer};
pub use config::ServerConfig;
pub use errors::{RegistryError, ServerError};
pub use server::CourierServer;
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
