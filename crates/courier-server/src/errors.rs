//! Server error types.

use courier_core::UserId;

/// Errors from the connection registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The user has no tracked connections (or not the given one).
    #[error("no connections tracked for user {0}")]
    NotFound(UserId),
}

/// Errors starting or running the HTTP server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding the listen address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
