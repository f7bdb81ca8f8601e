//! Bus error types.

use courier_discovery::DiscoveryError;

/// Errors raised by node connections and the clustered bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No backend node is currently live; the message was dropped.
    #[error("no live backend node")]
    NoLiveNodes,

    /// The connection or bus has been closed.
    #[error("bus closed")]
    Closed,

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed wire data or an invalid argument.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backend answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// Membership discovery could not be started.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// Convenience result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(BusError::NoLiveNodes.to_string(), "no live backend node");
        assert_eq!(
            BusError::Server("ERR unknown command".into()).to_string(),
            "server error: ERR unknown command"
        );
    }

    #[test]
    fn from_io() {
        let err: BusError = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, BusError::Io(_)));
    }

    #[test]
    fn from_discovery() {
        let err: BusError = DiscoveryError::AlreadyStarted.into();
        assert_eq!(err.to_string(), "discovery error: discovery watcher already started");
    }
}
