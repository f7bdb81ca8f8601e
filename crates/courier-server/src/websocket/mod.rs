//! WebSocket connections, the per-user registry and socket sessions.

pub mod connection;
pub mod frame;
pub mod registry;
pub mod session;
pub mod transport;

pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use frame::{Frame, FrameKind, TransportError, WsMessage};
pub use registry::{ConnectionRegistry, Outbound, UserCallback};
pub use session::{SessionContext, run_session};
pub use transport::{LoopbackPeer, LoopbackTransport, Transport, axum_transport, loopback};
