//! Frame types exchanged with a WebSocket peer.

use bytes::Bytes;

/// Error surfaced by a transport's stream or sink.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// Kind of an application data frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
}

/// One application message with its frame kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsMessage {
    /// Frame kind the message travels as.
    pub kind: FrameKind,
    /// Payload bytes.
    pub data: Bytes,
}

impl WsMessage {
    /// A text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            data: Bytes::from(text.into()),
        }
    }

    /// A binary message.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Binary,
            data: data.into(),
        }
    }

    /// Text frame for UTF-8 payloads, binary otherwise.
    pub fn from_payload(data: Bytes) -> Self {
        let kind = if std::str::from_utf8(&data).is_ok() {
            FrameKind::Text
        } else {
            FrameKind::Binary
        };
        Self { kind, data }
    }

    /// Payload as text, if this is a text frame holding valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            FrameKind::Text => std::str::from_utf8(&self.data).ok(),
            FrameKind::Binary => None,
        }
    }
}

/// Anything a transport can carry, control frames included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Application data.
    Message(WsMessage),
    /// Ping with optional payload.
    Ping(Bytes),
    /// Pong with optional payload.
    Pong(Bytes),
    /// Close handshake.
    Close,
}
