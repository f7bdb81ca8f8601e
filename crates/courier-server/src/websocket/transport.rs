//! Transports a [`Connection`](super::Connection) can run its pumps over.
//!
//! A transport is any `Stream` of inbound frames that is also a `Sink` for
//! outbound ones. Production sockets come from axum's upgrade; tests use the
//! in-process [`loopback`] pair.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::ws::{Message, WebSocket};
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt, future};

use super::frame::{Frame, FrameKind, TransportError, WsMessage};

/// A bidirectional frame channel to one peer.
pub trait Transport:
    Stream<Item = Result<Frame, TransportError>>
    + Sink<Frame, Error = TransportError>
    + Send
    + Unpin
    + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Frame, TransportError>>
        + Sink<Frame, Error = TransportError>
        + Send
        + Unpin
        + 'static
{
}

/// Adapt an upgraded axum socket.
pub fn axum_transport(socket: WebSocket) -> impl Transport {
    socket
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(into_axum(frame))))
        .map(from_axum)
}

fn into_axum(frame: Frame) -> Message {
    match frame {
        Frame::Message(msg) => match msg.kind {
            FrameKind::Text => {
                Message::Text(String::from_utf8_lossy(&msg.data).into_owned().into())
            }
            FrameKind::Binary => Message::Binary(msg.data),
        },
        Frame::Ping(payload) => Message::Ping(payload),
        Frame::Pong(payload) => Message::Pong(payload),
        Frame::Close => Message::Close(None),
    }
}

fn from_axum(result: Result<Message, axum::Error>) -> Result<Frame, TransportError> {
    Ok(match result? {
        Message::Text(text) => Frame::Message(WsMessage::text(text.as_str())),
        Message::Binary(data) => Frame::Message(WsMessage::binary(data)),
        Message::Ping(payload) => Frame::Ping(payload),
        Message::Pong(payload) => Frame::Pong(payload),
        Message::Close(_) => Frame::Close,
    })
}

/// Create an in-process transport and the peer end driving it.
pub fn loopback(capacity: usize) -> (LoopbackTransport, LoopbackPeer) {
    let (to_conn, incoming) = mpsc::channel(capacity);
    let (outgoing, from_conn) = mpsc::channel(capacity);
    (
        LoopbackTransport { incoming, outgoing },
        LoopbackPeer { to_conn, from_conn },
    )
}

/// Connection side of a [`loopback`] pair.
pub struct LoopbackTransport {
    incoming: mpsc::Receiver<Frame>,
    outgoing: mpsc::Sender<Frame>,
}

impl Stream for LoopbackTransport {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.incoming.poll_next_unpin(cx).map(|frame| frame.map(Ok))
    }
}

impl Sink<Frame> for LoopbackTransport {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.outgoing.poll_ready_unpin(cx).map_err(Into::into)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.outgoing.start_send_unpin(item).map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.outgoing.poll_flush_unpin(cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.outgoing.poll_close_unpin(cx).map_err(Into::into)
    }
}

/// Peer side of a [`loopback`] pair, standing in for a remote client.
pub struct LoopbackPeer {
    to_conn: mpsc::Sender<Frame>,
    from_conn: mpsc::Receiver<Frame>,
}

impl LoopbackPeer {
    /// Send a frame to the connection. Returns `false` once it is gone.
    pub async fn send(&mut self, frame: Frame) -> bool {
        self.to_conn.send(frame).await.is_ok()
    }

    /// Next frame written by the connection, `None` once it closed its sink.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_conn.next().await
    }

    /// Next application message, answering pings along the way.
    pub async fn recv_message(&mut self) -> Option<WsMessage> {
        loop {
            match self.recv().await? {
                Frame::Message(msg) => return Some(msg),
                Frame::Ping(payload) => {
                    let _ = self.send(Frame::Pong(payload)).await;
                }
                Frame::Pong(_) => {}
                Frame::Close => return None,
            }
        }
    }

    /// Hang up: the connection's inbound stream ends.
    pub fn disconnect(&mut self) {
        self.to_conn.close_channel();
    }
}
