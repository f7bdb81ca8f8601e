//! One WebSocket connection and its read/write pumps.
//!
//! Each [`Connection`] owns two background tasks:
//!
//! - the **write pump** drains the bounded outbound queue and sends a ping
//!   every `ping_interval`; every write must finish within `timeout`.
//! - the **read pump** forwards application messages to the inbound queue.
//!   Only pongs push the read deadline forward, so a peer that stops
//!   answering pings is dropped after `timeout`.
//!
//! Either pump failing closes the connection. The state moves
//! `Open -> Closing -> Closed`; `Closed` is reached once both pumps exited.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use courier_core::ConnectionId;
use courier_settings::WsSettings;
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::frame::{Frame, TransportError, WsMessage};
use super::transport::Transport;
use crate::metrics::WS_FRAMES_DROPPED_TOTAL;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Per-connection timing and buffering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Read deadline (refreshed by pongs) and per-write timeout.
    pub timeout: Duration,
    /// Interval between pings. Must be shorter than `timeout`.
    pub ping_interval: Duration,
    /// Largest inbound message accepted, in bytes.
    pub read_limit: usize,
    /// Capacity of the inbound and outbound queues.
    pub buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&WsSettings::default())
    }
}

impl From<&WsSettings> for ConnectionConfig {
    fn from(ws: &WsSettings) -> Self {
        Self {
            timeout: ws.timeout(),
            ping_interval: ws.ping_interval(),
            read_limit: ws.read_limit,
            buffer_size: ws.buffer_size.max(1),
        }
    }
}

/// Lifecycle of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Pumps running, sends accepted.
    Open,
    /// Close requested, pumps winding down.
    Closing,
    /// Both pumps exited.
    Closed,
}

/// A live WebSocket peer.
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<WsMessage>,
    inbound: Mutex<Option<mpsc::Receiver<WsMessage>>>,
    state: AtomicU8,
    pumps: AtomicU8,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

impl Connection {
    /// Start the pumps over `transport` and return the handle.
    pub fn spawn<T: Transport>(transport: T, config: &ConnectionConfig) -> Arc<Self> {
        let capacity = config.buffer_size.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            outbound: outbound_tx,
            inbound: Mutex::new(Some(inbound_rx)),
            state: AtomicU8::new(OPEN),
            pumps: AtomicU8::new(2),
            dropped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        let (sink, stream) = transport.split();
        drop(tokio::spawn(write_pump(
            Arc::clone(&conn),
            sink,
            outbound_rx,
            config.clone(),
        )));
        drop(tokio::spawn(read_pump(
            Arc::clone(&conn),
            stream,
            inbound_tx,
            config.clone(),
        )));
        debug!(conn_id = %conn.id, "connection opened");
        conn
    }

    /// Unique connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            OPEN => ConnectionState::Open,
            CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether close has been requested or completed.
    pub fn is_terminating(&self) -> bool {
        self.state.load(Ordering::Acquire) != OPEN
    }

    /// Queue a message without blocking.
    ///
    /// Returns `false` when the connection is terminating or the outbound
    /// queue is full; a full queue drops the message.
    pub fn send(&self, message: WsMessage) -> bool {
        if self.is_terminating() {
            return false;
        }
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(WS_FRAMES_DROPPED_TOTAL).increment(1);
                warn!(conn_id = %self.id, "outbound queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a text message.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(WsMessage::text(text))
    }

    /// Queue a binary message.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.send(WsMessage::binary(data))
    }

    /// Messages received from the peer.
    ///
    /// The first call takes the inbound queue; later calls get an empty
    /// stream. The stream ends when the read pump exits.
    pub fn receive(&self) -> impl Stream<Item = WsMessage> + Send + Unpin + 'static {
        match self.inbound.lock().take() {
            Some(rx) => ReceiverStream::new(rx).left_stream(),
            None => futures::stream::empty().right_stream(),
        }
    }

    /// Resolves once the connection starts terminating.
    pub async fn done(&self) {
        self.cancel.cancelled().await;
    }

    /// Request close. Idempotent; the termination signal fires once.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(conn_id = %self.id, "closing connection");
            self.cancel.cancel();
        }
    }

    /// Messages dropped because the outbound queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn pump_exited(&self) {
        if self.pumps.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.store(CLOSED, Ordering::Release);
            debug!(conn_id = %self.id, "connection closed");
        }
    }
}

async fn write_pump<S>(
    conn: Arc<Connection>,
    mut sink: S,
    mut outbound: mpsc::Receiver<WsMessage>,
    config: ConnectionConfig,
) where
    S: Sink<Frame, Error = TransportError> + Unpin,
{
    let mut ping = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            () = conn.cancel.cancelled() => break,
            _ = ping.tick() => Frame::Ping(Bytes::new()),
            msg = outbound.recv() => match msg {
                Some(msg) => Frame::Message(msg),
                None => break,
            },
        };
        match tokio::time::timeout(config.timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = %conn.id, error = %e, "write failed");
                break;
            }
            Err(_) => {
                debug!(conn_id = %conn.id, "write timed out");
                break;
            }
        }
    }

    conn.close();
    let farewell = async {
        let _ = sink.send(Frame::Close).await;
        let _ = sink.close().await;
    };
    let _ = tokio::time::timeout(config.timeout, farewell).await;
    conn.pump_exited();
}

async fn read_pump<S>(
    conn: Arc<Connection>,
    mut stream: S,
    inbound: mpsc::Sender<WsMessage>,
    config: ConnectionConfig,
) where
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let mut deadline = Instant::now() + config.timeout;

    loop {
        let next = tokio::select! {
            biased;
            () = conn.cancel.cancelled() => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                debug!(conn_id = %conn.id, "read deadline exceeded");
                break;
            }
            Ok(None) => {
                debug!(conn_id = %conn.id, "peer hung up");
                break;
            }
            Ok(Some(Err(e))) => {
                debug!(conn_id = %conn.id, error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Pong(_) => deadline = Instant::now() + config.timeout,
            Frame::Ping(_) => {}
            Frame::Close => {
                debug!(conn_id = %conn.id, "peer sent close");
                break;
            }
            Frame::Message(msg) => {
                if msg.data.len() > config.read_limit {
                    warn!(
                        conn_id = %conn.id,
                        size = msg.data.len(),
                        limit = config.read_limit,
                        "inbound message exceeds read limit"
                    );
                    break;
                }
                tokio::select! {
                    biased;
                    () = conn.cancel.cancelled() => break,
                    sent = inbound.send(msg) => {
                        if sent.is_err() {
                            debug!(conn_id = %conn.id, "inbound receiver gone, discarding");
                        }
                    }
                }
            }
        }
    }

    conn.close();
    conn.pump_exited();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::frame::FrameKind;
    use crate::websocket::transport::{LoopbackPeer, loopback};

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(1),
            read_limit: 1024,
            buffer_size: 8,
        }
    }

    fn open(config: &ConnectionConfig) -> (Arc<Connection>, LoopbackPeer) {
        let (transport, peer) = loopback(16);
        (Connection::spawn(transport, config), peer)
    }

    async fn wait_closed(conn: &Connection) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.state() != ConnectionState::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection did not reach Closed");
    }

    #[tokio::test]
    async fn echo_round_trip_preserves_kind_and_bytes() {
        let (conn, mut peer) = open(&config());
        let mut inbound = conn.receive();

        assert!(conn.send_text("hello"));
        assert!(conn.send_binary(vec![0u8, 159, 146, 150]));

        for _ in 0..2 {
            let msg = peer.recv_message().await.unwrap();
            assert!(peer.send(Frame::Message(msg)).await);
        }

        let first = inbound.next().await.unwrap();
        assert_eq!(first.kind, FrameKind::Text);
        assert_eq!(first.as_text(), Some("hello"));

        let second = inbound.next().await.unwrap();
        assert_eq!(second.kind, FrameKind::Binary);
        assert_eq!(&second.data[..], &[0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn second_receive_is_empty() {
        let (conn, _peer) = open(&config());
        let _first = conn.receive();
        let mut second = conn.receive();
        assert!(second.next().await.is_none());
    }

    #[tokio::test]
    async fn double_close_is_harmless() {
        let (conn, _peer) = open(&config());
        conn.close();
        conn.close();
        conn.done().await;
        wait_closed(&conn).await;
        assert!(conn.is_terminating());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (conn, _peer) = open(&config());
        conn.close();
        assert!(!conn.send_text("late"));
        assert_eq!(conn.dropped_count(), 0);
    }

    #[tokio::test]
    async fn close_sends_close_frame_and_ends_inbound() {
        let (conn, mut peer) = open(&config());
        let mut inbound = conn.receive();
        conn.close();

        let mut saw_close = false;
        while let Some(frame) = peer.recv().await {
            if frame == Frame::Close {
                saw_close = true;
            }
        }
        assert!(saw_close);
        assert!(inbound.next().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let config = ConnectionConfig {
            buffer_size: 2,
            ..config()
        };
        let (conn, _peer) = open(&config);

        // Current-thread runtime: the write pump has not run yet.
        assert!(conn.send_text("1"));
        assert!(conn.send_text("2"));
        assert!(!conn.send_text("3"));
        assert_eq!(conn.dropped_count(), 1);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn peer_hangup_closes() {
        let (conn, mut peer) = open(&config());
        let mut inbound = conn.receive();
        peer.disconnect();
        conn.done().await;
        assert!(inbound.next().await.is_none());
        wait_closed(&conn).await;
    }

    #[tokio::test]
    async fn peer_close_frame_closes() {
        let (conn, mut peer) = open(&config());
        assert!(peer.send(Frame::Close).await);
        conn.done().await;
        assert!(conn.is_terminating());
    }

    #[tokio::test]
    async fn oversized_message_closes() {
        let (conn, mut peer) = open(&config());
        let big = WsMessage::binary(vec![0u8; 2048]);
        assert!(peer.send(Frame::Message(big)).await);
        conn.done().await;
        wait_closed(&conn).await;
    }

    #[tokio::test]
    async fn pings_are_sent() {
        let config = ConnectionConfig {
            ping_interval: Duration::from_millis(20),
            ..config()
        };
        let (_conn, mut peer) = open(&config);
        let frame = tokio::time::timeout(Duration::from_secs(2), peer.recv())
            .await
            .unwrap();
        assert_matches::assert_matches!(frame, Some(Frame::Ping(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (conn, mut peer) = open(&config());
        // Drain pings without answering them.
        let drain = tokio::spawn(async move { while peer.recv().await.is_some() {} });
        conn.done().await;
        wait_closed(&conn).await;
        drain.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_connection_alive() {
        let (conn, mut peer) = open(&config());
        let responder = tokio::spawn(async move {
            let _ = peer.recv_message().await;
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(conn.state(), ConnectionState::Open);

        conn.close();
        wait_closed(&conn).await;
        responder.abort();
    }
}
