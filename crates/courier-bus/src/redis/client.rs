//! Redis per-node client.
//!
//! Two TCP connections per node: one for `PUBLISH` (request/reply) and one in
//! subscriber mode receiving `message` / `pmessage` pushes. Both are driven by
//! a single task. Calls made before [`NodeBus::start`] wait in an unbounded
//! queue and are flushed once both connections are up.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::NodeDescriptor;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::codec::{RespCodec, RespFrame};
use crate::errors::{BusError, Result};
use crate::node::{DisconnectHandler, MessageHandler, NodeBus, NodeBusFactory};
use crate::subscriptions::SubscriptionOp;

/// TCP connect timeout per connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Connection = Framed<TcpStream, RespCodec>;

enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscription(SubscriptionOp, String),
}

#[derive(Default)]
struct Handlers {
    message: RwLock<Option<MessageHandler>>,
    disconnect: Mutex<Option<DisconnectHandler>>,
}

impl Handlers {
    fn deliver(&self, channel: &str, payload: Bytes) {
        let handler = self.message.read().clone();
        match handler {
            Some(handler) => handler(channel, payload),
            None => debug!(channel, "message without handler dropped"),
        }
    }

    /// Take-and-call, so the handler runs at most once.
    fn fire_disconnect(&self) {
        let handler = self.disconnect.lock().take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// [`NodeBus`] over a Redis server.
pub struct RedisNodeBus {
    node: NodeDescriptor,
    handlers: Arc<Handlers>,
    commands: mpsc::UnboundedSender<Command>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisNodeBus {
    /// Create an unstarted client for `node`.
    pub fn new(node: NodeDescriptor) -> Self {
        let (commands, queue) = mpsc::unbounded_channel();
        Self {
            node,
            handlers: Arc::new(Handlers::default()),
            commands,
            queue: Mutex::new(Some(queue)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.commands.send(command).map_err(|_| BusError::Closed)
    }
}

impl Drop for RedisNodeBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl NodeBus for RedisNodeBus {
    fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Command::Publish {
            topic: topic.to_string(),
            payload,
            reply,
        })?;
        rx.await.map_err(|_| BusError::Closed)?
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.enqueue(Command::Subscription(SubscriptionOp::Subscribe, topic.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.enqueue(Command::Subscription(SubscriptionOp::Unsubscribe, topic.to_string()))
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        self.enqueue(Command::Subscription(SubscriptionOp::PSubscribe, pattern.to_string()))
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.enqueue(Command::Subscription(SubscriptionOp::PUnsubscribe, pattern.to_string()))
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handlers.message.write() = Some(handler);
    }

    fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *self.handlers.disconnect.lock() = Some(handler);
    }

    fn start(&self) -> Result<()> {
        let queue = self.queue.lock().take().ok_or(BusError::Closed)?;
        let handle = tokio::spawn(run(
            self.node.clone(),
            Arc::clone(&self.handlers),
            queue,
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn close(&self) {
        drop(self.handlers.disconnect.lock().take());
        self.cancel.cancel();
        drop(self.queue.lock().take());
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[instrument(skip_all, fields(node = %node))]
async fn run(
    node: NodeDescriptor,
    handlers: Arc<Handlers>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let outcome = drive(&node, &handlers, commands, &cancel).await;
    if cancel.is_cancelled() {
        debug!("redis connection closed");
        return;
    }
    match outcome {
        Ok(()) => info!("redis client dropped"),
        Err(e) => warn!(error = %e, "redis connection lost"),
    }
    handlers.fire_disconnect();
}

async fn drive(
    node: &NodeDescriptor,
    handlers: &Handlers,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut publisher, mut subscriber) = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        pair = connect_pair(node) => pair?,
    };
    info!("redis connected");

    let mut pending: VecDeque<oneshot::Sender<Result<()>>> = VecDeque::new();
    let result = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break Ok(()),
            frame = subscriber.next() => match frame {
                Some(Ok(frame)) => on_push(handlers, frame),
                Some(Err(e)) => break Err(e),
                None => break Err(eof("subscriber")),
            },
            frame = publisher.next() => match frame {
                Some(Ok(frame)) => on_reply(&mut pending, frame),
                Some(Err(e)) => break Err(e),
                None => break Err(eof("publisher")),
            },
            command = commands.recv() => match command {
                Some(Command::Publish { topic, payload, reply }) => {
                    let frame = RespFrame::command([Bytes::from_static(b"PUBLISH"), Bytes::from(topic), payload]);
                    if let Err(e) = publisher.send(frame).await {
                        let _ = reply.send(Err(BusError::Closed));
                        break Err(e);
                    }
                    pending.push_back(reply);
                }
                Some(Command::Subscription(op, arg)) => {
                    debug!(op = op.name(), arg = %arg, "subscription command");
                    let frame = RespFrame::command([Bytes::from_static(op.name().as_bytes()), Bytes::from(arg)]);
                    if let Err(e) = subscriber.send(frame).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
        }
    };

    for reply in pending.drain(..) {
        let _ = reply.send(Err(BusError::Closed));
    }
    result
}

async fn connect_pair(node: &NodeDescriptor) -> Result<(Connection, Connection)> {
    let publisher = connect(node).await?;
    let subscriber = connect(node).await?;
    Ok((publisher, subscriber))
}

async fn connect(node: &NodeDescriptor) -> Result<Connection> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(node.address()))
        .await
        .map_err(|_| BusError::Io(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))??;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, RespCodec))
}

fn eof(which: &str) -> BusError {
    BusError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{which} connection closed by server"),
    ))
}

fn on_push(handlers: &Handlers, frame: RespFrame) {
    let items = match frame {
        RespFrame::Array(Some(items)) => items,
        RespFrame::Error(msg) => {
            warn!(error = %msg, "subscriber error reply");
            return;
        }
        other => {
            warn!(frame = ?other, "unexpected subscriber frame");
            return;
        }
    };

    match items.as_slice() {
        [kind, channel, payload] if kind.as_str() == Some("message") => {
            if let (Some(channel), Some(payload)) = (channel.as_str(), bulk(payload)) {
                handlers.deliver(channel, payload);
            }
        }
        [kind, _pattern, channel, payload] if kind.as_str() == Some("pmessage") => {
            if let (Some(channel), Some(payload)) = (channel.as_str(), bulk(payload)) {
                handlers.deliver(channel, payload);
            }
        }
        [kind, name, count] => {
            debug!(kind = ?kind.as_str(), name = ?name.as_str(), count = ?count, "subscription ack");
        }
        _ => warn!(len = items.len(), "unexpected subscriber push"),
    }
}

fn on_reply(pending: &mut VecDeque<oneshot::Sender<Result<()>>>, frame: RespFrame) {
    let Some(reply) = pending.pop_front() else {
        warn!(frame = ?frame, "reply without pending publish");
        return;
    };
    let result = match frame {
        RespFrame::Integer(_) => Ok(()),
        RespFrame::Error(msg) => Err(BusError::Server(msg)),
        other => Err(BusError::Protocol(format!("unexpected PUBLISH reply {other:?}"))),
    };
    let _ = reply.send(result);
}

fn bulk(frame: &RespFrame) -> Option<Bytes> {
    match frame {
        RespFrame::Bulk(Some(b)) => Some(b.clone()),
        _ => None,
    }
}

/// Builds [`RedisNodeBus`] instances.
#[derive(Debug, Default)]
pub struct RedisNodeBusFactory;

impl NodeBusFactory for RedisNodeBusFactory {
    fn create(&self, node: &NodeDescriptor) -> Arc<dyn NodeBus> {
        Arc::new(RedisNodeBus::new(node.clone()))
    }
}
