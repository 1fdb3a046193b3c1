//! The framed, bidirectional transport.
//!
//! Every peer connection is a single full-duplex TCP stream framed
//! with [`tokio_util::codec::LengthDelimitedCodec`] — a 4-byte
//! big-endian length prefix ahead of a `serde_json`-encoded
//! [`Message`](crate::message::Message), the wire contract every node
//! speaks. A reader task per connection decodes inbound frames and
//! either resolves a pending response future (keyed by `msg_id`) or
//! dispatches to a registered handler and writes the handler's answer
//! back over the same stream. A writer task per connection owns the
//! write half and serializes concurrent sends onto it.
//!
//! Connection establishment retries up to
//! [`Config::connection_retry_attempts`](crate::config::Config) times
//! with a fixed delay between attempts; once established, I/O errors
//! close the connection and any response waiters for it time out. The
//! transport never retries at the application level — that is left to
//! callers such as the lock manager's forwarding path.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::message::{Message, MessageType};
use crate::NodeId;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>;
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

struct Connection {
    tx: mpsc::UnboundedSender<Message>,
}

struct PendingResponses {
    table: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl PendingResponses {
    fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, msg_id: String) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.table.lock().await.insert(msg_id, tx);
        rx
    }

    async fn unregister(&self, msg_id: &str) {
        self.table.lock().await.remove(msg_id);
    }

    /// Resolves the waiter for `msg.msg_id`, if any. Returns `true`
    /// when the message was in fact a response to a pending request,
    /// so the caller knows not to also dispatch it to a handler.
    async fn resolve(&self, msg: Message) -> bool {
        let waiter = self.table.lock().await.remove(&msg.msg_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(msg);
                true
            }
            None => false,
        }
    }
}

/// The node-wide transport. Cheap to clone: internals are behind
/// `Arc`, matching `Raft`'s handle-clone convention.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    id: NodeId,
    connections: RwLock<HashMap<NodeId, Connection>>,
    pending: PendingResponses,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl Transport {
    pub fn new(id: NodeId, retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                connections: RwLock::new(HashMap::new()),
                pending: PendingResponses::new(),
                handlers: RwLock::new(HashMap::new()),
                retry_attempts,
                retry_delay,
            }),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Registers the handler invoked for inbound messages of
    /// `msg_type` that are not responses to a pending request.
    pub async fn register_handler<F, Fut>(&self, msg_type: MessageType, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |msg| Box::pin(handler(msg)));
        self.inner.handlers.write().await.insert(msg_type, wrapped);
    }

    /// Binds the listener and spawns the accept loop. Failure to bind
    /// is the one fatal transport error.
    pub async fn listen(&self, addr: std::net::SocketAddr) -> TransportResult<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "transport listening");
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        debug!(%peer_addr, "accepted connection");
                        this.clone().spawn_connection(socket);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(())
    }

    /// Connects to a peer, retrying per the configured policy. On
    /// success the connection is usable for `send`/`broadcast`
    /// immediately.
    pub async fn connect(&self, peer: NodeId, addr: &str) -> TransportResult<()> {
        let mut last_err = None;
        for attempt in 1..=self.inner.retry_attempts.max(1) {
            match TcpStream::connect(addr).await {
                Ok(socket) => {
                    self.clone().register_connection(peer, socket).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(%peer, attempt, error = %e, "connection attempt failed");
                    last_err = Some(e);
                    if attempt < self.inner.retry_attempts {
                        tokio::time::sleep(self.inner.retry_delay).await;
                    }
                }
            }
        }
        Err(TransportError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "connect failed")
        })))
    }

    async fn register_connection(self, peer: NodeId, socket: TcpStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .await
            .insert(peer.clone(), Connection { tx });
        self.spawn_socket_tasks(Some(peer), socket, rx);
    }

    fn spawn_connection(self, socket: TcpStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        // The peer's identity is only known once its first frame
        // arrives (it is carried in `sender`); the reader task
        // registers the connection as soon as it learns it.
        self.spawn_socket_tasks_with_pending_registration(tx, socket, rx);
    }

    fn spawn_socket_tasks(self, peer: Option<NodeId>, socket: TcpStream, rx: mpsc::UnboundedReceiver<Message>) {
        let (read_half, write_half) = socket.into_split();
        let reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        tokio::spawn(Self::writer_task(writer, rx));
        let this = self.clone();
        tokio::spawn(async move { this.reader_task(peer, reader).await });
    }

    fn spawn_socket_tasks_with_pending_registration(
        self,
        tx: mpsc::UnboundedSender<Message>,
        socket: TcpStream,
        rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let (read_half, write_half) = socket.into_split();
        let reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        tokio::spawn(Self::writer_task(writer, rx));
        let this = self.clone();
        tokio::spawn(async move { this.reader_task_registering(tx, reader).await });
    }

    async fn writer_task(
        mut writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let bytes = match serde_json::to_vec(&msg) {
                Ok(b) => b,
                Err(e) => {
                    error!(error = %e, "failed to encode outbound message");
                    continue;
                }
            };
            if let Err(e) = writer.send(bytes.into()).await {
                warn!(error = %e, "connection write failed, closing");
                break;
            }
        }
    }

    /// Reader loop for a connection whose peer id is already known
    /// (we dialed it ourselves).
    async fn reader_task(&self, peer: Option<NodeId>, mut reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>) {
        while let Some(frame) = reader.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "connection read failed, closing");
                    break;
                }
            };
            let msg: Message = match serde_json::from_slice(&frame) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "dropping corrupt frame");
                    continue;
                }
            };
            self.handle_inbound(msg).await;
        }
        if let Some(peer) = peer {
            self.inner.connections.write().await.remove(&peer);
        }
    }

    /// Reader loop for an accepted connection: learns the peer's id
    /// from the first frame and registers the connection so it can
    /// be used for subsequent sends too.
    async fn reader_task_registering(
        &self,
        tx: mpsc::UnboundedSender<Message>,
        mut reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    ) {
        let mut registered: Option<NodeId> = None;
        while let Some(frame) = reader.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "connection read failed, closing");
                    break;
                }
            };
            let msg: Message = match serde_json::from_slice(&frame) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "dropping corrupt frame");
                    continue;
                }
            };
            if registered.is_none() {
                registered = Some(msg.sender.clone());
                self.inner
                    .connections
                    .write()
                    .await
                    .insert(msg.sender.clone(), Connection { tx: tx.clone() });
            }
            self.handle_inbound(msg).await;
        }
        if let Some(peer) = registered {
            self.inner.connections.write().await.remove(&peer);
        }
    }

    async fn handle_inbound(&self, msg: Message) {
        if self.inner.pending.resolve(msg.clone()).await {
            return;
        }
        let handler = self.inner.handlers.read().await.get(&msg.msg_type).cloned();
        let Some(handler) = handler else {
            warn!(msg_type = ?msg.msg_type, "no handler registered, dropping");
            return;
        };
        let msg_type = msg.msg_type;
        let sender = msg.sender.clone();
        let response_data = match handler(msg.clone()).await {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, ?msg_type, "handler raised an error");
                serde_json::json!({ "error": e.to_string() })
            }
        };
        let response = msg.respond(self.inner.id.clone(), response_data);
        if let Err(e) = self.send_raw(&sender, response).await {
            warn!(peer = %sender, error = %e, "failed to send response");
        }
    }

    async fn send_raw(&self, target: &NodeId, msg: Message) -> TransportResult<()> {
        let conns = self.inner.connections.read().await;
        let conn = conns
            .get(target)
            .ok_or_else(|| TransportError::ConnectionDown(target.clone()))?;
        conn.tx
            .send(msg)
            .map_err(|_| TransportError::ConnectionDown(target.clone()))
    }

    /// Sends `message` to `target`. When `timeout` is `Some`, parks on
    /// the message's `msg_id` until a reply arrives or the timeout
    /// elapses, unregistering the waiter either way.
    pub async fn send(
        &self,
        target: &NodeId,
        message: Message,
        timeout: Option<Duration>,
    ) -> TransportResult<Option<Message>> {
        match timeout {
            None => {
                self.send_raw(target, message).await?;
                Ok(None)
            }
            Some(timeout) => {
                let msg_id = message.msg_id.clone();
                let rx = self.inner.pending.register(msg_id.clone()).await;
                if let Err(e) = self.send_raw(target, message).await {
                    self.inner.pending.unregister(&msg_id).await;
                    return Err(e);
                }
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(response)) => Ok(Some(response)),
                    Ok(Err(_)) => Err(TransportError::ResponseTimeout(msg_id)),
                    Err(_) => {
                        self.inner.pending.unregister(&msg_id).await;
                        Err(TransportError::ResponseTimeout(msg_id))
                    }
                }
            }
        }
    }

    /// Fans `message` out to every connected peer except those in
    /// `exclude`.
    pub async fn broadcast(&self, message: Message, exclude: &[NodeId]) {
        let targets: Vec<NodeId> = {
            let conns = self.inner.connections.read().await;
            conns.keys().filter(|id| !exclude.contains(id)).cloned().collect()
        };
        for target in targets {
            if let Err(e) = self.send_raw(&target, message.clone()).await {
                debug!(peer = %target, error = %e, "broadcast send failed");
            }
        }
    }

    pub async fn connected_peers(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn is_connected(&self, peer: &NodeId) -> bool {
        self.inner.connections.read().await.contains_key(peer)
    }
}
