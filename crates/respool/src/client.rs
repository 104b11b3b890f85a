//! Default [`ConnectionFactory`], built on the `redis` crate.
//!
//! A [`RedisConnection`] pairs a multiplexed connection for commands with a
//! pub/sub connection opened on the first subscription call. Messages from
//! the pub/sub side are fanned out on a broadcast channel. Losing either
//! socket flips the `closed` watch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use redis::{AsyncConnectionConfig, Client, Msg, PushInfo, PushKind};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::{ConnectParams, ConnectionFactory, PubSubMessage, RawConnection};
use crate::error::{ClientError, ClientResult};

/// Client option: connect timeout in milliseconds.
pub const CONNECT_TIMEOUT_MS: &str = "connect_timeout_ms";

// ── Termination signal ───────────────────────────────────────────────

/// Flips `closed` when dropped, so a task that returns, panics or is
/// aborted always reports termination.
struct CloseOnDrop(Arc<watch::Sender<bool>>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

#[derive(Clone, Copy)]
enum Subscription {
    Subscribe,
    Unsubscribe,
    Psubscribe,
    Punsubscribe,
}

// ── RedisConnection ──────────────────────────────────────────────────

/// A [`RawConnection`] over `redis::aio`.
pub struct RedisConnection {
    addr: String,
    client: Client,
    connect_timeout: Duration,
    commands: Mutex<Option<MultiplexedConnection>>,
    pubsub: AsyncMutex<Option<PubSubSink>>,
    messages: broadcast::Sender<PubSubMessage>,
    closed: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("addr", &self.addr)
            .field("closed", &*self.closed.borrow())
            .finish_non_exhaustive()
    }
}

impl RedisConnection {
    fn new(
        addr: String,
        client: Client,
        connect_timeout: Duration,
        commands: MultiplexedConnection,
        pushes: mpsc::UnboundedReceiver<PushInfo>,
        message_capacity: usize,
    ) -> Self {
        let (messages, _) = broadcast::channel(message_capacity.max(1));
        let (closed_tx, _) = watch::channel(false);
        let closed = Arc::new(closed_tx);

        let watcher = tokio::spawn(watch_disconnect(
            pushes,
            CloseOnDrop(Arc::clone(&closed)),
            addr.clone(),
        ));

        Self {
            addr,
            client,
            connect_timeout,
            commands: Mutex::new(Some(commands)),
            pubsub: AsyncMutex::new(None),
            messages,
            closed,
            tasks: Mutex::new(vec![watcher]),
        }
    }

    fn multiplexed(&self) -> ClientResult<MultiplexedConnection> {
        self.commands.lock().clone().ok_or(ClientError::Closed)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Force-close after an error that leaves the socket unusable.
    fn fail(&self, e: ClientError) -> ClientError {
        if e.is_fatal() {
            tracing::debug!(addr = %self.addr, error = %e, "connection failed; closing");
            self.end();
        }
        e
    }

    async fn open_pubsub(&self) -> ClientResult<PubSubSink> {
        let pubsub = tokio::time::timeout(self.connect_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| ClientError::ConnectTimeout {
                addr: self.addr.clone(),
                timeout: self.connect_timeout,
            })??;
        let (sink, stream) = pubsub.split();

        let forwarder = tokio::spawn(forward(
            stream,
            self.messages.clone(),
            CloseOnDrop(Arc::clone(&self.closed)),
            self.addr.clone(),
        ));
        self.tasks.lock().push(forwarder);

        tracing::debug!(addr = %self.addr, "opened pub/sub connection");
        Ok(sink)
    }

    async fn subscription(&self, change: Subscription, names: &[String]) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let mut slot = self.pubsub.lock().await;
        if slot.is_none() {
            *slot = Some(self.open_pubsub().await?);
        }
        let Some(sink) = slot.as_mut() else {
            return Err(ClientError::Closed);
        };

        let result = match change {
            Subscription::Subscribe => sink.subscribe(names).await,
            Subscription::Unsubscribe => sink.unsubscribe(names).await,
            Subscription::Psubscribe => sink.psubscribe(names).await,
            Subscription::Punsubscribe => sink.punsubscribe(names).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = ClientError::from(e);
                if e.is_fatal() {
                    slot.take();
                }
                drop(slot);
                Err(self.fail(e))
            }
        }
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl RawConnection for RedisConnection {
    async fn command(&self, args: &[Bytes]) -> ClientResult<redis::Value> {
        let mut conn = self.multiplexed()?;
        let mut cmd = redis::Cmd::new();
        for arg in args {
            cmd.arg(&arg[..]);
        }
        cmd.query_async::<redis::Value>(&mut conn)
            .await
            .map_err(|e| self.fail(e.into()))
    }

    async fn subscribe(&self, channels: &[String]) -> ClientResult<()> {
        self.subscription(Subscription::Subscribe, channels).await
    }

    async fn unsubscribe(&self, channels: &[String]) -> ClientResult<()> {
        self.subscription(Subscription::Unsubscribe, channels).await
    }

    async fn psubscribe(&self, patterns: &[String]) -> ClientResult<()> {
        self.subscription(Subscription::Psubscribe, patterns).await
    }

    async fn punsubscribe(&self, patterns: &[String]) -> ClientResult<()> {
        self.subscription(Subscription::Punsubscribe, patterns).await
    }

    async fn ready(&self) -> ClientResult<()> {
        let reply = self.command(&[Bytes::from_static(b"PING")]).await?;
        match reply {
            redis::Value::SimpleString(ref text) if text.eq_ignore_ascii_case("PONG") => Ok(()),
            reply => Err(ClientError::UnexpectedReply {
                command: "PING",
                reply,
            }),
        }
    }

    fn messages(&self) -> broadcast::Receiver<PubSubMessage> {
        self.messages.subscribe()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn end(&self) {
        // Dropping the last handle stops the multiplexed driver and its socket.
        self.commands.lock().take();
        if let Ok(mut sink) = self.pubsub.try_lock() {
            sink.take();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.closed.send_replace(true);
    }

    async fn quit(&self) -> ClientResult<()> {
        let result = self.command(&[Bytes::from_static(b"QUIT")]).await;
        self.end();
        result.map(|_| ())
    }
}

async fn watch_disconnect(
    mut pushes: mpsc::UnboundedReceiver<PushInfo>,
    _closed: CloseOnDrop,
    addr: String,
) {
    while let Some(push) = pushes.recv().await {
        if matches!(push.kind, PushKind::Disconnection) {
            break;
        }
    }
    tracing::debug!(addr = %addr, "connection closed");
}

async fn forward(
    stream: PubSubStream,
    messages: broadcast::Sender<PubSubMessage>,
    _closed: CloseOnDrop,
    addr: String,
) {
    let mut stream = std::pin::pin!(stream);
    while let Some(msg) = stream.next().await {
        // No receivers is fine; the message is simply dropped.
        let _ = messages.send(to_message(&msg));
    }
    tracing::debug!(addr = %addr, "pub/sub connection closed");
}

fn to_message(msg: &Msg) -> PubSubMessage {
    let pattern = if msg.from_pattern() {
        msg.get_pattern::<String>().ok()
    } else {
        None
    };
    PubSubMessage {
        pattern,
        channel: msg.get_channel_name().to_string(),
        payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
    }
}

// ── RedisConnectionFactory ───────────────────────────────────────────

/// Opens [`RedisConnection`]s.
#[derive(Clone, Debug)]
pub struct RedisConnectionFactory {
    /// Used when the target carries no `connect_timeout_ms` option (default: 5s).
    pub connect_timeout: Duration,
    /// Per-connection pub/sub buffer (default: 256).
    pub message_capacity: usize,
}

impl Default for RedisConnectionFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            message_capacity: 256,
        }
    }
}

impl RedisConnectionFactory {
    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }
}

#[async_trait]
impl ConnectionFactory for RedisConnectionFactory {
    async fn connect(&self, params: &ConnectParams) -> ClientResult<Arc<dyn RawConnection>> {
        let addr = params.addr();
        let timeout = params
            .duration_option(CONNECT_TIMEOUT_MS)
            .unwrap_or(self.connect_timeout);

        let client = Client::open((params.host.as_str(), params.port))?;
        let (push_tx, pushes) = mpsc::unbounded_channel();
        let config = AsyncConnectionConfig::new().set_push_sender(push_tx);
        let commands = tokio::time::timeout(
            timeout,
            client.get_multiplexed_async_connection_with_config(&config),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout {
            addr: addr.clone(),
            timeout,
        })??;

        tracing::debug!(addr = %addr, namespace = params.namespace, "opened connection");
        Ok(Arc::new(RedisConnection::new(
            addr,
            client,
            timeout,
            commands,
            pushes,
            self.message_capacity,
        )))
    }
}
