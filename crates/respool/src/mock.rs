//! In-memory connection and factory used by unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::connection::{ConnectParams, ConnectionFactory, PubSubMessage, RawConnection};
use crate::error::{ClientError, ClientResult};

/// Operations observed by a [`MockConnection`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Command(Vec<String>),
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Psubscribe(Vec<String>),
    Punsubscribe(Vec<String>),
    Ready,
    Quit,
    End,
}

/// Shared between all connections from one factory, like a server would be.
#[derive(Default)]
struct MockServer {
    store: Mutex<HashMap<(u32, String), Bytes>>,
    select_failures: AtomicUsize,
}

pub(crate) struct MockConnection {
    server: Arc<MockServer>,
    namespace: Mutex<u32>,
    calls: Mutex<Vec<Call>>,
    messages: broadcast::Sender<PubSubMessage>,
    closed: watch::Sender<bool>,
}

impl MockConnection {
    fn new(server: Arc<MockServer>) -> Self {
        let (messages, _) = broadcast::channel(64);
        let (closed, _) = watch::channel(false);
        Self {
            server,
            namespace: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
            messages,
            closed,
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Simulate the server dropping the connection.
    pub(crate) fn terminate(&self) {
        self.closed.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn publish(&self, channel: &str, payload: &str) {
        let _ = self.messages.send(PubSubMessage {
            pattern: None,
            channel: channel.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        });
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check_open(&self) -> ClientResult<()> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RawConnection for MockConnection {
    async fn command(&self, args: &[Bytes]) -> ClientResult<redis::Value> {
        let args: Vec<String> = args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        self.record(Call::Command(args.clone()));
        self.check_open()?;

        let namespace = *self.namespace.lock();
        match args.first().map(|verb| verb.to_ascii_uppercase()).as_deref() {
            Some("SELECT") => {
                let index: u32 = args
                    .get(1)
                    .and_then(|arg| arg.parse().ok())
                    .ok_or_else(|| ClientError::Server("ERR invalid DB index".to_string()))?;
                let fail = self
                    .server
                    .select_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if fail || index >= 16 {
                    return Err(ClientError::Server("ERR DB index is out of range".to_string()));
                }
                *self.namespace.lock() = index;
                Ok(redis::Value::Okay)
            }
            Some("SET") if args.len() == 3 => {
                self.server.store.lock().insert(
                    (namespace, args[1].clone()),
                    Bytes::copy_from_slice(args[2].as_bytes()),
                );
                Ok(redis::Value::Okay)
            }
            Some("GET") if args.len() == 2 => Ok(self
                .server
                .store
                .lock()
                .get(&(namespace, args[1].clone()))
                .map(|value| redis::Value::BulkString(value.to_vec()))
                .unwrap_or(redis::Value::Nil)),
            Some("PING") => Ok(redis::Value::SimpleString("PONG".to_string())),
            _ => Ok(redis::Value::Okay),
        }
    }

    async fn subscribe(&self, channels: &[String]) -> ClientResult<()> {
        self.record(Call::Subscribe(channels.to_vec()));
        self.check_open()
    }

    async fn unsubscribe(&self, channels: &[String]) -> ClientResult<()> {
        self.record(Call::Unsubscribe(channels.to_vec()));
        self.check_open()
    }

    async fn psubscribe(&self, patterns: &[String]) -> ClientResult<()> {
        self.record(Call::Psubscribe(patterns.to_vec()));
        self.check_open()
    }

    async fn punsubscribe(&self, patterns: &[String]) -> ClientResult<()> {
        self.record(Call::Punsubscribe(patterns.to_vec()));
        self.check_open()
    }

    async fn ready(&self) -> ClientResult<()> {
        self.record(Call::Ready);
        self.check_open()
    }

    fn messages(&self) -> broadcast::Receiver<PubSubMessage> {
        self.messages.subscribe()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn end(&self) {
        self.record(Call::End);
        self.closed.send_replace(true);
    }

    async fn quit(&self) -> ClientResult<()> {
        self.record(Call::Quit);
        self.check_open()?;
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Factory handing out [`MockConnection`]s, with injectable failures.
#[derive(Default)]
pub(crate) struct MockFactory {
    server: Arc<MockServer>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    attempts: AtomicUsize,
    connect_failures: AtomicUsize,
}

impl MockFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` connect attempts.
    pub(crate) fn fail_next(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` SELECT commands on any connection.
    pub(crate) fn fail_next_select(&self, n: usize) {
        self.server.select_failures.store(n, Ordering::SeqCst);
    }

    /// Successful connects.
    pub(crate) fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// All connects, including failed ones.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.connections.lock()[index])
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, _params: &ConnectParams) -> ClientResult<Arc<dyn RawConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            let refused = std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock connect refused",
            );
            return Err(ClientError::Redis(refused.into()));
        }

        let conn = Arc::new(MockConnection::new(Arc::clone(&self.server)));
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}

/// Pop one complete `*N` array-of-bulk-strings command off `buf`, if buffered.
pub(crate) fn take_command(buf: &mut BytesMut) -> Option<Vec<String>> {
    let (count, mut pos) = read_header(buf, 0, b'*')?;
    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let (len, start) = read_header(buf, pos, b'$')?;
        let end = start.checked_add(len)?;
        if buf.len() < end + 2 {
            return None;
        }
        args.push(String::from_utf8_lossy(&buf[start..end]).into_owned());
        pos = end + 2;
    }
    buf.advance(pos);
    Some(args)
}

fn read_header(buf: &[u8], pos: usize, prefix: u8) -> Option<(usize, usize)> {
    if buf.get(pos) != Some(&prefix) {
        return None;
    }
    let rest = buf.get(pos + 1..)?;
    let line = rest.windows(2).position(|w| w == b"\r\n")?;
    let value = std::str::from_utf8(&rest[..line]).ok()?.parse().ok()?;
    Some((value, pos + 1 + line + 2))
}
