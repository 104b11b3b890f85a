//! Connection guardian: a stable handle over a replaceable raw connection.
//!
//! A [`GuardedConnection`] forwards every operation to its current
//! [`RawConnection`]. The four subscription operations are intercepted so the
//! handle always knows which channels and patterns it should be listening on.
//!
//! One listener task is armed per underlying connection. When that connection
//! terminates without [`GuardedConnection::destroy`] having been called, the
//! listener replaces it in place:
//!
//! ```text
//! raw connection closes
//!   → force-close the old connection
//!   → connect + ready + SELECT namespace (retry every reconnect_delay)
//!   → swap the new connection in behind the handle, arm a fresh listener
//!   → SUBSCRIBE all recorded channels, PSUBSCRIBE all recorded patterns
//! ```
//!
//! Callers holding the handle never observe the swap, except that operations
//! in flight on the dead connection fail with the client's own error.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::connection::{ConnectParams, ConnectionFactory, PubSubMessage, RawConnection};
use crate::error::{ClientError, ClientResult};
use crate::subscriptions::SubscriptionRecord;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type ListenerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Tuning for guarded connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardianSettings {
    /// Pause between failed replacement attempts (default: 100ms).
    pub reconnect_delay: Duration,
    /// Buffer of the handle's pub/sub stream (default: 256).
    pub message_capacity: usize,
    /// Upper bound on the graceful QUIT during destroy (default: 1s).
    pub quit_timeout: Duration,
}

impl Default for GuardianSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(100),
            message_capacity: 256,
            quit_timeout: Duration::from_secs(1),
        }
    }
}

/// Listener task for one underlying connection.
struct ListenerSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ListenerSlot {
    fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

struct Inner {
    id: u64,
    params: ConnectParams,
    factory: Arc<dyn ConnectionFactory>,
    settings: GuardianSettings,
    current: RwLock<Arc<dyn RawConnection>>,
    record: Mutex<SubscriptionRecord>,
    /// Also serializes the destroyed check against installing a replacement.
    listener: Mutex<Option<ListenerSlot>>,
    messages: broadcast::Sender<PubSubMessage>,
    destroyed: AtomicBool,
    replacements: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(slot) = self.listener.get_mut().take() {
            slot.stop();
        }
    }
}

/// Cloneable handle to a self-healing connection.
///
/// Clones share the same underlying connection and subscription record.
#[derive(Clone)]
pub struct GuardedConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GuardedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedConnection")
            .field("id", &self.inner.id)
            .field("target", &self.inner.params.to_string())
            .field("replacements", &self.replacements())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl GuardedConnection {
    /// Wrap a freshly connected raw connection and arm its listener.
    ///
    /// `factory` and `params` are reused for every replacement.
    pub fn wrap(
        raw: Arc<dyn RawConnection>,
        params: ConnectParams,
        factory: Arc<dyn ConnectionFactory>,
        settings: GuardianSettings,
    ) -> Self {
        let (messages, _) = broadcast::channel(settings.message_capacity.max(1));
        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            params,
            factory,
            settings,
            current: RwLock::new(Arc::clone(&raw)),
            record: Mutex::new(SubscriptionRecord::new()),
            listener: Mutex::new(None),
            messages,
            destroyed: AtomicBool::new(false),
            replacements: AtomicU64::new(0),
        });
        *inner.listener.lock() = Some(arm(&inner, &raw));

        tracing::debug!(
            connection = inner.id,
            addr = %inner.params,
            "guarding new connection"
        );
        Self { inner }
    }

    /// Process-unique id of this handle, stable across replacements.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn params(&self) -> &ConnectParams {
        &self.inner.params
    }

    /// How many times the underlying connection has been replaced.
    pub fn replacements(&self) -> u64 {
        self.inner.replacements.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Snapshot of the recorded subscriptions.
    pub fn subscriptions(&self) -> SubscriptionRecord {
        self.inner.record.lock().clone()
    }

    /// Pub/sub messages from this connection and every replacement.
    pub fn messages(&self) -> broadcast::Receiver<PubSubMessage> {
        self.inner.messages.subscribe()
    }

    fn current(&self) -> Arc<dyn RawConnection> {
        self.inner.current.read().clone()
    }

    pub async fn command(&self, args: &[Bytes]) -> ClientResult<redis::Value> {
        self.current().command(args).await
    }

    pub async fn get(&self, key: &str) -> ClientResult<Option<Bytes>> {
        let reply = self
            .command(&[Bytes::from_static(b"GET"), Bytes::copy_from_slice(key.as_bytes())])
            .await?;
        match reply {
            redis::Value::BulkString(value) => Ok(Some(Bytes::from(value))),
            redis::Value::Nil => Ok(None),
            reply => Err(ClientError::UnexpectedReply {
                command: "GET",
                reply,
            }),
        }
    }

    pub async fn set(&self, key: &str, value: impl AsRef<[u8]>) -> ClientResult<()> {
        let reply = self
            .command(&[
                Bytes::from_static(b"SET"),
                Bytes::copy_from_slice(key.as_bytes()),
                Bytes::copy_from_slice(value.as_ref()),
            ])
            .await?;
        expect_ok("SET", reply)
    }

    /// Switch namespace on the current connection. Replacements always
    /// return to the namespace the handle was created for.
    pub async fn select(&self, namespace: u32) -> ClientResult<()> {
        let raw = self.current();
        select_namespace(raw.as_ref(), namespace).await
    }

    pub async fn ping(&self) -> ClientResult<()> {
        self.current().ready().await
    }

    pub async fn subscribe<S: AsRef<str>>(&self, channels: &[S]) -> ClientResult<()> {
        let channels = to_names(channels);
        self.inner.record.lock().subscribe(&channels);
        self.current().subscribe(&channels).await
    }

    /// An empty list unsubscribes from every channel.
    pub async fn unsubscribe<S: AsRef<str>>(&self, channels: &[S]) -> ClientResult<()> {
        let channels = to_names(channels);
        self.inner.record.lock().unsubscribe(&channels);
        self.current().unsubscribe(&channels).await
    }

    pub async fn psubscribe<S: AsRef<str>>(&self, patterns: &[S]) -> ClientResult<()> {
        let patterns = to_names(patterns);
        self.inner.record.lock().psubscribe(&patterns);
        self.current().psubscribe(&patterns).await
    }

    /// An empty list unsubscribes from every pattern.
    pub async fn punsubscribe<S: AsRef<str>>(&self, patterns: &[S]) -> ClientResult<()> {
        let patterns = to_names(patterns);
        self.inner.record.lock().punsubscribe(&patterns);
        self.current().punsubscribe(&patterns).await
    }

    /// Ready check and namespace select on the current connection.
    pub(crate) async fn prepare(&self) -> ClientResult<()> {
        let raw = self.current();
        prepare(raw.as_ref(), self.inner.params.namespace).await
    }

    /// Tear down: stop the listener, then QUIT. Never triggers a replacement.
    /// Calling it again is a no-op.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(slot) = self.inner.listener.lock().take() {
            slot.stop();
        }
        self.inner.record.lock().clear();

        let raw = self.current();
        let quit = tokio::time::timeout(self.inner.settings.quit_timeout, raw.quit()).await;
        match quit {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection = self.inner.id, error = %e, "quit failed; force-closing");
                raw.end();
            }
            Err(_) => {
                tracing::debug!(connection = self.inner.id, "quit timed out; force-closing");
                raw.end();
            }
        }
        tracing::debug!(
            connection = self.inner.id,
            addr = %self.inner.params,
            "destroyed connection"
        );
    }
}

fn to_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    names.iter().map(|name| name.as_ref().to_string()).collect()
}

fn expect_ok(command: &'static str, reply: redis::Value) -> ClientResult<()> {
    match reply {
        redis::Value::Okay => Ok(()),
        redis::Value::SimpleString(ref text) if text == "OK" => Ok(()),
        reply => Err(ClientError::UnexpectedReply { command, reply }),
    }
}

async fn select_namespace(raw: &dyn RawConnection, namespace: u32) -> ClientResult<()> {
    let reply = raw
        .command(&[Bytes::from_static(b"SELECT"), Bytes::from(namespace.to_string())])
        .await?;
    expect_ok("SELECT", reply)
}

async fn prepare(raw: &dyn RawConnection, namespace: u32) -> ClientResult<()> {
    raw.ready().await?;
    select_namespace(raw, namespace).await
}

/// Connect and prepare a replacement. A half-prepared connection is closed.
async fn establish(
    factory: &dyn ConnectionFactory,
    params: &ConnectParams,
) -> ClientResult<Arc<dyn RawConnection>> {
    let raw = factory.connect(params).await?;
    if let Err(e) = prepare(raw.as_ref(), params.namespace).await {
        raw.end();
        return Err(e);
    }
    Ok(raw)
}

fn arm(inner: &Arc<Inner>, raw: &Arc<dyn RawConnection>) -> ListenerSlot {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(listen(
        Arc::downgrade(inner),
        raw.closed(),
        raw.messages(),
        shutdown_rx,
    ));
    ListenerSlot {
        handle,
        shutdown_tx,
    }
}

/// Forward pub/sub traffic until the connection closes, then replace it.
fn listen(
    inner: Weak<Inner>,
    mut closed: watch::Receiver<bool>,
    mut messages: broadcast::Receiver<PubSubMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> ListenerFuture {
    Box::pin(async move {
        let mut forwarding = true;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = closed.wait_for(|closed| *closed) => break,
                received = messages.recv(), if forwarding => match received {
                    Ok(message) => {
                        let Some(inner) = inner.upgrade() else { return };
                        let _ = inner.messages.send(message);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "pub/sub listener lagged; messages dropped");
                    }
                    Err(RecvError::Closed) => forwarding = false,
                },
            }
        }

        // Drain anything already buffered before the close was observed.
        while let Ok(message) = messages.try_recv() {
            if let Some(inner) = inner.upgrade() {
                let _ = inner.messages.send(message);
            }
        }

        replace(inner).await;
    })
}

async fn replace(weak: Weak<Inner>) {
    let Some(inner) = weak.upgrade() else { return };
    if inner.destroyed.load(Ordering::SeqCst) {
        return;
    }
    let id = inner.id;
    let old = inner.current.read().clone();
    old.end();
    tracing::warn!(
        connection = id,
        addr = %inner.params,
        "connection terminated unexpectedly; replacing"
    );
    drop(inner);

    // Hold only a weak reference while retrying so dropped handles end the loop.
    let mut attempt: u64 = 0;
    let raw = loop {
        attempt += 1;
        let (factory, params, delay) = {
            let Some(inner) = weak.upgrade() else { return };
            if inner.destroyed.load(Ordering::SeqCst) {
                return;
            }
            (
                Arc::clone(&inner.factory),
                inner.params.clone(),
                inner.settings.reconnect_delay,
            )
        };
        match establish(factory.as_ref(), &params).await {
            Ok(raw) => break raw,
            Err(e) => {
                tracing::warn!(
                    connection = id,
                    addr = %params,
                    attempt = attempt,
                    error = %e,
                    "replacement attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    let Some(inner) = weak.upgrade() else {
        raw.end();
        return;
    };
    let (channels, patterns) = {
        let mut listener = inner.listener.lock();
        if inner.destroyed.load(Ordering::SeqCst) {
            drop(listener);
            raw.end();
            return;
        }
        *inner.current.write() = Arc::clone(&raw);
        // The previous slot belongs to this task; dropping it detaches.
        *listener = Some(arm(&inner, &raw));

        let record = inner.record.lock();
        (record.channels(), record.patterns())
    };

    if !channels.is_empty() {
        if let Err(e) = raw.subscribe(&channels).await {
            tracing::warn!(connection = id, error = %e, "resubscribe failed");
        }
    }
    if !patterns.is_empty() {
        if let Err(e) = raw.psubscribe(&patterns).await {
            tracing::warn!(connection = id, error = %e, "pattern resubscribe failed");
        }
    }

    let replacements = inner.replacements.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(
        connection = id,
        addr = %inner.params,
        attempts = attempt,
        channels = channels.len(),
        patterns = patterns.len(),
        replacements = replacements,
        "connection replaced"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockFactory, eventually};

    fn settings() -> GuardianSettings {
        GuardianSettings {
            reconnect_delay: Duration::from_millis(10),
            ..GuardianSettings::default()
        }
    }

    async fn guarded(factory: &Arc<MockFactory>, namespace: u32) -> GuardedConnection {
        let params = ConnectParams::new("localhost", 6379, namespace);
        let raw = factory.connect(&params).await.unwrap();
        let dyn_factory: Arc<dyn ConnectionFactory> = factory.clone();
        let conn = GuardedConnection::wrap(raw, params, dyn_factory, settings());
        conn.prepare().await.unwrap();
        conn
    }

    fn subscribe_calls(calls: &[Call]) -> Vec<Vec<String>> {
        calls
            .iter()
            .filter_map(|call| match call {
                Call::Subscribe(names) => Some(names.clone()),
                _ => None,
            })
            .collect()
    }

    fn psubscribe_count(calls: &[Call]) -> usize {
        calls
            .iter()
            .filter(|call| matches!(call, Call::Psubscribe(_)))
            .count()
    }

    #[tokio::test]
    async fn prepare_pings_then_selects_namespace() {
        let factory = MockFactory::new();
        let _conn = guarded(&factory, 3).await;

        let calls = factory.connection(0).calls();
        assert_eq!(
            calls,
            vec![
                Call::Ready,
                Call::Command(vec!["SELECT".to_string(), "3".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn subscription_calls_are_recorded_and_delegated() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;

        conn.subscribe(&["a", "b", "c"]).await.unwrap();
        conn.unsubscribe(&["b"]).await.unwrap();
        conn.psubscribe(&["news.*"]).await.unwrap();

        let record = conn.subscriptions();
        assert_eq!(record.channels(), vec!["a", "c"]);
        assert_eq!(record.patterns(), vec!["news.*"]);

        let calls = factory.connection(0).calls();
        assert!(calls.contains(&Call::Subscribe(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string()
        ])));
        assert!(calls.contains(&Call::Unsubscribe(vec!["b".to_string()])));
    }

    #[tokio::test]
    async fn termination_resubscribes_channels_once() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        conn.subscribe(&["b", "a"]).await.unwrap();

        factory.connection(0).terminate();
        eventually(|| conn.replacements() == 1).await;

        assert_eq!(factory.connect_count(), 2);
        let calls = factory.connection(1).calls();
        assert_eq!(
            subscribe_calls(&calls),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
        assert_eq!(psubscribe_count(&calls), 0);
        // Replacement was prepared before resubscribing.
        assert_eq!(calls[0], Call::Ready);
        assert_eq!(
            calls[1],
            Call::Command(vec!["SELECT".to_string(), "0".to_string()])
        );
        // The dead connection was force-closed.
        assert!(factory.connection(0).calls().contains(&Call::End));
    }

    #[tokio::test]
    async fn termination_without_subscriptions_issues_none() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;

        factory.connection(0).terminate();
        eventually(|| conn.replacements() == 1).await;

        let calls = factory.connection(1).calls();
        assert!(subscribe_calls(&calls).is_empty());
        assert_eq!(psubscribe_count(&calls), 0);
    }

    #[tokio::test]
    async fn patterns_are_resubscribed_with_one_call() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        conn.psubscribe(&["x.*", "y.*"]).await.unwrap();

        factory.connection(0).terminate();
        eventually(|| conn.replacements() == 1).await;

        let calls = factory.connection(1).calls();
        assert!(subscribe_calls(&calls).is_empty());
        assert!(calls.contains(&Call::Psubscribe(vec![
            "x.*".to_string(),
            "y.*".to_string()
        ])));
        assert_eq!(psubscribe_count(&calls), 1);
    }

    #[tokio::test]
    async fn handle_keeps_working_after_replacement() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        conn.set("foo", "bar").await.unwrap();

        factory.connection(0).terminate();
        eventually(|| conn.replacements() == 1).await;

        assert_eq!(conn.get("foo").await.unwrap(), Some(Bytes::from_static(b"bar")));
        let calls = factory.connection(1).calls();
        assert!(calls.contains(&Call::Command(vec!["GET".to_string(), "foo".to_string()])));
    }

    #[tokio::test]
    async fn replacement_of_replacement_rearms() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        conn.subscribe(&["a"]).await.unwrap();

        factory.connection(0).terminate();
        eventually(|| conn.replacements() == 1).await;
        factory.connection(1).terminate();
        eventually(|| conn.replacements() == 2).await;

        assert_eq!(factory.connect_count(), 3);
        assert_eq!(
            subscribe_calls(&factory.connection(2).calls()),
            vec![vec!["a".to_string()]]
        );
        assert_eq!(conn.subscriptions().channels(), vec!["a"]);
    }

    #[tokio::test]
    async fn record_changes_between_replacements_are_replayed() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        conn.subscribe(&["a", "b"]).await.unwrap();

        factory.connection(0).terminate();
        eventually(|| conn.replacements() == 1).await;
        conn.unsubscribe(&["a"]).await.unwrap();
        conn.psubscribe(&["p.*"]).await.unwrap();

        factory.connection(1).terminate();
        eventually(|| conn.replacements() == 2).await;

        let calls = factory.connection(2).calls();
        assert_eq!(subscribe_calls(&calls), vec![vec!["b".to_string()]]);
        assert_eq!(psubscribe_count(&calls), 1);
        assert!(calls.contains(&Call::Psubscribe(vec!["p.*".to_string()])));
        assert!(!calls.contains(&Call::Unsubscribe(vec!["a".to_string()])));
    }

    #[tokio::test]
    async fn destroy_stops_a_pending_reconnect() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;

        factory.fail_next(1000);
        factory.connection(0).terminate();
        eventually(|| factory.attempts() >= 3).await;

        conn.destroy().await;
        let attempts = factory.attempts();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(factory.attempts(), attempts);
        assert_eq!(factory.connect_count(), 1);
        assert_eq!(conn.replacements(), 0);
    }

    #[tokio::test]
    async fn failed_replacement_attempts_are_retried() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;

        factory.fail_next(2);
        factory.connection(0).terminate();
        eventually(|| conn.replacements() == 1).await;

        assert_eq!(factory.attempts(), 4);
        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test]
    async fn failed_select_is_retried_on_a_fresh_connection() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;

        factory.fail_next_select(1);
        factory.connection(0).terminate();
        eventually(|| conn.replacements() == 1).await;

        assert_eq!(factory.connect_count(), 3);
        assert!(factory.connection(1).calls().contains(&Call::End));
    }

    #[tokio::test]
    async fn destroy_never_triggers_replacement() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        conn.subscribe(&["a"]).await.unwrap();

        conn.destroy().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(conn.is_destroyed());
        assert_eq!(conn.replacements(), 0);
        assert_eq!(factory.connect_count(), 1);
        assert!(factory.connection(0).calls().contains(&Call::Quit));
        assert!(conn.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;

        conn.destroy().await;
        conn.destroy().await;

        let quits = factory
            .connection(0)
            .calls()
            .into_iter()
            .filter(|call| *call == Call::Quit)
            .count();
        assert_eq!(quits, 1);
    }

    #[tokio::test]
    async fn messages_survive_replacement() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        let mut rx = conn.messages();
        conn.subscribe(&["news"]).await.unwrap();

        factory.connection(0).publish("news", "first");
        let first = rx.recv().await.unwrap();
        assert_eq!(first.channel, "news");
        assert_eq!(first.payload, Bytes::from_static(b"first"));

        factory.connection(0).terminate();
        eventually(|| conn.replacements() == 1).await;

        factory.connection(1).publish("news", "second");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        assert_eq!(conn.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn select_out_of_range_is_server_error() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        let err = conn.select(99).await.unwrap_err();
        assert!(matches!(err, ClientError::Server(_)));
    }

    #[tokio::test]
    async fn clones_share_the_record() {
        let factory = MockFactory::new();
        let conn = guarded(&factory, 0).await;
        let clone = conn.clone();

        clone.subscribe(&["shared"]).await.unwrap();
        assert_eq!(conn.subscriptions().channels(), vec!["shared"]);
        assert_eq!(conn.id(), clone.id());
    }
}
