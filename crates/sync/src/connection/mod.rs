// Connection manager: one persistent link per backend URL with reconnection.
//
// The connection loop owns the transport. It mirrors its status into the
// store, feeds inbound frames to the handler registry or the request channel,
// re-sends subscriptions after every reconnect and flushes envelopes queued
// while the link was down.
//
// Transport is abstracted via `Connector` for testability. The WebSocket
// implementation lives in `ws`.

pub mod ws;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use taskdeck_common::protocol::envelope::{decode_frame, Envelope, Inbound};
use taskdeck_common::protocol::topics;
use taskdeck_common::types::{SessionId, TaskId};

use crate::config::ConfigError;
use crate::handlers::HandlerRegistry;
use crate::rpc::RequestChannel;
use crate::store::{ConnectionStatus, Store};

/// Envelopes kept while disconnected; the oldest is dropped beyond this.
pub const MAX_QUEUED_ENVELOPES: usize = 256;

const SIGNAL_CAPACITY: usize = 64;

// ── Configuration ───────────────────────────────────────────────────

/// Reconnection parameters. A link that drops before `stable_after` counts
/// as a failure like a refused dial, so a flapping server is backed off too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub stable_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: u32::MAX, // retry indefinitely
            stable_after: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.min(7);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

/// Liveness probing for transports that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(15), timeout: Duration::from_secs(10) }
    }
}

// ── Transport trait ─────────────────────────────────────────────────

/// One inbound item from an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    Text(String),
    /// The link is gone; the reason is for logs and the status slice.
    Closed(Option<String>),
}

/// An open link: text frames out, text frames (and the final close) in.
/// Dropping `outbound` asks the transport to close.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportFrame>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("connecting to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("connection is closed")]
    Closed,
}

/// Abstraction over the network transport.
///
/// In production this is `ws::WsConnector` (tokio-tungstenite).
/// In tests it can be an in-memory pair of channels.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &Url) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

// ── Signals & subscriptions ─────────────────────────────────────────

/// Lifecycle events fanned out to dependants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSignal {
    /// A link is open.
    Connected,
    /// A link reopened after a loss; snapshots should be fetched again.
    Resync,
    /// The link dropped and a reconnect is pending.
    Disconnected { reason: String },
    /// The connection was closed or gave up. Nothing follows.
    Closed,
}

/// Server-side interest the client re-establishes after every reconnect.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subscription {
    Task(TaskId),
    Session(SessionId),
}

impl Subscription {
    fn envelope(&self, subscribe: bool) -> Envelope {
        match (self, subscribe) {
            (Self::Task(id), true) => Envelope::new(topics::TASK_SUBSCRIBE, json!({ "task_id": id })),
            (Self::Task(id), false) => Envelope::new(topics::TASK_UNSUBSCRIBE, json!({ "task_id": id })),
            (Self::Session(id), true) => {
                Envelope::new(topics::SESSION_SUBSCRIBE, json!({ "session_id": id }))
            }
            (Self::Session(id), false) => {
                Envelope::new(topics::SESSION_UNSUBSCRIBE, json!({ "session_id": id }))
            }
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(Envelope),
    Subscribe(Subscription),
    Unsubscribe(Subscription),
}

// ── Connection manager ──────────────────────────────────────────────

/// Collaborators the connection loop feeds.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<Store>,
    pub registry: Arc<HandlerRegistry>,
    pub requests: Arc<RequestChannel>,
}

/// Hands out one connection per backend URL.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    context: SyncContext,
    reconnect_policy: ReconnectPolicy,
    live: Mutex<HashMap<Url, Weak<HandleInner>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, context: SyncContext) -> Self {
        Self {
            connector: Arc::new(connector),
            context,
            reconnect_policy: ReconnectPolicy::default(),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    /// Open (or join) the connection to `url`. A malformed URL is rejected
    /// here and never dialed. Must be called inside a Tokio runtime.
    pub fn connect(&self, url: &str) -> Result<ConnectionHandle, ConfigError> {
        let url = validate_ws_url(url)?;

        let mut live = lock(&self.live);
        live.retain(|_, handle| handle.strong_count() > 0);
        if let Some(inner) = live.get(&url).and_then(Weak::upgrade) {
            if !inner.is_finished() {
                debug!(%url, "reusing open connection");
                return Ok(ConnectionHandle { inner });
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (signal_tx, _) = broadcast::channel(SIGNAL_CAPACITY);

        let worker = ConnectionLoop {
            url: url.clone(),
            connector: Arc::clone(&self.connector),
            context: self.context.clone(),
            policy: self.reconnect_policy.clone(),
            signals: signal_tx.clone(),
            subscriptions: BTreeSet::new(),
            queue: VecDeque::new(),
        };
        let task = tokio::spawn(worker.run(command_rx, shutdown_rx));

        info!(%url, "connection started");
        let inner = Arc::new(HandleInner {
            url: url.clone(),
            commands: command_tx,
            signals: signal_tx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        });
        live.insert(url, Arc::downgrade(&inner));
        Ok(ConnectionHandle { inner })
    }
}

/// Check that `value` is a `ws`/`wss` URL with a host.
pub fn validate_ws_url(value: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(value)
        .map_err(|error| ConfigError::InvalidUrl { url: value.to_string(), reason: error.to_string() })?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(ConfigError::InvalidUrl {
            url: value.to_string(),
            reason: format!("expected ws or wss, got `{}`", parsed.scheme()),
        });
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidUrl { url: value.to_string(), reason: "missing host".into() });
    }
    if parsed.scheme() == "ws" && !is_loopback_host(parsed.host_str()) {
        warn!(url = %parsed, "connecting without TLS to a non-local host");
    }
    Ok(parsed)
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

// ── Handle ──────────────────────────────────────────────────────────

struct HandleInner {
    url: Url,
    commands: mpsc::UnboundedSender<Command>,
    signals: broadcast::Sender<SyncSignal>,
    shutdown: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HandleInner {
    fn is_finished(&self) -> bool {
        lock(&self.task).as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Shared handle to a running connection. The connection stops when
/// `close` is called or the last clone is dropped.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Lifecycle signals from now on.
    pub fn signals(&self) -> broadcast::Receiver<SyncSignal> {
        self.inner.signals.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_finished()
    }

    /// Fire-and-forget send. Queued while disconnected.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.command(Command::Send(envelope))
    }

    pub fn subscribe_task(&self, task_id: impl Into<TaskId>) -> Result<(), TransportError> {
        self.command(Command::Subscribe(Subscription::Task(task_id.into())))
    }

    pub fn unsubscribe_task(&self, task_id: impl Into<TaskId>) -> Result<(), TransportError> {
        self.command(Command::Unsubscribe(Subscription::Task(task_id.into())))
    }

    pub fn subscribe_session(&self, session_id: impl Into<SessionId>) -> Result<(), TransportError> {
        self.command(Command::Subscribe(Subscription::Session(session_id.into())))
    }

    pub fn unsubscribe_session(
        &self,
        session_id: impl Into<SessionId>,
    ) -> Result<(), TransportError> {
        self.command(Command::Unsubscribe(Subscription::Session(session_id.into())))
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        self.inner.commands.send(command).map_err(|_| TransportError::Closed)
    }

    /// Stop the connection and wait for its task to finish. No handler
    /// fires after this returns.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(());
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

// ── Connection loop ─────────────────────────────────────────────────

struct ConnectionLoop<C: Connector> {
    url: Url,
    connector: Arc<C>,
    context: SyncContext,
    policy: ReconnectPolicy,
    signals: broadcast::Sender<SyncSignal>,
    subscriptions: BTreeSet<Subscription>,
    queue: VecDeque<String>,
}

/// Why a connected session ended.
enum LinkEnd {
    Lost(String),
    Shutdown,
}

impl<C: Connector> ConnectionLoop<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut failures: u32 = 0;
        let mut has_connected = false;

        loop {
            let status =
                if has_connected { ConnectionStatus::Reconnecting } else { ConnectionStatus::Connecting };
            self.set_status(status, None);

            let attempt = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                attempt = self.connector.connect(&self.url) => attempt,
            };

            let link = match attempt {
                Ok(link) => link,
                Err(error) => {
                    failures = failures.saturating_add(1);
                    warn!(url = %self.url, failures, %error, "connection attempt failed");
                    if !self.policy.should_retry(failures) {
                        self.set_status(ConnectionStatus::Failed, Some(error.to_string()));
                        break;
                    }
                    self.set_status(ConnectionStatus::Reconnecting, Some(error.to_string()));
                    if !self.backoff(failures, &mut commands, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let resync = has_connected;
            has_connected = true;
            let opened = tokio::time::Instant::now();
            match self.serve(link, resync, &mut commands, &mut shutdown).await {
                LinkEnd::Shutdown => break,
                LinkEnd::Lost(reason) => {
                    let uptime = opened.elapsed();
                    failures = if uptime >= self.policy.stable_after { 0 } else { failures.saturating_add(1) };
                    warn!(url = %self.url, %reason, ?uptime, failures, "connection lost");
                    self.set_status(ConnectionStatus::Reconnecting, Some(reason.clone()));
                    let _ = self.signals.send(SyncSignal::Disconnected { reason });
                    if !self.backoff(failures, &mut commands, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.context.requests.detach();
        if self.context.store.snapshot().connection.status != ConnectionStatus::Failed {
            self.set_status(ConnectionStatus::Disconnected, None);
        }
        let _ = self.signals.send(SyncSignal::Closed);
        info!(url = %self.url, "connection closed");
    }

    /// Pump one open link until it drops or shutdown is requested.
    async fn serve(
        &mut self,
        mut link: Link,
        resync: bool,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> LinkEnd {
        self.context.requests.attach(link.outbound.clone());
        self.set_status(ConnectionStatus::Connected, None);
        info!(url = %self.url, resync, "connected");

        for frame in self.subscriptions.iter().filter_map(|subscription| encode(&subscription.envelope(true))) {
            let _ = link.outbound.send(frame);
        }
        if !self.queue.is_empty() {
            debug!(count = self.queue.len(), "flushing queued envelopes");
        }
        while let Some(frame) = self.queue.pop_front() {
            if let Err(mpsc::error::SendError(frame)) = link.outbound.send(frame) {
                self.queue.push_front(frame);
                break;
            }
        }

        let _ = self.signals.send(SyncSignal::Connected);
        if resync {
            self.context.store.mutate(|state| state.record_resync());
            let _ = self.signals.send(SyncSignal::Resync);
        }

        let end = loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break LinkEnd::Shutdown,
                frame = link.inbound.recv() => match frame {
                    Some(TransportFrame::Text(text)) => self.dispatch(&text),
                    Some(TransportFrame::Closed(reason)) => {
                        break LinkEnd::Lost(reason.unwrap_or_else(|| "closed by server".into()));
                    }
                    None => break LinkEnd::Lost("transport ended".into()),
                },
                command = commands.recv() => match command {
                    Some(command) => self.apply_connected(command, &link.outbound),
                    None => break LinkEnd::Shutdown,
                },
            }
        };

        self.context.requests.detach();
        end
    }

    /// Sleep before the next attempt, still accepting commands. Returns
    /// `false` when shutdown was requested meanwhile.
    async fn backoff(
        &mut self,
        failures: u32,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let delay = self.policy.delay(failures);
        debug!(url = %self.url, ?delay, "waiting before reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return false,
                _ = &mut sleep => return true,
                command = commands.recv() => match command {
                    Some(command) => self.apply_disconnected(command),
                    None => return false,
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match decode_frame(text) {
            Ok(Inbound::Broadcast(envelope)) => {
                self.context.registry.dispatch(envelope);
            }
            Ok(Inbound::Response(response)) => {
                self.context.requests.resolve(response);
            }
            Err(error) => debug!(%error, "dropping malformed frame"),
        }
    }

    fn apply_connected(&mut self, command: Command, outbound: &mpsc::UnboundedSender<String>) {
        let frame = match command {
            Command::Send(envelope) => encode(&envelope),
            Command::Subscribe(subscription) => {
                let frame = encode(&subscription.envelope(true));
                self.subscriptions.insert(subscription);
                frame
            }
            Command::Unsubscribe(subscription) => {
                if !self.subscriptions.remove(&subscription) {
                    return;
                }
                encode(&subscription.envelope(false))
            }
        };
        let Some(frame) = frame else {
            return;
        };
        if let Err(mpsc::error::SendError(frame)) = outbound.send(frame) {
            enqueue(&mut self.queue, frame);
        }
    }

    fn apply_disconnected(&mut self, command: Command) {
        match command {
            Command::Send(envelope) => {
                if let Some(frame) = encode(&envelope) {
                    enqueue(&mut self.queue, frame);
                }
            }
            // Subscriptions are re-sent on open; the server forgets them on close.
            Command::Subscribe(subscription) => {
                self.subscriptions.insert(subscription);
            }
            Command::Unsubscribe(subscription) => {
                self.subscriptions.remove(&subscription);
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus, error: Option<String>) {
        self.context.store.mutate(|state| state.set_connection_status(status, error));
    }
}

/// Serialize an outbound envelope; a frame that cannot be encoded is logged
/// and skipped.
fn encode(envelope: &Envelope) -> Option<String> {
    match serde_json::to_string(envelope) {
        Ok(frame) => Some(frame),
        Err(error) => {
            warn!(topic = %envelope.topic, %error, "failed to encode envelope, skipping");
            None
        }
    }
}

fn enqueue(queue: &mut VecDeque<String>, frame: String) {
    if queue.len() >= MAX_QUEUED_ENVELOPES {
        queue.pop_front();
        warn!(capacity = MAX_QUEUED_ENVELOPES, "outbound queue full, dropping oldest envelope");
    }
    queue.push_back(frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::Value;
    use tokio::time::timeout;

    // ── Mock connector ──────────────────────────────────────────────

    /// Server side of an accepted in-memory link.
    struct ServerEnd {
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<TransportFrame>,
    }

    impl ServerEnd {
        async fn next_topic(&mut self) -> String {
            let frame = self.from_client.recv().await.expect("client frame");
            let value: Value = serde_json::from_str(&frame).expect("json frame");
            value["type"].as_str().expect("type").to_string()
        }

        fn push(&self, value: Value) {
            self.to_client
                .send(TransportFrame::Text(value.to_string()))
                .expect("client should be listening");
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Accept,
        Refuse,
    }

    struct MockConnector {
        script: Mutex<VecDeque<Outcome>>,
        attempts: AtomicU32,
        accepted: mpsc::UnboundedSender<ServerEnd>,
    }

    impl MockConnector {
        fn new(script: &[Outcome]) -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
            let (accepted, rx) = mpsc::unbounded_channel();
            let connector = Self {
                script: Mutex::new(script.iter().copied().collect()),
                attempts: AtomicU32::new(0),
                accepted,
            };
            (connector, rx)
        }
    }

    impl Connector for MockConnector {
        fn connect(&self, url: &Url) -> impl Future<Output = Result<Link, TransportError>> + Send {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let outcome = lock(&self.script).pop_front().unwrap_or(Outcome::Refuse);
            let accepted = self.accepted.clone();
            let url = url.to_string();
            async move {
                match outcome {
                    Outcome::Refuse => Err(TransportError::Connect { url, reason: "refused".into() }),
                    Outcome::Accept => {
                        let (out_tx, out_rx) = mpsc::unbounded_channel();
                        let (in_tx, in_rx) = mpsc::unbounded_channel();
                        let _ = accepted.send(ServerEnd { from_client: out_rx, to_client: in_tx });
                        Ok(Link { outbound: out_tx, inbound: in_rx })
                    }
                }
            }
        }
    }

    fn context() -> SyncContext {
        let store = Arc::new(Store::new());
        let registry = Arc::new(HandlerRegistry::with_default_handlers(&store));
        SyncContext { store, registry, requests: Arc::new(RequestChannel::default()) }
    }

    async fn next_signal(rx: &mut broadcast::Receiver<SyncSignal>) -> SyncSignal {
        timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("signal should arrive")
            .expect("signal channel open")
    }

    // ── Policy ──────────────────────────────────────────────────────

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(7), Duration::from_secs(30));
        assert_eq!(policy.delay(100), Duration::from_secs(30));
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let mut queue = VecDeque::new();
        for index in 0..=MAX_QUEUED_ENVELOPES {
            enqueue(&mut queue, index.to_string());
        }
        assert_eq!(queue.len(), MAX_QUEUED_ENVELOPES);
        assert_eq!(queue.front().map(String::as_str), Some("1"));
    }

    #[test]
    fn url_validation() {
        assert!(validate_ws_url("ws://127.0.0.1:8080/ws").is_ok());
        assert!(validate_ws_url("wss://deck.example.com/ws").is_ok());
        assert!(validate_ws_url("http://127.0.0.1:8080/ws").is_err());
        assert!(validate_ws_url("::nonsense").is_err());
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn invalid_url_is_never_dialed() {
        let (connector, _servers) = MockConnector::new(&[Outcome::Accept]);
        let manager = ConnectionManager::new(connector, context());
        let error = manager.connect("not a url").err().expect("connect should fail");
        assert!(matches!(error, ConfigError::InvalidUrl { .. }));
        assert_eq!(manager.connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatches_broadcasts_into_store() {
        let (connector, mut servers) = MockConnector::new(&[Outcome::Accept]);
        let manager = ConnectionManager::new(connector, context());
        let store = Arc::clone(&manager.context().store);
        let handle = manager.connect("ws://127.0.0.1:9/ws").expect("valid url");
        let mut signals = handle.signals();

        let server = servers.recv().await.expect("link accepted");
        assert_eq!(next_signal(&mut signals).await, SyncSignal::Connected);
        assert_eq!(store.snapshot().connection.status, ConnectionStatus::Connected);

        let mut rx = store.subscribe();
        server.push(json!({ "type": "executor.created", "payload": { "id": "e1" } }));
        rx.wait_for(|state| !state.executors.items.is_empty()).await.expect("store alive");

        handle.close().await;
        assert_eq!(store.snapshot().connection.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn same_url_shares_one_connection() {
        let (connector, _servers) = MockConnector::new(&[Outcome::Accept]);
        let manager = ConnectionManager::new(connector, context());
        let first = manager.connect("ws://127.0.0.1:9/ws").expect("valid url");
        let second = manager.connect("ws://127.0.0.1:9/ws").expect("valid url");
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        first.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_envelopes_flush_on_open() {
        let (connector, mut servers) = MockConnector::new(&[Outcome::Refuse, Outcome::Accept]);
        let manager = ConnectionManager::new(connector, context());
        let handle = manager.connect("ws://127.0.0.1:9/ws").expect("valid url");

        handle.subscribe_task("t1").expect("open");
        handle.send(Envelope::new("client.ping", json!({}))).expect("open");

        let mut server = servers.recv().await.expect("second attempt accepted");
        assert_eq!(server.next_topic().await, topics::TASK_SUBSCRIBE);
        assert_eq!(server.next_topic().await, "client.ping");
        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_emits_resync_and_resubscribes() {
        let (connector, mut servers) = MockConnector::new(&[Outcome::Accept, Outcome::Accept]);
        let manager = ConnectionManager::new(connector, context());
        let store = Arc::clone(&manager.context().store);
        let handle = manager.connect("ws://127.0.0.1:9/ws").expect("valid url");
        let mut signals = handle.signals();

        let mut first = servers.recv().await.expect("first link");
        assert_eq!(next_signal(&mut signals).await, SyncSignal::Connected);
        handle.subscribe_session("s1").expect("open");
        assert_eq!(first.next_topic().await, topics::SESSION_SUBSCRIBE);

        first.to_client.send(TransportFrame::Closed(Some("server restart".into()))).expect("open");
        assert_eq!(
            next_signal(&mut signals).await,
            SyncSignal::Disconnected { reason: "server restart".into() }
        );

        let mut second = servers.recv().await.expect("second link");
        assert_eq!(second.next_topic().await, topics::SESSION_SUBSCRIBE);
        assert_eq!(next_signal(&mut signals).await, SyncSignal::Connected);
        assert_eq!(next_signal(&mut signals).await, SyncSignal::Resync);
        assert_eq!(store.snapshot().connection.resync_count, 1);

        handle.close().await;
        assert_eq!(next_signal(&mut signals).await, SyncSignal::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (connector, _servers) = MockConnector::new(&[]);
        let manager = ConnectionManager::new(connector, context()).with_reconnect_policy(
            ReconnectPolicy { max_attempts: 3, ..ReconnectPolicy::default() },
        );
        let store = Arc::clone(&manager.context().store);
        let handle = manager.connect("ws://127.0.0.1:9/ws").expect("valid url");
        let mut signals = handle.signals();

        assert_eq!(next_signal(&mut signals).await, SyncSignal::Closed);
        assert_eq!(manager.connector.attempts.load(Ordering::SeqCst), 3);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.connection.status, ConnectionStatus::Failed);
        assert_eq!(snapshot.connection.last_error.as_deref(), Some("failed to connect to ws://127.0.0.1:9/ws: refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_link_keeps_backing_off_until_it_stays_up() {
        let (connector, mut servers) = MockConnector::new(&[Outcome::Accept; 4]);
        let manager = ConnectionManager::new(connector, context());
        let handle = manager.connect("ws://127.0.0.1:9/ws").expect("valid url");
        let policy = ReconnectPolicy::default();

        let mut link = servers.recv().await.expect("first link");
        let mut waits = Vec::new();
        for _ in 0..2 {
            link.to_client.send(TransportFrame::Closed(None)).expect("open");
            let dropped = tokio::time::Instant::now();
            link = servers.recv().await.expect("next link");
            waits.push(dropped.elapsed());
        }
        assert_eq!(waits, [policy.delay(1), policy.delay(2)]);

        tokio::time::sleep(policy.stable_after).await;
        link.to_client.send(TransportFrame::Closed(None)).expect("open");
        let dropped = tokio::time::Instant::now();
        let _last = servers.recv().await.expect("link after a stable one");
        assert_eq!(dropped.elapsed(), policy.delay(0));

        handle.close().await;
    }

    #[test]
    fn envelopes_encode_as_type_and_payload() {
        let frame = encode(&Envelope::new(topics::TASK_SUBSCRIBE, json!({ "task_id": "t1" })));
        assert_eq!(frame.as_deref(), Some(r#"{"type":"task.subscribe","payload":{"task_id":"t1"}}"#));
    }

    #[tokio::test]
    async fn no_handler_fires_after_close() {
        let (connector, mut servers) = MockConnector::new(&[Outcome::Accept]);
        let manager = ConnectionManager::new(connector, context());
        let store = Arc::clone(&manager.context().store);
        let handle = manager.connect("ws://127.0.0.1:9/ws").expect("valid url");
        let server = servers.recv().await.expect("link accepted");

        handle.close().await;
        let _ = server.to_client.send(TransportFrame::Text(
            json!({ "type": "executor.created", "payload": { "id": "e1" } }).to_string(),
        ));
        tokio::task::yield_now().await;
        assert!(store.snapshot().executors.items.is_empty());
        assert!(handle.is_closed());
        assert!(matches!(handle.send(Envelope::new("x.y", Value::Null)), Err(TransportError::Closed)));
    }
}
