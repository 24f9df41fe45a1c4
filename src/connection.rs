use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::auth::Authenticator;
use crate::channel::{self, ChannelKind, SharedRegistry};
use crate::config::ReverbConfig;
use crate::error::{ReverbError, Result};
use crate::event::ERROR_EVENT;
use crate::message::{self, events, Message};
use crate::transport::{Connector, Incoming, Session, TransportSink, TransportStatus};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const JITTER_FRACTION: f64 = 0.25;
const OUTBOUND_QUEUE: usize = 64;

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { socket_id: String },
    Reconnecting { attempt: u32 },
    Closing,
    /// Terminal: explicit disconnect or exhausted reconnection.
    Closed,
}

/// Callback invoked when the connection is lost. Receives the terminal error
/// when reconnection was exhausted, `None` for an ordinary loss.
pub type DisconnectHook = Arc<dyn Fn(Option<ReverbError>) -> BoxFuture<'static, ()> + Send + Sync>;

enum SessionEnd {
    Shutdown,
    Lost { expected: bool },
}

struct ConnectionInner {
    config: ReverbConfig,
    connector: Arc<dyn Connector>,
    registry: SharedRegistry,
    signer: Authenticator,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    socket_id: StdMutex<Option<String>>,
    transport_status: StdMutex<Option<TransportStatus>>,
    outbound_tx: StdMutex<Option<mpsc::Sender<Message>>>,
    waiters: StdMutex<HashMap<String, oneshot::Sender<Result<()>>>>,
    on_disconnect: StdMutex<Option<DisconnectHook>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

/// Connection controller: owns the transport session, the receive and
/// keepalive loops, and the reconnect supervisor.
#[derive(Clone)]
pub(crate) struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        config: ReverbConfig,
        registry: SharedRegistry,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let signer = Authenticator::new(&config.app_key, &config.app_secret);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                connector,
                registry,
                signer,
                state_tx,
                shutdown_tx,
                socket_id: StdMutex::new(None),
                transport_status: StdMutex::new(None),
                outbound_tx: StdMutex::new(None),
                waiters: StdMutex::new(HashMap::new()),
                on_disconnect: StdMutex::new(None),
                task: StdMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn socket_id(&self) -> Option<String> {
        self.inner.socket_id.lock().unwrap().clone()
    }

    /// Connected means the state machine says so AND the live socket agrees.
    pub fn is_connected(&self) -> bool {
        let state_connected = matches!(
            &*self.inner.state_tx.borrow(),
            ConnectionState::Connected { .. }
        );
        let socket_open = self
            .inner
            .transport_status
            .lock()
            .unwrap()
            .as_ref()
            .map(TransportStatus::is_open)
            .unwrap_or(false);
        state_connected && socket_open
    }

    pub fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self.inner.on_disconnect.lock().unwrap() = Some(hook);
    }

    /// Establish the connection, retrying per the reconnect policy, and
    /// start the receive/keepalive loops.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closed => {
                return Err(ReverbError::Precondition(
                    "connection is closed; create a new client".into(),
                ))
            }
            ConnectionState::Disconnected => {}
            other => {
                debug!("connect ignored in state {other:?}");
                return Ok(());
            }
        }

        set_state(&self.inner, ConnectionState::Connecting);

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let config = &self.inner.config;
        let mut attempt: u32 = 0;

        let (session, activity_timeout) = loop {
            match establish(&self.inner).await {
                Ok(established) => break established,
                Err(e) => {
                    if !config.reconnect_enabled {
                        set_state(&self.inner, ConnectionState::Disconnected);
                        return Err(e);
                    }
                    attempt += 1;
                    if let Some(max) = config.reconnect_max_attempts {
                        if attempt >= max {
                            set_state(&self.inner, ConnectionState::Closed);
                            return Err(ReverbError::Connection(format!(
                                "failed to connect after {attempt} attempt(s): {e}"
                            )));
                        }
                    }
                    let delay = backoff_delay(config, attempt - 1);
                    warn!(
                        "connect attempt {attempt} failed, retrying in {:.1}s: {e}",
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {
                            set_state(&self.inner, ConnectionState::Closed);
                            return Err(ReverbError::Connection("disconnected while connecting".into()));
                        }
                    }
                }
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        *self.inner.outbound_tx.lock().unwrap() = Some(outbound_tx);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            drive(inner, session, outbound_rx, shutdown_rx, activity_timeout).await;
        });
        *self.inner.task.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Gracefully close the connection and stop all internal loops.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        set_state(&self.inner, ConnectionState::Closing);
        let _ = self.inner.shutdown_tx.send(true);

        let handle = self.inner.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        reject_waiters(&self.inner, "client disconnected");
        *self.inner.outbound_tx.lock().unwrap() = None;
        *self.inner.socket_id.lock().unwrap() = None;
        *self.inner.transport_status.lock().unwrap() = None;
        set_state(&self.inner, ConnectionState::Closed);
    }

    /// Resolves once the connection reaches its terminal state.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Subscribe to a channel, waiting for the server acknowledgement.
    pub async fn subscribe(&self, name: &str, user_data: Option<Value>) -> Result<()> {
        let socket_id = self.socket_id().ok_or_else(|| {
            ReverbError::Precondition("cannot subscribe before the connection is established".into())
        })?;

        let user_data = {
            let mut registry = self.inner.registry.lock().await;
            let state = registry.get_or_create(name, user_data);
            if state.subscribed {
                debug!("already subscribed to {name}");
                return Ok(());
            }
            state.user_data.clone()
        };

        let envelope = build_subscribe(&self.inner.signer, &socket_id, name, user_data.as_ref())?;

        let rx = {
            let mut waiters = self.inner.waiters.lock().unwrap();
            if waiters.contains_key(name) {
                return Err(ReverbError::Precondition(format!(
                    "subscription to {name} is already pending"
                )));
            }
            let (tx, rx) = oneshot::channel();
            waiters.insert(name.to_string(), tx);
            rx
        };

        if let Err(e) = self.send(envelope).await {
            self.inner.waiters.lock().unwrap().remove(name);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.subscription_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReverbError::Connection(
                "connection lost while subscribing".into(),
            )),
            Err(_) => {
                // Leave the channel registered but unsubscribed so a later
                // reconnect retries it.
                self.inner.waiters.lock().unwrap().remove(name);
                Err(ReverbError::Timeout(format!(
                    "subscription to {name} was not acknowledged"
                )))
            }
        }
    }

    /// Unsubscribe and drop the channel, regardless of whether the server
    /// acknowledges.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        let _ = self.send(message::unsubscribe(name)).await;
        self.inner.registry.lock().await.remove(name);
        Ok(())
    }

    /// Trigger a client event. Private/presence channels only, and only once
    /// subscribed.
    pub async fn trigger(&self, channel_name: &str, event: &str, data: Value) -> Result<()> {
        {
            let registry = self.inner.registry.lock().await;
            let state = registry.get(channel_name).ok_or_else(|| {
                ReverbError::Precondition(format!("unknown channel {channel_name}"))
            })?;
            if !state.kind.requires_auth() {
                return Err(ReverbError::Precondition(format!(
                    "client events are only permitted on private or presence channels, \
                     {channel_name} is public"
                )));
            }
            if !state.subscribed {
                return Err(ReverbError::Precondition(format!(
                    "cannot trigger on unsubscribed channel {channel_name}"
                )));
            }
        }
        self.send(message::client_event(channel_name, event, data))
            .await
    }

    async fn send(&self, msg: Message) -> Result<()> {
        let tx = self
            .inner
            .outbound_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ReverbError::Connection("not connected".into()))?;
        tx.send(msg)
            .await
            .map_err(|_| ReverbError::Connection("connection closed".into()))
    }
}

/// Backoff for the given attempt: `min(base * multiplier^attempt, max)`
/// scaled by a jitter factor in `[1, 1 + JITTER_FRACTION]`.
pub(crate) fn backoff_delay(config: &ReverbConfig, attempt: u32) -> Duration {
    let base = config.reconnect_delay_min.as_secs_f64();
    let max = config.reconnect_delay_max.as_secs_f64();
    let nominal = (base * config.reconnect_multiplier.powi(attempt as i32)).min(max);
    let jitter = 1.0 + rand::random::<f64>() * JITTER_FRACTION;
    Duration::from_secs_f64(nominal * jitter)
}

fn set_state(inner: &ConnectionInner, new_state: ConnectionState) {
    inner.state_tx.send_if_modified(|state| {
        if *state == new_state {
            return false;
        }
        info!("connection state: {state:?} -> {new_state:?}");
        *state = new_state;
        true
    });
}

fn reject_waiters(inner: &ConnectionInner, reason: &str) {
    let drained: Vec<_> = inner.waiters.lock().unwrap().drain().collect();
    for (name, tx) in drained {
        debug!("rejecting pending subscription to {name}");
        let _ = tx.send(Err(ReverbError::Connection(reason.to_string())));
    }
}

fn resolve_waiter(inner: &ConnectionInner, name: &str, result: Result<()>) {
    if let Some(tx) = inner.waiters.lock().unwrap().remove(name) {
        let _ = tx.send(result);
    }
}

fn build_subscribe(
    signer: &Authenticator,
    socket_id: &str,
    name: &str,
    user_data: Option<&Value>,
) -> Result<Message> {
    match ChannelKind::of(name) {
        ChannelKind::Public => Ok(message::subscribe(name, None, None)),
        ChannelKind::Private => {
            let auth = signer.sign_private(socket_id, name)?;
            Ok(message::subscribe(name, Some(auth), None))
        }
        ChannelKind::Presence => {
            let user_data = user_data.ok_or_else(|| {
                ReverbError::Configuration(format!("presence channel {name} requires user_data"))
            })?;
            let (auth, channel_data) = signer.sign_presence(socket_id, name, user_data)?;
            Ok(message::subscribe(name, Some(auth), Some(channel_data)))
        }
    }
}

/// Open the socket and perform the handshake: exactly one envelope is
/// awaited and it must be `pusher:connection_established`.
async fn establish(inner: &Arc<ConnectionInner>) -> Result<(Session, Option<u64>)> {
    let url = inner.config.build_url();
    info!("connecting to {}://{}:{}", inner.config.scheme, inner.config.host, inner.config.port);

    let mut session = inner.connector.connect(&url).await?;

    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, session.stream.recv()).await {
        Ok(result) => result?,
        Err(_) => {
            session.sink.close().await;
            return Err(ReverbError::Protocol(
                "no connection_established within the handshake deadline".into(),
            ));
        }
    };

    let text = match first {
        Incoming::Text(text) => text,
        Incoming::Closed { code, reason } => {
            return Err(ReverbError::Connection(format!(
                "socket closed during handshake (code {code:?}): {reason}"
            )))
        }
    };

    let msg = Message::from_wire(&text)?;
    if msg.event != events::CONNECTION_ESTABLISHED {
        session.sink.close().await;
        return Err(ReverbError::Protocol(format!(
            "expected connection_established, got {}",
            msg.event
        )));
    }

    let socket_id = msg
        .data
        .get("socket_id")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ReverbError::Protocol("connection_established is missing socket_id".into())
        })?
        .to_string();
    let activity_timeout = msg.data.get("activity_timeout").and_then(Value::as_u64);

    info!("connected with socket_id {socket_id}");
    *inner.socket_id.lock().unwrap() = Some(socket_id.clone());
    *inner.transport_status.lock().unwrap() = Some(session.status.clone());
    set_state(inner, ConnectionState::Connected { socket_id });

    Ok((session, activity_timeout))
}

/// Supervisor: runs sessions and reconnects between them until shutdown or
/// exhaustion.
async fn drive(
    inner: Arc<ConnectionInner>,
    mut session: Session,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut activity_timeout: Option<u64>,
) {
    loop {
        let end = run_session(
            &inner,
            &mut session,
            &mut outbound_rx,
            &mut shutdown_rx,
            activity_timeout,
        )
        .await;

        match end {
            SessionEnd::Shutdown => {
                session.sink.close().await;
                reject_waiters(&inner, "client disconnected");
                return;
            }
            SessionEnd::Lost { expected } => {
                session.sink.close().await;
                handle_connection_lost(&inner, expected).await;
                if !inner.config.reconnect_enabled {
                    // With reconnection off a loss is terminal, so listeners
                    // waiting for Closed are released.
                    set_state(&inner, ConnectionState::Closed);
                    return;
                }
                match reconnect(&inner, &mut shutdown_rx).await {
                    Some((new_session, new_activity)) => {
                        session = new_session;
                        activity_timeout = new_activity;
                    }
                    None => return,
                }
            }
        }
    }
}

/// One session's receive + keepalive loop. The driver task is the single
/// writer: queued outbound envelopes, pongs, and keepalive pings all go out
/// from here.
async fn run_session(
    inner: &Arc<ConnectionInner>,
    session: &mut Session,
    outbound_rx: &mut mpsc::Receiver<Message>,
    shutdown_rx: &mut watch::Receiver<bool>,
    activity_timeout: Option<u64>,
) -> SessionEnd {
    let sink = &mut session.sink;
    let stream = &mut session.stream;
    let status = &session.status;

    let ping_interval = effective_ping_interval(&inner.config, activity_timeout);
    let mut last_rx = Instant::now();
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            Some(msg) = outbound_rx.recv() => {
                let wire = match msg.to_wire() {
                    Ok(wire) => wire,
                    Err(e) => {
                        warn!("dropping unencodable outbound envelope: {e}");
                        continue;
                    }
                };
                trace!("sending {}", msg.event);
                if sink.send(wire).await.is_err() {
                    return SessionEnd::Lost { expected: false };
                }
            }

            incoming = stream.recv() => {
                match incoming {
                    Ok(Incoming::Text(text)) => {
                        last_rx = Instant::now();
                        handle_frame(inner, sink, &text).await;
                    }
                    Ok(closed @ Incoming::Closed { .. }) => {
                        let expected = closed.is_clean_close();
                        if let Incoming::Closed { code, reason } = closed {
                            info!("socket closed by peer (code {code:?}): {reason}");
                        }
                        return SessionEnd::Lost { expected };
                    }
                    Err(e) => {
                        warn!("transport error: {e}");
                        return SessionEnd::Lost { expected: false };
                    }
                }
            }

            _ = ticker.tick() => {
                let idle = last_rx.elapsed();
                if idle >= ping_interval * 2 {
                    warn!(
                        "no traffic for {:.1}s, treating socket as half-open",
                        idle.as_secs_f64()
                    );
                    status.set_closed();
                    return SessionEnd::Lost { expected: false };
                }
                if idle >= ping_interval {
                    let Ok(wire) = message::ping().to_wire() else { continue };
                    if sink.send(wire).await.is_err() {
                        return SessionEnd::Lost { expected: false };
                    }
                }
            }

            _ = shutdown_rx.changed() => {
                return SessionEnd::Shutdown;
            }
        }
    }
}

fn effective_ping_interval(config: &ReverbConfig, activity_timeout: Option<u64>) -> Duration {
    match activity_timeout {
        Some(secs) if secs > 0 => config.ping_interval.min(Duration::from_secs(secs)),
        _ => config.ping_interval,
    }
}

async fn handle_frame(inner: &Arc<ConnectionInner>, sink: &mut Box<dyn TransportSink>, text: &str) {
    let msg = match Message::from_wire(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("discarding malformed frame: {e}");
            return;
        }
    };

    match msg.event.as_str() {
        events::PING => {
            let Ok(wire) = message::pong().to_wire() else { return };
            if sink.send(wire).await.is_err() {
                warn!("failed to answer ping");
            }
        }
        events::PONG => {
            trace!("pong received");
        }
        events::ERROR => {
            handle_server_error(inner, &msg).await;
        }
        events::SUBSCRIPTION_ERROR => {
            if let Some(name) = msg.channel.clone() {
                let (code, text) = error_details(&msg.data);
                resolve_waiter(inner, &name, Err(classify_rejection(code, &text)));
            }
            channel::dispatch(&inner.registry, &msg).await;
        }
        events::CONNECTION_ESTABLISHED => {
            debug!("ignoring connection_established outside the handshake");
        }
        events::SUBSCRIPTION_SUCCEEDED => {
            // The registry marks the channel subscribed (and seeds presence
            // state) before user handlers or the waiter observe it.
            channel::dispatch(&inner.registry, &msg).await;
            if let Some(name) = &msg.channel {
                resolve_waiter(inner, name, Ok(()));
            }
        }
        _ => {
            channel::dispatch(&inner.registry, &msg).await;
        }
    }
}

/// `pusher:error` rejects a pending subscribe it names; otherwise it is
/// delivered to global handlers as an `error` event and never closes the
/// connection.
async fn handle_server_error(inner: &Arc<ConnectionInner>, msg: &Message) {
    let (code, text) = error_details(&msg.data);
    warn!("server error (code {code:?}): {text}");

    let pending = {
        let waiters = inner.waiters.lock().unwrap();
        waiters.keys().find(|name| text.contains(name.as_str())).cloned()
    };
    if let Some(name) = pending {
        resolve_waiter(inner, &name, Err(classify_rejection(code, &text)));
        return;
    }

    let error_event = Message {
        event: ERROR_EVENT.to_string(),
        channel: None,
        data: msg.data.clone(),
    };
    channel::dispatch(&inner.registry, &error_event).await;
}

fn error_details(data: &Value) -> (Option<u64>, String) {
    let code = data.get("code").and_then(Value::as_u64);
    let text = data
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string());
    (code, text)
}

fn classify_rejection(code: Option<u64>, text: &str) -> ReverbError {
    let lower = text.to_lowercase();
    if code == Some(4009) || lower.contains("auth") || lower.contains("signature") {
        ReverbError::Authentication(text.to_string())
    } else {
        ReverbError::Subscription(text.to_string())
    }
}

/// Converge every termination path on one routine so the registry is left
/// consistent regardless of how the transport signaled closure.
async fn handle_connection_lost(inner: &Arc<ConnectionInner>, expected: bool) {
    if expected {
        info!("connection closed cleanly by peer");
    } else {
        warn!("connection lost");
    }

    let next = if inner.config.reconnect_enabled {
        ConnectionState::Reconnecting { attempt: 0 }
    } else {
        ConnectionState::Disconnected
    };
    set_state(inner, next);

    *inner.socket_id.lock().unwrap() = None;
    inner.registry.lock().await.mark_all_unsubscribed();
    reject_waiters(inner, "connection lost");

    let hook = inner.on_disconnect.lock().unwrap().clone();
    if let Some(hook) = hook {
        hook(None).await;
    }
}

/// Reconnect with bounded backoff. Returns the new session, or `None` when
/// shut down or out of attempts.
async fn reconnect(
    inner: &Arc<ConnectionInner>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<(Session, Option<u64>)> {
    let config = &inner.config;
    let mut attempt: u32 = 0;

    loop {
        if let Some(max) = config.reconnect_max_attempts {
            if attempt >= max {
                warn!("giving up after {attempt} reconnect attempt(s)");
                set_state(inner, ConnectionState::Closed);
                let hook = inner.on_disconnect.lock().unwrap().clone();
                if let Some(hook) = hook {
                    hook(Some(ReverbError::Connection(format!(
                        "reconnection exhausted after {attempt} attempt(s)"
                    ))))
                    .await;
                }
                return None;
            }
        }

        set_state(inner, ConnectionState::Reconnecting { attempt });
        let delay = backoff_delay(config, attempt);
        info!(
            "reconnect attempt {} in {:.1}s",
            attempt + 1,
            delay.as_secs_f64()
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return None,
        }
        if *shutdown_rx.borrow() {
            return None;
        }

        match establish(inner).await {
            Ok((mut session, activity_timeout)) => {
                info!("reconnected after {} attempt(s)", attempt + 1);
                if let Err(e) = resubscribe_all(inner, &mut session.sink).await {
                    warn!("re-subscription failed, retrying connection: {e}");
                    session.sink.close().await;
                    attempt += 1;
                    continue;
                }
                return Some((session, activity_timeout));
            }
            Err(e) => {
                warn!("reconnect attempt {} failed: {e}", attempt + 1);
                attempt += 1;
            }
        }
    }
}

/// Re-issue a subscribe for every channel the registry knows, in the order
/// they were first created.
async fn resubscribe_all(
    inner: &Arc<ConnectionInner>,
    sink: &mut Box<dyn TransportSink>,
) -> Result<()> {
    let socket_id = inner
        .socket_id
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| ReverbError::Connection("no socket id after reconnect".into()))?;

    let names = inner.registry.lock().await.snapshot_names();
    for name in names {
        let user_data = inner.registry.lock().await.user_data(&name);
        let envelope = build_subscribe(&inner.signer, &socket_id, &name, user_data.as_ref())?;
        info!("re-subscribing to {name}");
        sink.send(envelope.to_wire()?).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Registry;
    use crate::event::{handler, Event, LogReporter};
    use crate::transport::testing::{MockConnector, MockRemote};
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;

    fn test_config() -> ReverbConfig {
        let mut config = ReverbConfig::new("abc", "s3cret", "reverb.test");
        config.reconnect_delay_min = Duration::from_millis(10);
        config.reconnect_delay_max = Duration::from_millis(40);
        config.subscription_timeout = Duration::from_millis(300);
        config
    }

    fn setup(config: ReverbConfig, sessions: usize) -> (Connection, Vec<MockRemote>) {
        let (connector, remotes) = MockConnector::script(sessions);
        let registry = Registry::shared(Arc::new(LogReporter));
        (Connection::new(config, registry, connector), remotes)
    }

    fn handshake(remote: &MockRemote, socket_id: &str) {
        remote.push_text(&format!(
            r#"{{"event":"pusher:connection_established","data":"{{\"socket_id\":\"{socket_id}\",\"activity_timeout\":30}}"}}"#
        ));
    }

    fn succeeded(remote: &MockRemote, channel: &str) {
        remote.push_text(&format!(
            r#"{{"event":"pusher_internal:subscription_succeeded","channel":"{channel}","data":"{{}}"}}"#
        ));
    }

    fn expected_hmac(secret: &str, message: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn handshake_captures_socket_id() {
        let (connection, remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "416200246.685575608");

        connection.connect().await.unwrap();

        assert_eq!(
            connection.socket_id().as_deref(),
            Some("416200246.685575608")
        );
        assert!(connection.is_connected());
        assert!(matches!(
            connection.state(),
            ConnectionState::Connected { .. }
        ));

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn handshake_rejects_unexpected_first_envelope() {
        let mut config = test_config();
        config.reconnect_enabled = false;
        let (connection, remotes) = setup(config, 1);
        remotes[0].push_text(r#"{"event":"pusher:ping","data":"{}"}"#);

        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err, ReverbError::Protocol(_)));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn server_ping_is_answered_with_pong() {
        let (connection, mut remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "1.1");
        connection.connect().await.unwrap();

        remotes[0].push_text(r#"{"event":"pusher:ping","data":"{}"}"#);
        let sent = remotes[0].expect_sent().await;
        assert_eq!(sent.event, "pusher:pong");

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn private_subscribe_carries_admission_token() {
        let (connection, mut remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "1.2");
        connection.connect().await.unwrap();

        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.subscribe("private-room.7", None).await })
        };

        let sent = remotes[0].expect_sent().await;
        assert_eq!(sent.event, "pusher:subscribe");
        assert_eq!(sent.data["channel"], "private-room.7");
        let expected = format!("abc:{}", expected_hmac("s3cret", "1.2:private-room.7"));
        assert_eq!(sent.data["auth"], expected.as_str());

        succeeded(&remotes[0], "private-room.7");
        task.await.unwrap().unwrap();

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn presence_subscribe_signs_channel_data_bytes() {
        let (connection, mut remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "1.2");
        connection.connect().await.unwrap();

        let user_data = json!({"user_id": "u1", "user_info": {"name": "alice"}});
        let task = {
            let connection = connection.clone();
            tokio::spawn(async move {
                connection
                    .subscribe("presence-chat.1", Some(user_data))
                    .await
            })
        };

        let sent = remotes[0].expect_sent().await;
        let channel_data = sent.data["channel_data"].as_str().unwrap();
        assert_eq!(
            channel_data,
            r#"{"user_id":"u1","user_info":{"name":"alice"}}"#
        );
        let expected = format!(
            "abc:{}",
            expected_hmac("s3cret", &format!("1.2:presence-chat.1:{channel_data}"))
        );
        assert_eq!(sent.data["auth"], expected.as_str());

        succeeded(&remotes[0], "presence-chat.1");
        task.await.unwrap().unwrap();

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn presence_subscribe_without_user_data_is_rejected() {
        let (connection, remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "1.2");
        connection.connect().await.unwrap();

        let err = connection
            .subscribe("presence-chat.1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReverbError::Configuration(_)));

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn subscribe_before_connect_is_a_precondition_error() {
        let (connection, _remotes) = setup(test_config(), 1);
        let err = connection.subscribe("orders", None).await.unwrap_err();
        assert!(matches!(err, ReverbError::Precondition(_)));
    }

    #[tokio::test]
    async fn subscribe_times_out_but_keeps_the_channel() {
        let mut config = test_config();
        config.subscription_timeout = Duration::from_millis(50);
        let (connection, mut remotes) = setup(config, 1);
        handshake(&remotes[0], "1.3");
        connection.connect().await.unwrap();

        let err = connection.subscribe("orders", None).await.unwrap_err();
        assert!(matches!(err, ReverbError::Timeout(_)));

        // The subscribe frame went out and the channel stayed registered.
        let sent = remotes[0].expect_sent().await;
        assert_eq!(sent.event, "pusher:subscribe");
        {
            let registry = connection.inner.registry.lock().await;
            let state = registry.get("orders").unwrap();
            assert!(!state.subscribed);
        }

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn auth_rejection_fails_the_waiter() {
        let (connection, mut remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "1.4");
        connection.connect().await.unwrap();

        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.subscribe("private-vault", None).await })
        };
        let _ = remotes[0].expect_sent().await;

        remotes[0].push_text(
            r#"{"event":"pusher:error","data":"{\"code\":4009,\"message\":\"auth rejected for private-vault\"}"}"#,
        );
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ReverbError::Authentication(_)));

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn server_error_outside_subscribe_becomes_an_error_event() {
        let (connection, remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "1.5");
        connection.connect().await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            connection.inner.registry.lock().await.bind_global(
                ERROR_EVENT,
                handler(move |event: Event| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(event.data);
                        Ok(())
                    }
                }),
            );
        }

        remotes[0].push_text(
            r#"{"event":"pusher:error","data":"{\"code\":4201,\"message\":\"pong reply not received\"}"}"#,
        );

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !seen.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("error event was never dispatched");

        assert_eq!(seen.lock().unwrap()[0]["code"], 4201);
        // The connection stays up.
        assert!(connection.is_connected());

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn trigger_on_public_channel_sends_nothing() {
        let (connection, mut remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "1.6");
        connection.connect().await.unwrap();

        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.subscribe("chat", None).await })
        };
        let _ = remotes[0].expect_sent().await;
        succeeded(&remotes[0], "chat");
        task.await.unwrap().unwrap();

        let err = connection
            .trigger("chat", "typing", json!({"on": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, ReverbError::Precondition(_)));
        assert!(remotes[0].nothing_sent());

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn trigger_prefixes_client_events() {
        let (connection, mut remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "1.7");
        connection.connect().await.unwrap();

        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.subscribe("private-room", None).await })
        };
        let _ = remotes[0].expect_sent().await;
        succeeded(&remotes[0], "private-room");
        task.await.unwrap().unwrap();

        connection
            .trigger("private-room", "typing", json!({"on": true}))
            .await
            .unwrap();
        let sent = remotes[0].expect_sent().await;
        assert_eq!(sent.event, "client-typing");
        assert_eq!(sent.channel.as_deref(), Some("private-room"));

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn unsubscribe_always_drops_the_channel() {
        let (connection, mut remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "1.8");
        connection.connect().await.unwrap();

        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.subscribe("orders", None).await })
        };
        let subscribe_frame = remotes[0].expect_sent().await;
        assert_eq!(subscribe_frame.event, "pusher:subscribe");
        succeeded(&remotes[0], "orders");
        task.await.unwrap().unwrap();

        connection.unsubscribe("orders").await.unwrap();
        let unsubscribe_frame = remotes[0].expect_sent().await;
        assert_eq!(unsubscribe_frame.event, "pusher:unsubscribe");
        assert_eq!(unsubscribe_frame.data["channel"], "orders");

        assert!(!connection.inner.registry.lock().await.contains("orders"));
        // Exactly one subscribe and one unsubscribe went out.
        assert!(remotes[0].nothing_sent());

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn reconnect_resubscribes_known_channels() {
        let (connection, mut remotes) = setup(test_config(), 2);
        handshake(&remotes[0], "1.9");
        handshake(&remotes[1], "2.0");
        connection.connect().await.unwrap();

        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.subscribe("orders", None).await })
        };
        let _ = remotes[0].expect_sent().await;
        succeeded(&remotes[0], "orders");
        task.await.unwrap().unwrap();

        // Unclean close: the supervisor reconnects and re-subscribes.
        remotes[0].push_close(1006);

        let resubscribe = remotes[1].expect_sent().await;
        assert_eq!(resubscribe.event, "pusher:subscribe");
        assert_eq!(resubscribe.data["channel"], "orders");
        assert_eq!(connection.socket_id().as_deref(), Some("2.0"));

        // The registry flags the channel unsubscribed until the new ack.
        {
            let registry = connection.inner.registry.lock().await;
            assert!(!registry.get("orders").unwrap().subscribed);
        }
        succeeded(&remotes[1], "orders");
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if connection.inner.registry.lock().await.get("orders").unwrap().subscribed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("channel never re-subscribed");

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn pending_subscribe_rejects_on_connection_loss() {
        let mut config = test_config();
        config.reconnect_enabled = false;
        let (connection, mut remotes) = setup(config, 1);
        handshake(&remotes[0], "3.0");
        connection.connect().await.unwrap();

        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.subscribe("orders", None).await })
        };
        let _ = remotes[0].expect_sent().await;

        remotes[0].push_close(1006);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ReverbError::Connection(_)));

        // With reconnection disabled the loss is terminal.
        tokio::time::timeout(Duration::from_secs(1), connection.wait_closed())
            .await
            .expect("loss with reconnection disabled should close");
    }

    #[tokio::test]
    async fn keepalive_pings_then_forces_reconnect() {
        let mut config = test_config();
        config.reconnect_enabled = false;
        config.ping_interval = Duration::from_millis(40);
        let (connection, mut remotes) = setup(config, 1);
        handshake(&remotes[0], "4.0");
        connection.connect().await.unwrap();

        // Nothing received in one interval: a ping goes out.
        let sent = remotes[0].expect_sent().await;
        assert_eq!(sent.event, "pusher:ping");

        // Still nothing in two intervals: the socket is treated as half-open.
        tokio::time::timeout(Duration::from_secs(1), connection.wait_closed())
            .await
            .expect("half-open socket was never detected");

        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn clean_close_still_marks_channels_unsubscribed() {
        let mut config = test_config();
        config.reconnect_enabled = false;
        let (connection, mut remotes) = setup(config, 1);
        handshake(&remotes[0], "5.0");
        connection.connect().await.unwrap();

        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.subscribe("orders", None).await })
        };
        let _ = remotes[0].expect_sent().await;
        succeeded(&remotes[0], "orders");
        task.await.unwrap().unwrap();

        remotes[0].push_close(1000);
        tokio::time::timeout(Duration::from_secs(1), connection.wait_closed())
            .await
            .expect("clean close was not observed");

        let registry = connection.inner.registry.lock().await;
        assert!(!registry.get("orders").unwrap().subscribed);
    }

    #[tokio::test]
    async fn disconnect_reaches_terminal_state() {
        let (connection, remotes) = setup(test_config(), 1);
        handshake(&remotes[0], "6.0");
        connection.connect().await.unwrap();

        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.is_connected());

        tokio::time::timeout(Duration::from_millis(100), connection.wait_closed())
            .await
            .expect("wait_closed should resolve immediately");

        // Closed is terminal.
        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err, ReverbError::Precondition(_)));
    }

    #[tokio::test]
    async fn on_disconnect_hook_fires_on_loss() {
        let mut config = test_config();
        config.reconnect_enabled = false;
        let (connection, remotes) = setup(config, 1);
        handshake(&remotes[0], "7.0");

        let fired = Arc::new(StdMutex::new(0u32));
        {
            let fired = Arc::clone(&fired);
            connection.set_on_disconnect(Arc::new(move |_err| {
                let fired = Arc::clone(&fired);
                Box::pin(async move {
                    *fired.lock().unwrap() += 1;
                })
            }));
        }

        connection.connect().await.unwrap();
        remotes[0].push_close(1006);

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if *fired.lock().unwrap() > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("disconnect hook never fired");
    }

    #[test]
    fn backoff_follows_the_nominal_ladder_with_bounded_jitter() {
        let config = ReverbConfig::new("k", "s", "h");
        let nominal = [1.0, 2.0, 4.0, 8.0, 16.0, 30.0, 30.0];
        let mut previous = 0.0f64;
        for (attempt, &expected) in nominal.iter().enumerate() {
            let delay = backoff_delay(&config, attempt as u32).as_secs_f64();
            assert!(delay >= expected, "attempt {attempt}: {delay} < {expected}");
            assert!(
                delay <= expected * (1.0 + JITTER_FRACTION) + f64::EPSILON,
                "attempt {attempt}: {delay} above jitter bound"
            );
            assert!(expected >= previous, "nominal ladder must not decrease");
            previous = expected;
        }
    }

    #[test]
    fn backoff_respects_the_cap() {
        let config = ReverbConfig::new("k", "s", "h");
        let delay = backoff_delay(&config, 30).as_secs_f64();
        assert!(delay <= 30.0 * (1.0 + JITTER_FRACTION));
    }
}
