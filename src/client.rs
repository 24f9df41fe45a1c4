use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::channel::{Channel, Registry, SharedRegistry};
use crate::config::ReverbConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{ReverbError, Result};
use crate::event::{ErrorReporter, EventHandler, HandlerId, LogReporter};
use crate::transport::WsConnector;
#[cfg(test)]
use crate::transport::Connector;

/// Client for a Laravel Reverb (Pusher protocol v7) server.
///
/// Cheap to clone; clones share the same connection and channel registry.
///
/// ```no_run
/// use reverb_client::{ReverbClient, ReverbConfig};
/// use serde_json::json;
///
/// # async fn run() -> reverb_client::Result<()> {
/// let client = ReverbClient::new(ReverbConfig::new("key", "secret", "reverb.test"))?;
/// client.connect().await?;
///
/// let channel = client.subscribe("orders").await?;
/// channel
///     .bind("order.created", reverb_client::handler(|event| async move {
///         println!("order: {}", event.data);
///         Ok(())
///     }))
///     .await;
///
/// client.listen().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ReverbClient {
    config: ReverbConfig,
    registry: SharedRegistry,
    connection: Connection,
}

impl ReverbClient {
    /// Create a client with the default error-reporting sink.
    pub fn new(config: ReverbConfig) -> Result<Self> {
        Self::with_reporter(config, Arc::new(LogReporter))
    }

    /// Create a client whose handler failures are routed to `reporter`.
    pub fn with_reporter(config: ReverbConfig, reporter: Arc<dyn ErrorReporter>) -> Result<Self> {
        config.validate()?;
        let registry = Registry::shared(reporter);
        let connection = Connection::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::new(WsConnector),
        );
        Ok(Self {
            config,
            registry,
            connection,
        })
    }

    /// Create a client from `REVERB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ReverbConfig::from_env()?)
    }

    #[cfg(test)]
    pub(crate) fn with_connector(config: ReverbConfig, connector: Arc<dyn Connector>) -> Self {
        let registry = Registry::shared(Arc::new(LogReporter));
        let connection = Connection::new(config.clone(), Arc::clone(&registry), connector);
        Self {
            config,
            registry,
            connection,
        }
    }

    pub fn config(&self) -> &ReverbConfig {
        &self.config
    }

    /// Establish the connection. Retries per the reconnect policy before
    /// giving up.
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Gracefully close the connection. The client is terminal afterwards.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        info!("client disconnected");
    }

    /// Connect, run `f`, and disconnect on every exit path.
    pub async fn scope<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(ReverbClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.connect().await?;
        let result = f(self.clone()).await;
        self.disconnect().await;
        result
    }

    /// Block until the connection reaches its terminal state, either via
    /// [`disconnect`](Self::disconnect) or exhausted reconnection attempts.
    pub async fn listen(&self) {
        self.connection.wait_closed().await;
    }

    /// Subscribe to a public or private channel; the kind is derived from
    /// the name prefix. Returns a handle once the server acknowledges.
    pub async fn subscribe(&self, channel_name: &str) -> Result<Channel> {
        self.connection.subscribe(channel_name, None).await?;
        Ok(self.handle(channel_name))
    }

    /// Subscribe to a presence channel with the local user's data
    /// (`{"user_id": ..., "user_info": ...}`).
    pub async fn subscribe_presence(&self, channel_name: &str, user_data: Value) -> Result<Channel> {
        self.connection
            .subscribe(channel_name, Some(user_data))
            .await?;
        Ok(self.handle(channel_name))
    }

    /// Unsubscribe and drop the channel.
    pub async fn unsubscribe(&self, channel_name: &str) -> Result<()> {
        self.connection.unsubscribe(channel_name).await
    }

    /// Bind a client-level handler; it observes events from every channel.
    /// `"*"` receives everything, including protocol-internal events.
    pub async fn bind(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.registry.lock().await.bind_global(event, handler)
    }

    /// Remove one client-level handler registration.
    pub async fn unbind(&self, event: &str, id: HandlerId) -> bool {
        self.registry.lock().await.unbind_global(event, id)
    }

    /// Remove every client-level handler for the event.
    pub async fn unbind_all(&self, event: &str) {
        self.registry.lock().await.unbind_global_all(event);
    }

    /// Trigger a client event on a subscribed private/presence channel.
    pub async fn trigger(&self, channel_name: &str, event: &str, data: Value) -> Result<()> {
        self.connection.trigger(channel_name, event, data).await
    }

    /// Register a callback for connection loss. It receives the terminal
    /// error when reconnection was exhausted, `None` otherwise.
    pub fn on_disconnect<F, Fut>(&self, hook: F)
    where
        F: Fn(Option<ReverbError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connection
            .set_on_disconnect(Arc::new(move |err| Box::pin(hook(err))));
    }

    /// The server-assigned socket identity, present while connected.
    pub fn socket_id(&self) -> Option<String> {
        self.connection.socket_id()
    }

    /// True iff the state machine is Connected and the live socket is open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Names of the known channels, in subscription order.
    pub async fn channels(&self) -> Vec<String> {
        self.registry.lock().await.snapshot_names()
    }

    /// Handle to a channel previously created by subscribe.
    pub async fn channel(&self, name: &str) -> Option<Channel> {
        if self.registry.lock().await.contains(name) {
            Some(self.handle(name))
        } else {
            None
        }
    }

    fn handle(&self, name: &str) -> Channel {
        Channel::new(name, Arc::clone(&self.registry), self.connection.clone())
    }
}
