use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::error;

use crate::error::{ReverbError, Result};

/// Event name that matches every event on its scope.
pub const WILDCARD: &str = "*";

/// Event name under which server errors are delivered to global handlers.
pub const ERROR_EVENT: &str = "error";

/// An event as seen by user handlers: name, decoded payload, and the channel
/// it arrived on (if any).
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub data: Value,
    pub channel: Option<String>,
}

/// Identifier returned by `bind`, used to remove that handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A registered event handler.
///
/// Handlers are held by reference; dropping the registration via `unbind`
/// (or shutting the client down) releases them.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub id: HandlerId,
    pub callback: EventHandler,
}

/// Sink consulted when a user handler returns an error.
///
/// The default logs and continues; replace it to route handler failures
/// elsewhere. Handler errors never abort dispatch.
pub trait ErrorReporter: Send + Sync {
    fn handler_error(&self, event: &str, channel: Option<&str>, error: &ReverbError);
}

/// Default sink: log through `tracing` and carry on.
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn handler_error(&self, event: &str, channel: Option<&str>, err: &ReverbError) {
        match channel {
            Some(channel) => error!("handler error for '{event}' on '{channel}': {err}"),
            None => error!("handler error for '{event}': {err}"),
        }
    }
}
