use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::Connection;
use crate::error::Result;
use crate::event::{ErrorReporter, Event, EventHandler, HandlerEntry, HandlerId, WILDCARD};
use crate::message::{events, Message};

/// Channel kind, derived from the name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    /// Derive the kind from a channel name.
    pub fn of(name: &str) -> Self {
        if name.starts_with("presence-") {
            ChannelKind::Presence
        } else if name.starts_with("private-") {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    /// Whether subscription requires an admission token.
    pub fn requires_auth(&self) -> bool {
        matches!(self, ChannelKind::Private | ChannelKind::Presence)
    }
}

/// The local user's presence record.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMember {
    pub user_id: String,
    pub user_info: Value,
}

/// Per-channel state held by the registry.
pub(crate) struct ChannelState {
    pub kind: ChannelKind,
    pub subscribed: bool,
    pub user_data: Option<Value>,
    pub handlers: HashMap<String, Vec<HandlerEntry>>,
    pub members: HashMap<String, Value>,
    pub me: Option<PresenceMember>,
}

impl ChannelState {
    fn new(name: &str, user_data: Option<Value>) -> Self {
        Self {
            kind: ChannelKind::of(name),
            subscribed: false,
            user_data,
            handlers: HashMap::new(),
            members: HashMap::new(),
            me: None,
        }
    }
}

/// Channel registry: per-channel state, handler tables, and the global
/// (client-level) handler table.
pub(crate) struct Registry {
    channels: HashMap<String, ChannelState>,
    order: Vec<String>,
    global: HashMap<String, Vec<HandlerEntry>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

pub(crate) type SharedRegistry = Arc<Mutex<Registry>>;

impl Registry {
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            channels: HashMap::new(),
            order: Vec::new(),
            global: HashMap::new(),
            reporter,
        }
    }

    pub fn shared(reporter: Arc<dyn ErrorReporter>) -> SharedRegistry {
        Arc::new(Mutex::new(Self::new(reporter)))
    }

    /// Create the channel if absent, keeping first-created order for
    /// re-subscription. Later `user_data` never overwrites an earlier one.
    pub fn get_or_create(&mut self, name: &str, user_data: Option<Value>) -> &mut ChannelState {
        if !self.channels.contains_key(name) {
            self.order.push(name.to_string());
            self.channels
                .insert(name.to_string(), ChannelState::new(name, user_data));
        }
        self.channels.get_mut(name).expect("just inserted")
    }

    pub fn get(&self, name: &str) -> Option<&ChannelState> {
        self.channels.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.channels.remove(name);
        self.order.retain(|n| n != name);
    }

    /// Channel names in the order they were first created.
    pub fn snapshot_names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Stored presence user data for a channel.
    pub fn user_data(&self, name: &str) -> Option<Value> {
        self.channels.get(name).and_then(|c| c.user_data.clone())
    }

    /// Mark every channel unsubscribed and clear presence rosters. The `me`
    /// record is retained so re-subscription can rebuild the roster.
    pub fn mark_all_unsubscribed(&mut self) {
        for channel in self.channels.values_mut() {
            channel.subscribed = false;
            channel.members.clear();
        }
    }

    pub fn bind_global(&mut self, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId::next();
        self.global
            .entry(event.to_string())
            .or_default()
            .push(HandlerEntry {
                id,
                callback: handler,
            });
        id
    }

    pub fn unbind_global(&mut self, event: &str, id: HandlerId) -> bool {
        remove_handler(&mut self.global, event, id)
    }

    pub fn unbind_global_all(&mut self, event: &str) {
        self.global.remove(event);
    }

    pub fn bind_channel(&mut self, name: &str, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId::next();
        let channel = self.get_or_create(name, None);
        channel
            .handlers
            .entry(event.to_string())
            .or_default()
            .push(HandlerEntry {
                id,
                callback: handler,
            });
        id
    }

    pub fn unbind_channel(&mut self, name: &str, event: &str, id: HandlerId) -> bool {
        match self.channels.get_mut(name) {
            Some(channel) => remove_handler(&mut channel.handlers, event, id),
            None => false,
        }
    }

    pub fn unbind_channel_all(&mut self, name: &str, event: &str) {
        if let Some(channel) = self.channels.get_mut(name) {
            channel.handlers.remove(event);
        }
    }

    /// Apply a protocol-internal event to channel state. Runs before user
    /// delivery so handlers observe the post-mutation state.
    fn apply_internal(&mut self, msg: &Message) {
        let Some(name) = msg.channel.as_deref() else {
            return;
        };
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };

        match msg.event.as_str() {
            events::SUBSCRIPTION_SUCCEEDED => {
                channel.subscribed = true;
                if channel.kind == ChannelKind::Presence {
                    channel.members = roster_from_payload(&msg.data);
                    if let Some(me) = channel.user_data.as_ref().and_then(member_from_user_data) {
                        channel
                            .members
                            .entry(me.user_id.clone())
                            .or_insert_with(|| me.user_info.clone());
                        channel.me = Some(me);
                    }
                    debug!(
                        "presence channel {} initialized with {} member(s)",
                        name,
                        channel.members.len()
                    );
                }
            }
            events::MEMBER_ADDED => {
                if let Some(user_id) = user_id_of(&msg.data) {
                    let user_info = msg.data.get("user_info").cloned().unwrap_or(Value::Null);
                    channel.members.insert(user_id, user_info);
                }
            }
            events::MEMBER_REMOVED => {
                if let Some(user_id) = user_id_of(&msg.data) {
                    channel.members.remove(&user_id);
                }
            }
            _ => {}
        }
    }

    /// Collect the handlers that should observe this event, channel table
    /// first, then the global table; exact matches before wildcards within
    /// each table.
    fn collect_handlers(&self, msg: &Message) -> Vec<HandlerEntry> {
        let mut out = Vec::new();
        if let Some(name) = msg.channel.as_deref() {
            if let Some(channel) = self.channels.get(name) {
                push_matching(&mut out, &channel.handlers, &msg.event);
            }
        }
        push_matching(&mut out, &self.global, &msg.event);
        out
    }
}

fn push_matching(
    out: &mut Vec<HandlerEntry>,
    table: &HashMap<String, Vec<HandlerEntry>>,
    event: &str,
) {
    if let Some(entries) = table.get(event) {
        out.extend(entries.iter().cloned());
    }
    if event != WILDCARD {
        if let Some(entries) = table.get(WILDCARD) {
            out.extend(entries.iter().cloned());
        }
    }
}

fn remove_handler(
    table: &mut HashMap<String, Vec<HandlerEntry>>,
    event: &str,
    id: HandlerId,
) -> bool {
    let Some(entries) = table.get_mut(event) else {
        return false;
    };
    let before = entries.len();
    entries.retain(|entry| entry.id != id);
    let removed = entries.len() < before;
    if entries.is_empty() {
        table.remove(event);
    }
    removed
}

/// The roster arrives either as a top-level `hash` or nested under
/// `presence.hash`, depending on the broker.
fn roster_from_payload(data: &Value) -> HashMap<String, Value> {
    let hash = data
        .get("presence")
        .and_then(|p| p.get("hash"))
        .or_else(|| data.get("hash"));

    match hash.and_then(Value::as_object) {
        Some(map) => map
            .iter()
            .map(|(user_id, info)| (user_id.clone(), info.clone()))
            .collect(),
        None => HashMap::new(),
    }
}

fn member_from_user_data(user_data: &Value) -> Option<PresenceMember> {
    let user_id = user_id_of(user_data)?;
    let user_info = user_data.get("user_info").cloned().unwrap_or(Value::Null);
    Some(PresenceMember { user_id, user_info })
}

fn user_id_of(data: &Value) -> Option<String> {
    match data.get("user_id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Route one decoded envelope through the registry.
///
/// State mutations happen under the lock; handler invocation happens after
/// it is released, in collection order, so a handler may bind or unbind
/// without deadlocking. Dispatch is awaited by the receive path, which is
/// what preserves per-channel wire order.
pub(crate) async fn dispatch(registry: &SharedRegistry, msg: &Message) {
    let (handlers, reporter) = {
        let mut guard = registry.lock().await;
        guard.apply_internal(msg);
        (guard.collect_handlers(msg), Arc::clone(&guard.reporter))
    };

    for entry in handlers {
        let event = Event {
            name: msg.event.clone(),
            data: msg.data.clone(),
            channel: msg.channel.clone(),
        };
        if let Err(err) = (entry.callback)(event).await {
            reporter.handler_error(&msg.event, msg.channel.as_deref(), &err);
        }
    }
}

/// Handle to a channel in the registry.
///
/// Cheap to clone; all state lives in the registry so handles stay current
/// across reconnects.
#[derive(Clone, Debug)]
pub struct Channel {
    name: String,
    kind: ChannelKind,
    registry: SharedRegistry,
    connection: Connection,
}

impl Channel {
    pub(crate) fn new(name: &str, registry: SharedRegistry, connection: Connection) -> Self {
        Self {
            name: name.to_string(),
            kind: ChannelKind::of(name),
            registry,
            connection,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Whether the server has acknowledged the subscription.
    pub async fn is_subscribed(&self) -> bool {
        self.registry
            .lock()
            .await
            .get(&self.name)
            .map(|c| c.subscribed)
            .unwrap_or(false)
    }

    /// Bind an event handler on this channel. `"*"` receives every event on
    /// the channel, including protocol-internal ones.
    pub async fn bind(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.registry
            .lock()
            .await
            .bind_channel(&self.name, event, handler)
    }

    /// Remove one handler registration. Returns whether it was present.
    pub async fn unbind(&self, event: &str, id: HandlerId) -> bool {
        self.registry
            .lock()
            .await
            .unbind_channel(&self.name, event, id)
    }

    /// Remove every handler for the event.
    pub async fn unbind_all(&self, event: &str) {
        self.registry
            .lock()
            .await
            .unbind_channel_all(&self.name, event);
    }

    /// Current presence roster, keyed by user id. Empty for non-presence
    /// channels.
    pub async fn members(&self) -> HashMap<String, Value> {
        self.registry
            .lock()
            .await
            .get(&self.name)
            .map(|c| c.members.clone())
            .unwrap_or_default()
    }

    /// The local user's presence record, set once subscription succeeds.
    pub async fn me(&self) -> Option<PresenceMember> {
        self.registry
            .lock()
            .await
            .get(&self.name)
            .and_then(|c| c.me.clone())
    }

    /// Trigger a client event on this channel. Only permitted on subscribed
    /// private/presence channels; the `client-` prefix is added when absent.
    pub async fn trigger(&self, event: &str, data: Value) -> Result<()> {
        self.connection.trigger(&self.name, event, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{handler, LogReporter};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn registry() -> SharedRegistry {
        Registry::shared(Arc::new(LogReporter))
    }

    fn record(log: &Arc<StdMutex<Vec<String>>>, tag: &str) -> EventHandler {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        handler(move |event: Event| {
            let log = Arc::clone(&log);
            let tag = tag.clone();
            async move {
                log.lock().unwrap().push(format!("{tag}:{}", event.name));
                Ok(())
            }
        })
    }

    #[test]
    fn kind_derived_from_prefix() {
        assert_eq!(ChannelKind::of("orders"), ChannelKind::Public);
        assert_eq!(ChannelKind::of("private-room.7"), ChannelKind::Private);
        assert_eq!(ChannelKind::of("presence-chat.1"), ChannelKind::Presence);
        assert!(!ChannelKind::of("orders").requires_auth());
        assert!(ChannelKind::of("presence-chat.1").requires_auth());
    }

    #[tokio::test]
    async fn dispatch_runs_exact_then_wildcard_channel_then_global() {
        let registry = registry();
        let log = Arc::new(StdMutex::new(Vec::new()));
        {
            let mut guard = registry.lock().await;
            guard.get_or_create("chat", None);
            guard.bind_channel("chat", "msg", record(&log, "ch-exact"));
            guard.bind_channel("chat", WILDCARD, record(&log, "ch-wild"));
            guard.bind_global("msg", record(&log, "g-exact"));
            guard.bind_global(WILDCARD, record(&log, "g-wild"));
        }

        let msg = Message::new("msg", json!({})).on_channel("chat");
        dispatch(&registry, &msg).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["ch-exact:msg", "ch-wild:msg", "g-exact:msg", "g-wild:msg"]
        );
    }

    #[tokio::test]
    async fn handler_error_does_not_stop_later_handlers() {
        let registry = registry();
        let log = Arc::new(StdMutex::new(Vec::new()));
        {
            let mut guard = registry.lock().await;
            guard.get_or_create("chat", None);
            guard.bind_channel(
                "chat",
                "msg",
                handler(|_| async { Err(crate::error::ReverbError::Protocol("boom".into())) }),
            );
            guard.bind_channel("chat", "msg", record(&log, "second"));
        }

        let msg = Message::new("msg", json!({})).on_channel("chat");
        dispatch(&registry, &msg).await;

        assert_eq!(*log.lock().unwrap(), vec!["second:msg"]);
    }

    #[tokio::test]
    async fn subscription_succeeded_marks_subscribed_and_seeds_roster() {
        let registry = registry();
        {
            let mut guard = registry.lock().await;
            guard.get_or_create(
                "presence-chat.1",
                Some(json!({"user_id": "u1", "user_info": {"name": "alice"}})),
            );
        }

        let msg = Message::new(
            events::SUBSCRIPTION_SUCCEEDED,
            json!({"hash": {"u1": {"name": "alice"}}}),
        )
        .on_channel("presence-chat.1");
        dispatch(&registry, &msg).await;

        let guard = registry.lock().await;
        let channel = guard.get("presence-chat.1").unwrap();
        assert!(channel.subscribed);
        assert_eq!(channel.members["u1"], json!({"name": "alice"}));
        let me = channel.me.as_ref().unwrap();
        assert_eq!(me.user_id, "u1");
        assert!(channel.members.contains_key(&me.user_id));
    }

    #[tokio::test]
    async fn roster_accepts_nested_presence_hash() {
        let registry = registry();
        {
            let mut guard = registry.lock().await;
            guard.get_or_create("presence-room", Some(json!({"user_id": "me"})));
        }

        let msg = Message::new(
            events::SUBSCRIPTION_SUCCEEDED,
            json!({"presence": {"hash": {"other": {"n": 1}}, "count": 1}}),
        )
        .on_channel("presence-room");
        dispatch(&registry, &msg).await;

        let guard = registry.lock().await;
        let channel = guard.get("presence-room").unwrap();
        assert!(channel.members.contains_key("other"));
        assert!(channel.members.contains_key("me"));
    }

    #[tokio::test]
    async fn member_lifecycle() {
        let registry = registry();
        {
            let mut guard = registry.lock().await;
            guard.get_or_create(
                "presence-chat.1",
                Some(json!({"user_id": "u1", "user_info": {"name": "alice"}})),
            );
        }

        let subscribe = Message::new(
            events::SUBSCRIPTION_SUCCEEDED,
            json!({"hash": {"u1": {"name": "alice"}}}),
        )
        .on_channel("presence-chat.1");
        dispatch(&registry, &subscribe).await;

        let added = Message::new(
            events::MEMBER_ADDED,
            json!({"user_id": "u2", "user_info": {"name": "bob"}}),
        )
        .on_channel("presence-chat.1");
        dispatch(&registry, &added).await;

        let removed = Message::new(events::MEMBER_REMOVED, json!({"user_id": "u1"}))
            .on_channel("presence-chat.1");
        dispatch(&registry, &removed).await;

        let guard = registry.lock().await;
        let members = &guard.get("presence-chat.1").unwrap().members;
        assert_eq!(members.len(), 1);
        assert_eq!(members["u2"], json!({"name": "bob"}));
    }

    #[tokio::test]
    async fn member_removed_for_unknown_user_is_noop() {
        let registry = registry();
        {
            let mut guard = registry.lock().await;
            guard.get_or_create("presence-chat.1", Some(json!({"user_id": "u1"})));
        }

        let removed = Message::new(events::MEMBER_REMOVED, json!({"user_id": "ghost"}))
            .on_channel("presence-chat.1");
        dispatch(&registry, &removed).await;

        let guard = registry.lock().await;
        assert!(guard.get("presence-chat.1").unwrap().members.is_empty());
    }

    #[tokio::test]
    async fn internal_events_reach_wildcard_handlers() {
        let registry = registry();
        let log = Arc::new(StdMutex::new(Vec::new()));
        {
            let mut guard = registry.lock().await;
            guard.get_or_create("presence-chat.1", Some(json!({"user_id": "u1"})));
            guard.bind_channel("presence-chat.1", WILDCARD, record(&log, "wild"));
        }

        let added = Message::new(events::MEMBER_ADDED, json!({"user_id": "u2", "user_info": {}}))
            .on_channel("presence-chat.1");
        dispatch(&registry, &added).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["wild:pusher_internal:member_added"]
        );
    }

    #[tokio::test]
    async fn mark_all_unsubscribed_clears_state_but_keeps_me() {
        let registry = registry();
        {
            let mut guard = registry.lock().await;
            guard.get_or_create("orders", None);
            guard.get_or_create(
                "presence-chat.1",
                Some(json!({"user_id": "u1", "user_info": {}})),
            );
        }

        let subscribe = Message::new(events::SUBSCRIPTION_SUCCEEDED, json!({"hash": {}}))
            .on_channel("presence-chat.1");
        dispatch(&registry, &subscribe).await;

        let mut guard = registry.lock().await;
        guard.get_or_create("orders", None).subscribed = true;
        guard.mark_all_unsubscribed();

        for name in ["orders", "presence-chat.1"] {
            assert!(!guard.get(name).unwrap().subscribed);
        }
        let presence = guard.get("presence-chat.1").unwrap();
        assert!(presence.members.is_empty());
        assert_eq!(presence.me.as_ref().unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn bind_then_unbind_restores_table_shape() {
        let registry = registry();
        let mut guard = registry.lock().await;
        guard.get_or_create("chat", None);

        let noop = handler(|_| async { Ok(()) });
        let id = guard.bind_channel("chat", "msg", noop);
        assert!(guard.unbind_channel("chat", "msg", id));
        assert!(guard.get("chat").unwrap().handlers.is_empty());

        let gid = guard.bind_global("msg", handler(|_| async { Ok(()) }));
        assert!(guard.unbind_global("msg", gid));
        assert!(guard.global.is_empty());
        assert!(!guard.unbind_global("msg", gid));
    }

    #[tokio::test]
    async fn snapshot_keeps_first_created_order() {
        let registry = registry();
        let mut guard = registry.lock().await;
        guard.get_or_create("b-channel", None);
        guard.get_or_create("a-channel", None);
        guard.get_or_create("b-channel", None);
        assert_eq!(guard.snapshot_names(), vec!["b-channel", "a-channel"]);

        guard.remove("b-channel");
        assert_eq!(guard.snapshot_names(), vec!["a-channel"]);
    }
}
