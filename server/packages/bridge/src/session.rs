//! Binds Discord threads to tool threads and moves traffic across the binding.
//!
//! Bindings are looked up in two tiers: the in-memory cache is authoritative,
//! and a cache miss falls back to decoding the thread name. Names produced by
//! the hash fallback cannot be decoded, so replies in such threads are dropped
//! once the cache entry is gone (for example after a restart).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use codex_opencode_bridge_error::BridgeError;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};

use crate::chat::{ChatError, ChatInbound, ChatPlatform, Embed, EmbedField, InboundMessage};
use crate::event_router::recv_next;
use crate::reply_queue::ReplyQueue;
use crate::thread_key;
use crate::types::{BridgeEvent, BridgeReply, ToolSource};

pub const ACK_EMOJI: &str = "✅";
pub const FAILURE_EMOJI: &str = "⚠️";
/// Event type OpenCode emits when a session is removed.
pub const SESSION_DELETED_EVENT: &str = "session.deleted";

const MAX_METADATA_FIELDS: usize = 5;
const EMBED_TITLE_LIMIT: usize = 256;
const EMBED_DESCRIPTION_LIMIT: usize = 4096;
const EMBED_FIELD_VALUE_LIMIT: usize = 1024;
/// Discord rejects embeds whose text adds up to more than this.
const EMBED_TOTAL_LIMIT: usize = 6000;

type BindingKey = (ToolSource, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Bound,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadBinding {
    pub chat_thread_id: String,
    pub source: ToolSource,
    pub external_thread_id: String,
    pub thread_name: String,
}

impl ThreadBinding {
    fn key(&self) -> BindingKey {
        (self.source, self.external_thread_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A new chat thread was created and bound.
    ThreadCreated { chat_thread_id: String },
    /// The event went into an already bound thread.
    Posted { chat_thread_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    BotAuthor,
    NotThread,
    EmptyContent,
    UnresolvedBinding,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Enqueued(BridgeReply),
    Ignored(IgnoreReason),
}

#[derive(Debug, Default)]
struct BindingCache {
    by_chat_thread: HashMap<String, ThreadBinding>,
    by_external: HashMap<BindingKey, String>,
    closed_chat_threads: HashSet<String>,
    closed_external: HashSet<BindingKey>,
}

impl BindingCache {
    fn bind(&mut self, binding: ThreadBinding) {
        let key = binding.key();
        self.closed_external.remove(&key);
        self.closed_chat_threads.remove(&binding.chat_thread_id);
        self.by_external.insert(key, binding.chat_thread_id.clone());
        self.by_chat_thread
            .insert(binding.chat_thread_id.clone(), binding);
    }

    /// Caches a binding recovered from a thread name without displacing a
    /// thread that is already bound for the same key.
    fn bind_recovered(&mut self, binding: ThreadBinding) {
        let key = binding.key();
        self.closed_external.remove(&key);
        self.by_external
            .entry(key)
            .or_insert_with(|| binding.chat_thread_id.clone());
        self.by_chat_thread
            .insert(binding.chat_thread_id.clone(), binding);
    }

    fn close_chat_thread(&mut self, chat_thread_id: &str) -> bool {
        let Some(binding) = self.by_chat_thread.remove(chat_thread_id) else {
            return false;
        };
        let key = binding.key();
        if self.by_external.get(&key).map(String::as_str) == Some(chat_thread_id) {
            self.by_external.remove(&key);
            self.closed_external.insert(key);
        }
        self.closed_chat_threads.insert(chat_thread_id.to_string());
        true
    }
}

pub struct BridgeSession {
    chat: Arc<dyn ChatPlatform>,
    replies: Arc<ReplyQueue>,
    channel_id: RwLock<Option<String>>,
    cache: Mutex<BindingCache>,
    key_locks: Mutex<HashMap<BindingKey, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSession").finish_non_exhaustive()
    }
}

impl BridgeSession {
    pub fn new(chat: Arc<dyn ChatPlatform>, replies: Arc<ReplyQueue>) -> Self {
        Self {
            chat,
            replies,
            channel_id: RwLock::new(None),
            cache: Mutex::new(BindingCache::default()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Marks the parent channel as resolved; events are dropped until then.
    pub async fn set_channel(&self, channel_id: impl Into<String>) {
        *self.channel_id.write().await = Some(channel_id.into());
    }

    pub async fn channel_id(&self) -> Option<String> {
        self.channel_id.read().await.clone()
    }

    pub async fn binding_state(&self, source: ToolSource, external_thread_id: &str) -> BindingState {
        let key = (source, external_thread_id.to_string());
        let cache = self.cache.lock().await;
        if cache.by_external.contains_key(&key) {
            BindingState::Bound
        } else if cache.closed_external.contains(&key) {
            BindingState::Closed
        } else {
            BindingState::Unbound
        }
    }

    pub async fn binding_for_chat_thread(&self, chat_thread_id: &str) -> Option<ThreadBinding> {
        self.cache
            .lock()
            .await
            .by_chat_thread
            .get(chat_thread_id)
            .cloned()
    }

    /// Posts an event into its thread, creating and binding the thread first
    /// when the external thread has none.
    pub async fn handle_event(&self, event: &BridgeEvent) -> Result<EventOutcome, BridgeError> {
        let Some(channel_id) = self.channel_id().await else {
            return Err(BridgeError::ChannelNotReady {
                event_id: event.id.clone(),
            });
        };
        let external_thread_id = event.external_thread_id();
        let key = (event.source, external_thread_id.clone());

        let lock = self.key_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            self.post_event(&channel_id, event, &external_thread_id).await
        };
        drop(lock);
        self.release_key_lock(&key).await;

        let outcome = result?;
        if event.event_type == SESSION_DELETED_EVENT {
            self.close(event.source, &external_thread_id).await;
        }
        Ok(outcome)
    }

    async fn post_event(
        &self,
        channel_id: &str,
        event: &BridgeEvent,
        external_thread_id: &str,
    ) -> Result<EventOutcome, BridgeError> {
        let embed = build_embed(event);
        let key = (event.source, external_thread_id.to_string());
        let existing = self.cache.lock().await.by_external.get(&key).cloned();

        if let Some(chat_thread_id) = existing {
            match self.chat.send_embed(&chat_thread_id, &embed).await {
                Ok(_) => {
                    tracing::debug!(
                        event_id = %event.id,
                        chat_thread_id = %chat_thread_id,
                        "event posted to bound thread"
                    );
                    return Ok(EventOutcome::Posted { chat_thread_id });
                }
                Err(ChatError::NotFound(_)) => {
                    tracing::warn!(
                        event_id = %event.id,
                        chat_thread_id = %chat_thread_id,
                        "bound thread is gone; starting a new one"
                    );
                    self.cache.lock().await.close_chat_thread(&chat_thread_id);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let message = self.chat.send_embed(channel_id, &embed).await?;
        let name = thread_key::encode(event.source, external_thread_id);
        let thread = self
            .chat
            .start_thread(channel_id, &message.id, &name)
            .await?;

        if thread_key::is_hashed(&name) {
            let notice = format!(
                "Linked tool thread: {external_thread_id}. Replies here will sync back to {}.",
                event.source
            );
            if let Err(err) = self.chat.send_text(&thread.id, &notice).await {
                tracing::warn!(chat_thread_id = %thread.id, error = %err, "failed to post link notice");
            }
        }

        self.cache.lock().await.bind(ThreadBinding {
            chat_thread_id: thread.id.clone(),
            source: event.source,
            external_thread_id: external_thread_id.to_string(),
            thread_name: name,
        });
        tracing::info!(
            event_id = %event.id,
            source = %event.source,
            external_thread_id = %external_thread_id,
            chat_thread_id = %thread.id,
            "thread bound"
        );
        Ok(EventOutcome::ThreadCreated {
            chat_thread_id: thread.id,
        })
    }

    /// Turns a human message in a bound thread into a queued reply.
    pub async fn handle_chat_message(
        &self,
        message: &InboundMessage,
    ) -> Result<MessageOutcome, BridgeError> {
        if message.author_is_bot {
            return Ok(MessageOutcome::Ignored(IgnoreReason::BotAuthor));
        }
        if !message.in_thread {
            return Ok(MessageOutcome::Ignored(IgnoreReason::NotThread));
        }
        let content = message.content.trim();
        if content.is_empty() {
            return Ok(MessageOutcome::Ignored(IgnoreReason::EmptyContent));
        }

        let Some(binding) = self
            .resolve_binding(&message.channel_id, message.thread_name.as_deref())
            .await?
        else {
            let err = BridgeError::UnresolvedBinding {
                chat_thread_id: message.channel_id.clone(),
            };
            tracing::debug!(message_id = %message.id, error = %err, "reply not routed");
            return Ok(MessageOutcome::Ignored(IgnoreReason::UnresolvedBinding));
        };

        let mut metadata = Map::new();
        metadata.insert(
            "discordMessageId".to_string(),
            Value::String(message.id.clone()),
        );
        let reply = self.replies.enqueue(
            binding.source,
            &binding.external_thread_id,
            content,
            Some(metadata),
        );
        self.acknowledge(message).await;
        Ok(MessageOutcome::Enqueued(reply))
    }

    async fn acknowledge(&self, message: &InboundMessage) {
        let Err(err) = self
            .chat
            .react(&message.channel_id, &message.id, ACK_EMOJI)
            .await
        else {
            return;
        };
        tracing::warn!(message_id = %message.id, error = %err, "failed to acknowledge reply");
        if let Err(err) = self
            .chat
            .react(&message.channel_id, &message.id, FAILURE_EMOJI)
            .await
        {
            tracing::warn!(message_id = %message.id, error = %err, "failed to flag reply");
        }
    }

    async fn resolve_binding(
        &self,
        chat_thread_id: &str,
        thread_name: Option<&str>,
    ) -> Result<Option<ThreadBinding>, BridgeError> {
        {
            let cache = self.cache.lock().await;
            if cache.closed_chat_threads.contains(chat_thread_id) {
                return Ok(None);
            }
            if let Some(binding) = cache.by_chat_thread.get(chat_thread_id) {
                return Ok(Some(binding.clone()));
            }
        }

        let name = match thread_name {
            Some(name) => name.to_string(),
            None => match self.chat.thread_name(chat_thread_id).await? {
                Some(name) => name,
                None => return Ok(None),
            },
        };
        let Some((source, external_thread_id)) = thread_key::decode(&name) else {
            return Ok(None);
        };

        let binding = ThreadBinding {
            chat_thread_id: chat_thread_id.to_string(),
            source,
            external_thread_id,
            thread_name: name,
        };
        let key = binding.key();
        let lock = self.key_lock(&key).await;
        let revived = {
            let _guard = lock.lock().await;
            let mut cache = self.cache.lock().await;
            if cache.closed_chat_threads.contains(chat_thread_id) {
                false
            } else {
                cache.bind_recovered(binding.clone());
                true
            }
        };
        drop(lock);
        self.release_key_lock(&key).await;
        if !revived {
            return Ok(None);
        }
        tracing::info!(
            chat_thread_id = %chat_thread_id,
            source = %binding.source,
            external_thread_id = %binding.external_thread_id,
            "binding recovered from thread name"
        );
        Ok(Some(binding))
    }

    /// Closes the binding of an external thread. Unknown ids are a no-op.
    pub async fn close(&self, source: ToolSource, external_thread_id: &str) -> bool {
        let key = (source, external_thread_id.to_string());
        let mut cache = self.cache.lock().await;
        let chat_threads: Vec<String> = cache
            .by_chat_thread
            .values()
            .filter(|binding| binding.key() == key)
            .map(|binding| binding.chat_thread_id.clone())
            .collect();
        let mut closed = false;
        for chat_thread_id in chat_threads {
            closed |= cache.close_chat_thread(&chat_thread_id);
        }
        if closed {
            cache.closed_external.insert(key);
            tracing::info!(source = %source, external_thread_id = %external_thread_id, "binding closed");
        }
        closed
    }

    /// Closes whatever binding a deleted chat thread carried.
    pub async fn close_chat_thread(&self, chat_thread_id: &str) -> bool {
        let closed = self.cache.lock().await.close_chat_thread(chat_thread_id);
        if closed {
            tracing::info!(chat_thread_id = %chat_thread_id, "chat thread closed");
        }
        closed
    }

    /// Posts router events one at a time until shutdown or the router closes.
    pub async fn serve_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<BridgeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = recv_next(&mut events) => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match self.handle_event(&event).await {
                Ok(outcome) => {
                    tracing::debug!(event_id = %event.id, ?outcome, "event handled");
                }
                Err(err @ BridgeError::ChannelNotReady { .. }) => {
                    tracing::warn!(event_id = %event.id, error = %err, "dropping event");
                }
                Err(err) => {
                    tracing::warn!(event_id = %event.id, error = %err, "failed to post event");
                }
            }
        }
        tracing::debug!("event loop stopped");
    }

    /// Routes inbound chat traffic until shutdown or the platform feed ends.
    pub async fn serve_chat(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<ChatInbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let item = tokio::select! {
                _ = shutdown.changed() => break,
                item = inbound.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            match item {
                ChatInbound::Message(message) => {
                    if let Err(err) = self.handle_chat_message(&message).await {
                        tracing::warn!(message_id = %message.id, error = %err, "failed to route reply");
                    }
                }
                ChatInbound::ThreadDeleted { thread_id } => {
                    self.close_chat_thread(&thread_id).await;
                }
            }
        }
        tracing::debug!("chat loop stopped");
    }

    async fn key_lock(&self, key: &BindingKey) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    async fn release_key_lock(&self, key: &BindingKey) {
        let mut locks = self.key_locks.lock().await;
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }
}

/// Summary embed for an event: title, source, type, body and up to five
/// metadata entries.
pub fn build_embed(event: &BridgeEvent) -> Embed {
    let title = event.title.clone().unwrap_or_else(|| {
        format!(
            "{} {}",
            event.source.as_str().to_uppercase(),
            event.event_type
        )
    });
    let mut fields = vec![
        EmbedField {
            name: "Source".to_string(),
            value: event.source.to_string(),
            inline: true,
        },
        EmbedField {
            name: "Type".to_string(),
            value: truncate(&event.event_type, EMBED_FIELD_VALUE_LIMIT),
            inline: true,
        },
    ];
    if let Some(metadata) = event.metadata.as_ref().filter(|metadata| !metadata.is_empty()) {
        fields.push(EmbedField {
            name: "Metadata".to_string(),
            value: truncate(&format_metadata(metadata), EMBED_FIELD_VALUE_LIMIT),
            inline: false,
        });
    }
    let title = truncate(&title, EMBED_TITLE_LIMIT);
    let used = title.chars().count()
        + fields
            .iter()
            .map(|field| field.name.chars().count() + field.value.chars().count())
            .sum::<usize>();
    let description_limit = EMBED_DESCRIPTION_LIMIT.min(EMBED_TOTAL_LIMIT.saturating_sub(used));
    Embed {
        title: Some(title),
        description: Some(truncate(&event.body, description_limit)),
        fields,
        timestamp: Some(event.created_at),
    }
}

pub fn format_metadata(metadata: &Map<String, Value>) -> String {
    let lines: Vec<String> = metadata
        .iter()
        .take(MAX_METADATA_FIELDS)
        .map(|(key, value)| format!("• {key}: {}", metadata_value(value)))
        .collect();
    if lines.is_empty() {
        "n/a".to_string()
    } else {
        lines.join("\n")
    }
}

fn metadata_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => format!("`{other}`"),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(limit.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}
