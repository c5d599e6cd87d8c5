//! Discord REST client and the thread poller that feeds inbound messages.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::chat::{
    ChatError, ChatInbound, ChatMessageRef, ChatPlatform, ChatThread, Embed, InboundMessage,
};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const GUILD_TEXT: u8 = 0;
const ANNOUNCEMENT_THREAD: u8 = 10;
const PUBLIC_THREAD: u8 = 11;
const PRIVATE_THREAD: u8 = 12;
const MESSAGE_DEFAULT: u8 = 0;
const MESSAGE_REPLY: u8 = 19;
const THREAD_AUTO_ARCHIVE_MINUTES: u32 = 1440;
const MESSAGE_PAGE_LIMIT: u32 = 100;
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordChannel {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_message_id: Option<String>,
}

impl DiscordChannel {
    pub fn is_thread(&self) -> bool {
        matches!(
            self.kind,
            ANNOUNCEMENT_THREAD | PUBLIC_THREAD | PRIVATE_THREAD
        )
    }
}

/// The guild text channel events are posted into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChannel {
    pub id: String,
    pub guild_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordMessage {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub content: String,
    pub author: DiscordUser,
    #[serde(rename = "type", default)]
    pub kind: u8,
}

#[derive(Debug, Deserialize)]
struct ActiveThreads {
    #[serde(default)]
    threads: Vec<DiscordChannel>,
}

#[derive(Debug, Serialize)]
struct CreateMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embeds: Vec<&'a Embed>,
}

#[derive(Debug, Clone)]
pub struct DiscordClient {
    http: Client,
    token: String,
    api_base: String,
}

impl DiscordClient {
    pub fn new(token: impl Into<String>, api_base: Option<&str>) -> Result<Self, ChatError> {
        let http = Client::builder()
            .user_agent(concat!("codex-opencode-bridge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            token: token.into(),
            api_base: api_base
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(AUTHORIZATION, format!("Bot {}", self.token))
    }

    async fn send(&self, request: RequestBuilder, resource: &str) -> Result<Response, ChatError> {
        let response = self.authorized(request).send().await?;
        check_status(response, resource).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        resource: &str,
    ) -> Result<T, ChatError> {
        Ok(self.send(request, resource).await?.json::<T>().await?)
    }

    /// Verifies the bot token; the returned user is the bot itself.
    pub async fn current_user(&self) -> Result<DiscordUser, ChatError> {
        self.send_json(self.http.get(self.url("/users/@me")), "users/@me")
            .await
    }

    pub async fn fetch_channel(&self, channel_id: &str) -> Result<DiscordChannel, ChatError> {
        self.send_json(
            self.http.get(self.url(&format!("/channels/{channel_id}"))),
            channel_id,
        )
        .await
    }

    /// Fetches the configured parent channel and checks it is a guild text
    /// channel.
    pub async fn resolve_text_channel(&self, channel_id: &str) -> Result<TextChannel, ChatError> {
        let channel = self.fetch_channel(channel_id).await?;
        match (channel.kind, channel.guild_id) {
            (GUILD_TEXT, Some(guild_id)) => Ok(TextChannel {
                id: channel.id,
                guild_id,
            }),
            _ => Err(ChatError::InvalidChannel(channel_id.to_string())),
        }
    }

    pub async fn active_threads(&self, guild_id: &str) -> Result<Vec<DiscordChannel>, ChatError> {
        let active: ActiveThreads = self
            .send_json(
                self.http
                    .get(self.url(&format!("/guilds/{guild_id}/threads/active"))),
                guild_id,
            )
            .await?;
        Ok(active.threads)
    }

    /// Messages newer than `after`, in whatever order Discord returns them.
    pub async fn messages_after(
        &self,
        channel_id: &str,
        after: &str,
    ) -> Result<Vec<DiscordMessage>, ChatError> {
        let limit = MESSAGE_PAGE_LIMIT.to_string();
        self.send_json(
            self.http
                .get(self.url(&format!("/channels/{channel_id}/messages")))
                .query(&[("after", after), ("limit", limit.as_str())]),
            channel_id,
        )
        .await
    }

    async fn create_message(
        &self,
        channel_id: &str,
        body: &CreateMessage<'_>,
    ) -> Result<ChatMessageRef, ChatError> {
        let message: DiscordMessage = self
            .send_json(
                self.http
                    .post(self.url(&format!("/channels/{channel_id}/messages")))
                    .json(body),
                channel_id,
            )
            .await?;
        Ok(ChatMessageRef {
            id: message.id,
            channel_id: message.channel_id,
        })
    }
}

#[async_trait]
impl ChatPlatform for DiscordClient {
    async fn send_embed(&self, channel_id: &str, embed: &Embed) -> Result<ChatMessageRef, ChatError> {
        self.create_message(
            channel_id,
            &CreateMessage {
                content: None,
                embeds: vec![embed],
            },
        )
        .await
    }

    async fn send_text(&self, channel_id: &str, content: &str) -> Result<ChatMessageRef, ChatError> {
        self.create_message(
            channel_id,
            &CreateMessage {
                content: Some(content),
                embeds: Vec::new(),
            },
        )
        .await
    }

    async fn start_thread(
        &self,
        channel_id: &str,
        message_id: &str,
        name: &str,
    ) -> Result<ChatThread, ChatError> {
        let thread: DiscordChannel = self
            .send_json(
                self.http
                    .post(self.url(&format!(
                        "/channels/{channel_id}/messages/{message_id}/threads"
                    )))
                    .json(&json!({
                        "name": name,
                        "auto_archive_duration": THREAD_AUTO_ARCHIVE_MINUTES,
                    })),
                message_id,
            )
            .await?;
        Ok(ChatThread {
            name: thread.name.unwrap_or_else(|| name.to_string()),
            id: thread.id,
        })
    }

    async fn react(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<(), ChatError> {
        self.send(
            self.http.put(self.url(&reaction_path(channel_id, message_id, emoji))),
            message_id,
        )
        .await?;
        Ok(())
    }

    async fn thread_name(&self, thread_id: &str) -> Result<Option<String>, ChatError> {
        match self.fetch_channel(thread_id).await {
            Ok(channel) if channel.is_thread() => Ok(channel.name),
            Ok(_) => Ok(None),
            Err(ChatError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

async fn check_status(response: Response, resource: &str) -> Result<Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(ChatError::NotFound(resource.to_string())),
        StatusCode::UNAUTHORIZED => Err(ChatError::Unauthorized(body)),
        _ => Err(ChatError::Api {
            status: status.as_u16(),
            body,
        }),
    }
}

fn reaction_path(channel_id: &str, message_id: &str, emoji: &str) -> String {
    let emoji = utf8_percent_encode(emoji, NON_ALPHANUMERIC);
    format!("/channels/{channel_id}/messages/{message_id}/reactions/{emoji}/@me")
}

/// Orders Discord snowflakes numerically.
pub fn snowflake_cmp(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

/// The smallest snowflake Discord can assign at `at`.
pub fn snowflake_at(at: DateTime<Utc>) -> String {
    let millis = (at.timestamp_millis() - DISCORD_EPOCH_MS).max(0) as u64;
    (millis << 22).to_string()
}

/// Splits a fetched page into the user-visible messages (oldest first) and
/// the newest id seen, which becomes the next cursor.
fn order_page(mut page: Vec<DiscordMessage>) -> (Vec<DiscordMessage>, Option<String>) {
    page.sort_by(|a, b| snowflake_cmp(&a.id, &b.id));
    let newest = page.last().map(|message| message.id.clone());
    page.retain(|message| matches!(message.kind, MESSAGE_DEFAULT | MESSAGE_REPLY));
    (page, newest)
}

fn to_inbound(message: DiscordMessage, thread_name: Option<&str>, bot_user_id: &str) -> InboundMessage {
    InboundMessage {
        author_is_bot: message.author.bot || message.author.id == bot_user_id,
        id: message.id,
        channel_id: message.channel_id,
        in_thread: true,
        thread_name: thread_name.map(str::to_string),
        content: message.content,
    }
}

/// Polls the active threads under the parent channel for new messages.
///
/// The first pass only records where each existing thread ends, so history
/// from before startup is not replayed. Threads discovered later, such as an
/// archived thread a human revived, are read from the moment the poller was
/// created.
pub struct DiscordPoller {
    client: Arc<DiscordClient>,
    channel: TextChannel,
    bot_user_id: String,
    /// Last seen message per thread. Entries survive archival so a revived
    /// thread resumes where it stopped; only a deleted thread is forgotten.
    cursors: HashMap<String, String>,
    floor: String,
    seeded: bool,
}

impl DiscordPoller {
    pub fn new(client: Arc<DiscordClient>, channel: TextChannel, bot_user_id: String) -> Self {
        Self {
            client,
            channel,
            bot_user_id,
            cursors: HashMap::new(),
            floor: snowflake_at(Utc::now()),
            seeded: false,
        }
    }

    /// Runs one pass and returns how many items were forwarded.
    pub async fn poll_once(&mut self, sink: &mpsc::Sender<ChatInbound>) -> Result<usize, ChatError> {
        let threads = self.client.active_threads(&self.channel.guild_id).await?;
        let parent_id = self.channel.id.clone();
        let mut forwarded = 0;
        for thread in threads
            .into_iter()
            .filter(|thread| thread.parent_id.as_deref() == Some(parent_id.as_str()))
        {
            let cursor = match self.cursors.get(&thread.id) {
                Some(cursor) => cursor.clone(),
                None if !self.seeded => {
                    let start = thread
                        .last_message_id
                        .clone()
                        .unwrap_or_else(|| self.floor.clone());
                    self.cursors.insert(thread.id.clone(), start);
                    continue;
                }
                None => self.floor.clone(),
            };

            let page = match self.client.messages_after(&thread.id, &cursor).await {
                Ok(page) => page,
                Err(ChatError::NotFound(_)) => {
                    self.cursors.remove(&thread.id);
                    if sink
                        .send(ChatInbound::ThreadDeleted {
                            thread_id: thread.id.clone(),
                        })
                        .await
                        .is_ok()
                    {
                        forwarded += 1;
                    }
                    continue;
                }
                Err(err) => {
                    tracing::warn!(thread_id = %thread.id, error = %err, "failed to read thread");
                    continue;
                }
            };

            let (messages, newest) = order_page(page);
            self.cursors
                .insert(thread.id.clone(), newest.unwrap_or(cursor));
            for message in messages {
                let inbound = to_inbound(message, thread.name.as_deref(), &self.bot_user_id);
                if sink.send(ChatInbound::Message(inbound)).await.is_err() {
                    return Ok(forwarded);
                }
                forwarded += 1;
            }
        }
        if !self.seeded {
            tracing::debug!(threads = self.cursors.len(), "thread cursors seeded");
            self.seeded = true;
        }
        Ok(forwarded)
    }

    pub async fn run(
        mut self,
        interval: Duration,
        sink: mpsc::Sender<ChatInbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if sink.is_closed() {
                break;
            }
            match self.poll_once(&sink).await {
                Ok(0) => {}
                Ok(count) => tracing::debug!(count, "forwarded chat messages"),
                Err(err) => tracing::warn!(error = %err, "discord poll failed"),
            }
        }
        tracing::debug!("discord poller stopped");
    }
}
