//! Telegram channel adapter
//!
//! Long-polls the Bot API `getUpdates` endpoint and sends with `sendMessage`.
//! The chat id of an inbound message is its thread id, so replies land in
//! the same chat.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::{ChannelSpec, ChannelTimeouts, InboundSink, OutboundMessage, Transport};
use crate::{Error, Result};

/// Bot API base URL
const API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to `getUpdates`
const POLL_TIMEOUT_SECS: u64 = 30;

/// Telegram caps messages at 4096 characters; leave some margin
const CHUNK_LIMIT: usize = 4000;

/// First delay after a failed poll; doubles on each further failure
const POLL_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Longest delay between failed polls
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Telegram Bot API transport
pub struct TelegramTransport {
    token: Option<SecretString>,
    api_base: String,
    default_chat_id: Option<String>,
    client: Client,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramTransport {
    /// Build from channel settings
    ///
    /// Keys: `token`, `default_chat_id`, `api_base`. A missing token is
    /// reported when the channel starts. Every request is bounded by the
    /// channel's send timeout except `getUpdates`, which sets its own.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn from_spec(spec: &ChannelSpec) -> Result<Self> {
        let client = Client::builder()
            .timeout(ChannelTimeouts::from_spec(spec).send)
            .build()?;
        Ok(Self {
            token: spec
                .str("token")
                .filter(|t| !t.is_empty())
                .map(|t| SecretString::from(t.to_string())),
            api_base: spec
                .str("api_base")
                .unwrap_or(API_BASE)
                .trim_end_matches('/')
                .to_string(),
            default_chat_id: spec.str("default_chat_id").map(String::from),
            client,
            poller: Mutex::new(None),
        })
    }

    fn method_url(&self, token: &SecretString, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, token.expose_secret())
    }

    fn token(&self) -> Result<&SecretString> {
        self.token
            .as_ref()
            .ok_or_else(|| Error::MissingDependency("telegram bot token not configured".to_string()))
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn open(&self, inbound: InboundSink) -> Result<()> {
        let token = self.token()?;

        // Validate the token before committing to a poll loop
        let response: TelegramResponse<BotUser> = self
            .client
            .get(self.method_url(token, "getMe"))
            .send()
            .await?
            .json()
            .await?;
        let bot = response.into_result("getMe")?;
        tracing::info!(bot = %bot.username.as_deref().unwrap_or(&bot.first_name), "Telegram channel connected");

        let poller = Poller {
            updates_url: self.method_url(token, "getUpdates"),
            send_url: self.method_url(token, "sendMessage"),
            client: self.client.clone(),
            inbound,
        };
        let handle = tokio::spawn(poller.run());
        *self.poller.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.poller.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        tracing::info!("Telegram channel disconnected");
        Ok(())
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        let token = self.token()?;
        let chat_id = message
            .thread_id
            .as_deref()
            .or(self.default_chat_id.as_deref())
            .ok_or_else(|| Error::Send("Telegram message has no chat id".to_string()))?;

        send_text(&self.client, &self.method_url(token, "sendMessage"), chat_id, &message.text).await
    }
}

struct Poller {
    updates_url: String,
    send_url: String,
    client: Client,
    inbound: InboundSink,
}

impl Poller {
    async fn run(self) {
        let mut offset: Option<i64> = None;
        let mut backoff = Backoff::default();

        loop {
            let updates = match self.fetch(offset).await {
                Ok(updates) => {
                    backoff.reset();
                    updates
                }
                Err(failure) => {
                    let delay = backoff.next_delay(failure.retry_after);
                    tracing::warn!(error = %failure.error, retry_in = ?delay, "Telegram getUpdates failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                let Some((sender_id, label, text, chat_id)) = update.into_parts() else {
                    continue;
                };

                let message = self.inbound.message(sender_id, label, text, Some(chat_id.clone()));
                let reply = self.inbound.dispatch(message);
                let client = self.client.clone();
                let url = self.send_url.clone();
                self.inbound.spawn_reply(reply, move |text| async move {
                    send_text(&client, &url, &chat_id, &text).await
                });
            }
        }
    }

    async fn fetch(&self, offset: Option<i64>) -> std::result::Result<Vec<Update>, PollFailure> {
        let mut params = serde_json::json!({
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"],
        });
        if let Some(off) = offset {
            params["offset"] = serde_json::json!(off);
        }

        let response: TelegramResponse<Vec<Update>> = self
            .client
            .post(&self.updates_url)
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .json(&params)
            .send()
            .await?
            .json()
            .await?;

        let retry_after = response.retry_after();
        response
            .into_result("getUpdates")
            .map_err(|error| PollFailure { error, retry_after })
    }
}

/// A failed poll and the wait Telegram asked for, if any
struct PollFailure {
    error: Error,
    retry_after: Option<Duration>,
}

impl From<reqwest::Error> for PollFailure {
    fn from(e: reqwest::Error) -> Self {
        Self {
            error: e.into(),
            retry_after: None,
        }
    }
}

/// Exponential backoff between failed polls, reset by a successful one
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
}

impl Backoff {
    /// Delay before the next poll
    ///
    /// A server-supplied `retry_after` wins over the computed delay. Either
    /// way the result is capped at [`POLL_BACKOFF_MAX`].
    fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after.unwrap_or_else(|| {
            let exponential = POLL_BACKOFF_BASE.saturating_mul(1 << self.failures.min(6));
            // Up to 25% jitter so restarted pollers do not retry in lockstep
            exponential + exponential.mul_f64(rand::thread_rng().gen_range(0.0..0.25))
        });
        self.failures = self.failures.saturating_add(1);
        delay.min(POLL_BACKOFF_MAX)
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

async fn send_text(client: &Client, url: &str, chat_id: &str, text: &str) -> Result<()> {
    for chunk in chunk_text(text, CHUNK_LIMIT) {
        let body = SendMessageRequest {
            chat_id,
            text: &chunk,
        };
        let response: TelegramResponse<serde_json::Value> =
            client.post(url).json(&body).send().await?.json().await?;
        response.into_result("sendMessage")?;
    }
    tracing::debug!(chat_id, "Telegram message sent");
    Ok(())
}

/// Split text into pieces of at most `limit` characters, preferring line breaks
fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        for ch in line.chars() {
            if current_len == limit {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push(ch);
            current_len += 1;
        }
        // Break at the line boundary if the next line would likely overflow
        if current_len > limit / 2 && current.ends_with('\n') {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

impl<T> TelegramResponse<T> {
    fn retry_after(&self) -> Option<Duration> {
        self.parameters
            .as_ref()
            .and_then(|p| p.retry_after)
            .map(Duration::from_secs)
    }

    fn into_result(self, method: &str) -> Result<T> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(Error::Channel(format!(
                "Telegram {method} failed: {}",
                self.description.unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BotUser {
    first_name: String,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    is_bot: bool,
    first_name: String,
}

impl Update {
    /// `(sender_id, label, text, chat_id)` for a human text message
    fn into_parts(self) -> Option<(String, String, String, String)> {
        let message = self.message?;
        if message.from.as_ref().is_some_and(|u| u.is_bot) {
            return None;
        }
        let text = message.text.or(message.caption).filter(|t| !t.is_empty())?;
        let chat_id = message.chat.id.to_string();
        let (sender_id, label) = message.from.map_or_else(
            || (chat_id.clone(), "Unknown".to_string()),
            |u| (u.id.to_string(), u.first_name),
        );
        Some((sender_id, label, text, chat_id))
    }
}
