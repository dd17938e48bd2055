//! Messaging channel adapters
//!
//! A channel is a named, configured instance of a [`Transport`]. Transports
//! only know how to open, close and deliver; the [`Channel`] wrapper owns the
//! lifecycle state machine, timeouts and failure containment so every adapter
//! behaves the same whether it sits on a socket, a subprocess or a webhook.

pub mod process;
#[cfg(feature = "signal")]
pub mod signal;
#[cfg(feature = "telegram")]
pub mod telegram;
pub mod web;
pub mod webhook;

use std::any::Any;
use std::borrow::{Borrow, Cow};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub use process::{BridgeEvent, ProcessBridge, ProcessConfig, ProcessTransport};
pub use web::{WebEvent, WebTransport};
pub use webhook::{WebhookDelivery, WebhookPayload, WebhookTransport};

use crate::{Error, Result};

/// Default bound on a single transport send
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 15;

/// Default bound on transport startup
const DEFAULT_START_TIMEOUT_SECS: u64 = 30;

/// Default grace period granted to a transport on stop
const DEFAULT_STOP_GRACE_SECS: u64 = 5;

/// Open identifier for a kind of channel
///
/// Well-known kinds are available as constants, but any string is a valid
/// identifier so plugins can introduce new kinds without touching this crate.
/// Equality is plain, case-sensitive string equality regardless of how the
/// value was constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelType(Cow<'static, str>);

impl ChannelType {
    pub const WEBHOOK: Self = Self(Cow::Borrowed("webhook"));
    pub const WEB: Self = Self(Cow::Borrowed("web"));
    pub const TELEGRAM: Self = Self(Cow::Borrowed("telegram"));
    pub const DISCORD: Self = Self(Cow::Borrowed("discord"));
    pub const SLACK: Self = Self(Cow::Borrowed("slack"));
    pub const WHATSAPP: Self = Self(Cow::Borrowed("whatsapp"));
    pub const SIGNAL: Self = Self(Cow::Borrowed("signal"));
    pub const MATRIX: Self = Self(Cow::Borrowed("matrix"));
    pub const TEAMS: Self = Self(Cow::Borrowed("teams"));

    /// All well-known identifiers
    pub const WELL_KNOWN: &'static [Self] = &[
        Self::WEBHOOK,
        Self::WEB,
        Self::TELEGRAM,
        Self::DISCORD,
        Self::SLACK,
        Self::WHATSAPP,
        Self::SIGNAL,
        Self::MATRIX,
        Self::TEAMS,
    ];

    /// Mint an identifier from an arbitrary string
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Cow::Owned(value.into()))
    }

    /// The identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this identifier is one of the well-known kinds
    #[must_use]
    pub fn is_well_known(&self) -> bool {
        Self::WELL_KNOWN.contains(self)
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChannelType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for ChannelType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ChannelType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ChannelType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Feature a transport may support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelCapability {
    /// Can render rich display content (canvas surface)
    Canvas,
    /// Messages can be addressed to a thread within a conversation
    Threads,
}

/// Lifecycle state of a channel instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A message received from a transport
#[derive(Debug, Clone, Serialize)]
pub struct InboundMessage {
    /// Kind of channel the message arrived on
    pub channel_type: ChannelType,

    /// Instance name of the receiving channel
    pub instance: String,

    /// Sender identifier (transport-specific)
    pub sender_id: String,

    /// Sender display label
    pub sender_label: String,

    /// Message text
    pub text: String,

    /// Thread or conversation identifier, when the transport has one
    pub thread_id: Option<String>,

    /// When the gateway received the message
    pub received_at: DateTime<Utc>,
}

/// A message to deliver through exactly one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Kind of channel
    pub channel_type: ChannelType,

    /// Target channel instance name
    pub instance: String,

    /// Thread or conversation to address; `None` uses the transport default
    pub thread_id: Option<String>,

    /// Message text
    pub text: String,
}

impl OutboundMessage {
    /// Create a plain `text` message for a channel instance
    #[must_use]
    pub fn text(channel_type: ChannelType, instance: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel_type,
            instance: instance.into(),
            thread_id: None,
            text: text.into(),
        }
    }

    /// Create a reply addressed back to where `inbound` came from
    ///
    /// Falls back to the sender id when the transport has no thread id
    #[must_use]
    pub fn reply_to(inbound: &InboundMessage, text: impl Into<String>) -> Self {
        Self {
            channel_type: inbound.channel_type.clone(),
            instance: inbound.instance.clone(),
            thread_id: Some(
                inbound
                    .thread_id
                    .clone()
                    .unwrap_or_else(|| inbound.sender_id.clone()),
            ),
            text: text.into(),
        }
    }
}

/// Rich content routed to a display surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayContent {
    /// Content type, e.g. `markdown`, `html`, `chart`
    pub content_type: String,

    /// Content payload
    pub content: serde_json::Value,
}

impl DisplayContent {
    /// Create display content
    #[must_use]
    pub fn new(content_type: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            content_type: content_type.into(),
            content,
        }
    }

    /// Plain-text rendering for chat-only channels
    #[must_use]
    pub fn as_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Configuration of one channel instance
///
/// `type` selects the implementation; every other key is handed to it as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Instance name (the configuration key)
    #[serde(skip)]
    pub name: String,

    /// Channel kind to instantiate
    #[serde(rename = "type")]
    pub channel_type: ChannelType,

    /// Adapter-specific settings
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl ChannelSpec {
    /// Create a spec with no adapter-specific settings
    #[must_use]
    pub fn new(name: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            name: name.into(),
            channel_type,
            settings: serde_json::Map::new(),
        }
    }

    /// Add a setting
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }

    /// String setting
    #[must_use]
    pub fn str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(serde_json::Value::as_str)
    }

    /// Unsigned integer setting
    #[must_use]
    pub fn u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(serde_json::Value::as_u64)
    }

    /// Boolean setting
    #[must_use]
    pub fn bool(&self, key: &str) -> Option<bool> {
        self.settings.get(key).and_then(serde_json::Value::as_bool)
    }

    /// String list setting
    #[must_use]
    pub fn strings(&self, key: &str) -> Vec<String> {
        self.settings
            .get(key)
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Future resolving to an optional reply for an inbound message
pub type ReplyFuture = BoxFuture<'static, Option<String>>;

/// Receives inbound messages from every channel
///
/// The daemon supplies one handler per channel before it is started. The
/// call itself must accept the message synchronously (so arrival order is
/// fixed at call time); the returned future resolves to the reply.
pub trait InboundHandler: Send + Sync {
    /// Accept a message; the resolved text is sent back on the same transport
    fn on_message(&self, message: InboundMessage) -> ReplyFuture;
}

impl<F> InboundHandler for F
where
    F: Fn(InboundMessage) -> ReplyFuture + Send + Sync,
{
    fn on_message(&self, message: InboundMessage) -> ReplyFuture {
        self(message)
    }
}

/// Handle given to a transport for pushing inbound messages
#[derive(Clone)]
pub struct InboundSink {
    channel_type: ChannelType,
    instance: Arc<str>,
    handler: Arc<dyn InboundHandler>,
    state: Arc<Mutex<ChannelState>>,
    send_timeout: Duration,
}

impl InboundSink {
    /// Create a sink for a channel instance
    ///
    /// A sink made this way is not tied to a [`Channel`], so replies through
    /// [`InboundSink::spawn_reply`] are always attempted.
    #[must_use]
    pub fn new(channel_type: ChannelType, instance: &str, handler: Arc<dyn InboundHandler>) -> Self {
        Self {
            channel_type,
            instance: Arc::from(instance),
            handler,
            state: Arc::new(Mutex::new(ChannelState::Running)),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
        }
    }

    fn attached(mut self, state: Arc<Mutex<ChannelState>>, send_timeout: Duration) -> Self {
        self.state = state;
        self.send_timeout = send_timeout;
        self
    }

    /// Instance name this sink belongs to
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Build an inbound message stamped with this channel's identity
    #[must_use]
    pub fn message(
        &self,
        sender_id: impl Into<String>,
        sender_label: impl Into<String>,
        text: impl Into<String>,
        thread_id: Option<String>,
    ) -> InboundMessage {
        InboundMessage {
            channel_type: self.channel_type.clone(),
            instance: self.instance.to_string(),
            sender_id: sender_id.into(),
            sender_label: sender_label.into(),
            text: text.into(),
            thread_id,
            received_at: Utc::now(),
        }
    }

    /// Hand a message to the gateway
    ///
    /// Acceptance happens before this returns, so calling `dispatch` in
    /// arrival order preserves that order even if the returned futures are
    /// awaited on separate tasks. A panicking handler is contained here and
    /// treated as "no reply".
    pub fn dispatch(&self, message: InboundMessage) -> ReplyFuture {
        let instance = Arc::clone(&self.instance);
        let sender = message.sender_id.clone();
        let handler = Arc::clone(&self.handler);

        match std::panic::catch_unwind(AssertUnwindSafe(move || handler.on_message(message))) {
            Ok(reply) => async move {
                match AssertUnwindSafe(reply).catch_unwind().await {
                    Ok(reply) => reply,
                    Err(_) => {
                        tracing::error!(channel = %instance, sender = %sender, "inbound handler panicked");
                        None
                    }
                }
            }
            .boxed(),
            Err(_) => {
                tracing::error!(channel = %instance, sender = %sender, "inbound handler panicked");
                futures::future::ready(None).boxed()
            }
        }
    }

    /// Deliver the reply to a dispatched message on its own task
    ///
    /// Transports whose receive loop answers through a private path use this
    /// instead of calling the transport directly. The reply gets the same
    /// treatment as [`Channel::send`]: dropped unless the channel is open,
    /// bounded by the channel's send timeout, and logged when it fails.
    pub fn spawn_reply<F, Fut>(&self, reply: ReplyFuture, deliver: F)
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        let state = Arc::clone(&self.state);
        let limit = self.send_timeout;

        tokio::spawn(async move {
            let Some(text) = reply.await else {
                return;
            };
            let current = *state.lock().unwrap_or_else(PoisonError::into_inner);
            if !matches!(current, ChannelState::Starting | ChannelState::Running) {
                tracing::debug!(channel = %instance, state = %current, "dropping reply on inactive channel");
                return;
            }
            if let Err(e) = bounded(limit, "reply", deliver(text)).await {
                tracing::warn!(channel = %instance, error = %e, "reply failed");
            }
        });
    }
}

/// Transport-specific half of a channel adapter
///
/// Implementations must be safe to `deliver` from several producers at once;
/// serialize internally if the underlying transport requires it.
#[async_trait]
pub trait Transport: Any + Send + Sync {
    /// Declare which capabilities this transport instance supports
    fn capabilities(&self) -> Vec<ChannelCapability> {
        Vec::new()
    }

    /// Connect and begin receiving
    ///
    /// Long-running receive loops must be spawned, not awaited here.
    async fn open(&self, inbound: InboundSink) -> Result<()>;

    /// Release the connection, subprocess or listener
    async fn close(&self) -> Result<()>;

    /// Deliver a message
    async fn deliver(&self, message: &OutboundMessage) -> Result<()>;

    /// Render display content
    ///
    /// Default implementation delivers the plain-text rendering
    async fn render(&self, _content: &DisplayContent, message: &OutboundMessage) -> Result<()> {
        self.deliver(message).await
    }
}

/// Constructor producing a transport for a configured instance
pub type ChannelFactory = Arc<dyn Fn(&ChannelSpec) -> Result<Box<dyn Transport>> + Send + Sync>;

/// Timeouts bounding every blocking lifecycle call
#[derive(Debug, Clone, Copy)]
pub struct ChannelTimeouts {
    pub send: Duration,
    pub start: Duration,
    pub stop_grace: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            send: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
            start: Duration::from_secs(DEFAULT_START_TIMEOUT_SECS),
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
        }
    }
}

impl ChannelTimeouts {
    /// Read overrides from `send_timeout_secs`, `start_timeout_secs`, `stop_grace_secs`
    #[must_use]
    pub fn from_spec(spec: &ChannelSpec) -> Self {
        let defaults = Self::default();
        Self {
            send: spec
                .u64("send_timeout_secs")
                .map_or(defaults.send, Duration::from_secs),
            start: spec
                .u64("start_timeout_secs")
                .map_or(defaults.start, Duration::from_secs),
            stop_grace: spec
                .u64("stop_grace_secs")
                .map_or(defaults.stop_grace, Duration::from_secs),
        }
    }
}

/// A configured channel instance with an enforced lifecycle
///
/// `start`, `stop`, `send` and `display` never return errors: failures are
/// logged and reflected in [`ChannelState`] or a `false` result.
pub struct Channel {
    name: String,
    channel_type: ChannelType,
    timeouts: ChannelTimeouts,
    transport: Box<dyn Transport>,
    state: Arc<Mutex<ChannelState>>,
    handler: OnceLock<Arc<dyn InboundHandler>>,
    stop_requested: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Channel {
    /// Wrap a transport built for `spec`
    #[must_use]
    pub fn new(spec: &ChannelSpec, transport: Box<dyn Transport>) -> Self {
        Self {
            name: spec.name.clone(),
            channel_type: spec.channel_type.clone(),
            timeouts: ChannelTimeouts::from_spec(spec),
            transport,
            state: Arc::new(Mutex::new(ChannelState::Stopped)),
            handler: OnceLock::new(),
            stop_requested: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Instance name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel kind
    #[must_use]
    pub const fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Capabilities of the underlying transport
    #[must_use]
    pub fn capabilities(&self) -> Vec<ChannelCapability> {
        self.transport.capabilities()
    }

    /// Whether this instance is a canvas surface, by name or by capability
    #[must_use]
    pub fn is_canvas(&self) -> bool {
        self.name.to_lowercase().contains("canvas")
            || self.capabilities().contains(&ChannelCapability::Canvas)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the channel is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ChannelState::Running
    }

    /// Most recent start/stop failure, if any
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether an inbound handler has been installed
    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.handler.get().is_some()
    }

    /// Borrow the transport as a concrete type
    #[must_use]
    pub fn transport<T: Transport>(&self) -> Option<&T> {
        let any: &dyn Any = self.transport.as_ref();
        any.downcast_ref::<T>()
    }

    /// Install the inbound handler; may only be done once
    ///
    /// # Errors
    ///
    /// Returns error if a handler is already installed
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        self.handler
            .set(handler)
            .map_err(|_| Error::Channel(format!("{}: inbound handler already set", self.name)))
    }

    /// Start the channel
    ///
    /// Returns true if the channel is running afterwards. A failed start
    /// leaves the channel in [`ChannelState::Failed`] and affects nothing else.
    pub async fn start(&self) -> bool {
        let starting = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, ChannelState::Stopped | ChannelState::Failed) {
                // Cleared under the lock so a stop() seen in Starting is never lost
                self.stop_requested.store(false, Ordering::SeqCst);
                *state = ChannelState::Starting;
                true
            } else {
                false
            }
        };
        if !starting {
            tracing::debug!(channel = %self.name, state = %self.state(), "start ignored");
            return self.is_running();
        }

        let Some(handler) = self.handler.get().cloned() else {
            self.fail(&Error::AdapterStart("no inbound handler set".to_string()));
            return false;
        };

        tracing::info!(channel = %self.name, kind = %self.channel_type, "starting channel");
        let sink = InboundSink::new(self.channel_type.clone(), &self.name, handler)
            .attached(Arc::clone(&self.state), self.timeouts.send);
        let opened = bounded(self.timeouts.start, "start", self.transport.open(sink)).await;

        if let Err(e) = opened {
            self.fail(&e);
            // Release whatever the transport acquired before failing
            if let Err(e) = bounded(self.timeouts.stop_grace, "close", self.transport.close()).await {
                tracing::warn!(channel = %self.name, error = %e, "cleanup after failed start did not complete");
            }
            return false;
        }

        let stopped_meanwhile = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let requested = self.stop_requested.swap(false, Ordering::SeqCst);
            *state = if requested {
                ChannelState::Stopping
            } else {
                ChannelState::Running
            };
            requested
        };
        if stopped_meanwhile {
            tracing::info!(channel = %self.name, "stop requested during start");
            self.close_transport().await;
            return false;
        }

        tracing::info!(channel = %self.name, "channel running");
        true
    }

    /// Stop the channel
    ///
    /// A no-op when already stopped. Always returns within the stop grace
    /// period (plus the transport's own force-terminate margin).
    pub async fn stop(&self) {
        let proceed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ChannelState::Running => {
                    *state = ChannelState::Stopping;
                    true
                }
                ChannelState::Failed => {
                    *state = ChannelState::Stopped;
                    false
                }
                ChannelState::Starting => {
                    self.stop_requested.store(true, Ordering::SeqCst);
                    false
                }
                ChannelState::Stopped | ChannelState::Stopping => false,
            }
        };

        if proceed {
            tracing::info!(channel = %self.name, "stopping channel");
            self.close_transport().await;
        }
    }

    /// Send a message
    ///
    /// Returns false when the channel is not running, the transport fails,
    /// or the send exceeds its timeout.
    pub async fn send(&self, message: OutboundMessage) -> bool {
        if !self.is_running() {
            tracing::debug!(channel = %self.name, state = %self.state(), "send on inactive channel");
            return false;
        }

        match bounded(self.timeouts.send, "send", self.transport.deliver(&message)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(channel = %self.name, error = %e, "send failed");
                false
            }
        }
    }

    /// Render display content on this channel
    ///
    /// Returns false under the same conditions as [`Channel::send`]
    pub async fn display(&self, content: &DisplayContent) -> bool {
        if !self.is_running() {
            tracing::debug!(channel = %self.name, "display on inactive channel");
            return false;
        }

        let message = OutboundMessage::text(self.channel_type.clone(), &self.name, content.as_text());
        match bounded(
            self.timeouts.send,
            "display",
            self.transport.render(content, &message),
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(channel = %self.name, error = %e, "display failed");
                false
            }
        }
    }

    async fn close_transport(&self) {
        // Doubled so a process bridge can finish its own terminate-then-kill sequence
        let deadline = self.timeouts.stop_grace * 2;
        if let Err(e) = bounded(deadline, "stop", self.transport.close()).await {
            tracing::warn!(channel = %self.name, error = %e, "channel did not close cleanly");
        }
        self.set_state(ChannelState::Stopped);
        tracing::info!(channel = %self.name, "channel stopped");
    }

    fn fail(&self, error: &Error) {
        tracing::error!(channel = %self.name, kind = %self.channel_type, error = %error, "channel failed to start");
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
        self.set_state(ChannelState::Failed);
    }

    fn set_state(&self, next: ChannelState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("channel_type", &self.channel_type)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Run a transport call under a deadline, containing panics
async fn bounded<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>> + Send,
) -> Result<T> {
    match tokio::time::timeout(limit, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(Error::Channel(format!("transport panicked during {what}"))),
        Err(_) => Err(Error::Channel(format!("{what} timed out after {limit:?}"))),
    }
}
