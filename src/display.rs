//! Display routing
//!
//! Rich content goes to a canvas surface when one is connected, otherwise
//! to exactly one chat channel as plain text. Content routed to a canvas
//! with an id is remembered so late-joining clients can be brought up to
//! date.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::channels::{Channel, DisplayContent, OutboundMessage};

/// Channel capacity for canvas state updates
const CHANNEL_CAPACITY: usize = 64;

/// Live channel instances in configuration order
pub type ChannelMap = IndexMap<String, Arc<Channel>>;

/// Optional routing metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayMetadata {
    /// Content id; the canvas entry with this id is created or replaced
    #[serde(default)]
    pub id: Option<String>,
}

/// Last content shown on a canvas under an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasStateEntry {
    pub content_type: String,
    pub content: serde_json::Value,
}

/// A change to canvas state
#[derive(Debug, Clone, Serialize)]
pub struct CanvasUpdate {
    pub id: String,
    pub entry: CanvasStateEntry,
}

/// Chooses the channel instance that renders display content
pub struct DisplayRouter {
    channels: Arc<ChannelMap>,
    state: Mutex<HashMap<String, CanvasStateEntry>>,
    tx: broadcast::Sender<CanvasUpdate>,
}

impl DisplayRouter {
    /// Route over a fixed set of channel instances
    #[must_use]
    pub fn new(channels: Arc<ChannelMap>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            channels,
            state: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Subscribe to canvas state changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CanvasUpdate> {
        self.tx.subscribe()
    }

    /// Show content on the best available surface
    ///
    /// Returns the instance the content was routed to, or `None` when no
    /// channel is connected. Never fails; delivery problems are logged.
    pub async fn display(&self, content: DisplayContent, metadata: Option<DisplayMetadata>) -> Option<String> {
        let running = || self.channels.values().filter(|c| c.is_running());

        if let Some(canvas) = running().find(|c| c.is_canvas()) {
            if let Some(id) = metadata.and_then(|m| m.id) {
                let entry = CanvasStateEntry {
                    content_type: content.content_type.clone(),
                    content: content.content.clone(),
                };
                self.state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.clone(), entry.clone());
                let _ = self.tx.send(CanvasUpdate { id, entry });
            }

            if !canvas.display(&content).await {
                tracing::warn!(channel = %canvas.name(), "canvas display failed");
            }
            return Some(canvas.name().to_string());
        }

        let Some(chat) = running().next() else {
            tracing::debug!(content_type = %content.content_type, "no connected channel for display content");
            return None;
        };

        let message = OutboundMessage::text(chat.channel_type().clone(), chat.name(), content.as_text());
        if !chat.send(message).await {
            tracing::warn!(channel = %chat.name(), "display fallback send failed");
        }
        Some(chat.name().to_string())
    }

    /// Canvas entry for a content id
    #[must_use]
    pub fn canvas_entry(&self, id: &str) -> Option<CanvasStateEntry> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Every canvas entry
    #[must_use]
    pub fn canvas_state(&self) -> HashMap<String, CanvasStateEntry> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::FutureExt;

    use super::*;
    use crate::Result;
    use crate::channels::{
        ChannelCapability, ChannelSpec, ChannelType, InboundMessage, InboundSink, ReplyFuture,
        Transport,
    };

    #[derive(Default)]
    struct Recording {
        canvas: bool,
        sent: Mutex<Vec<String>>,
        rendered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Recording {
        fn capabilities(&self) -> Vec<ChannelCapability> {
            if self.canvas {
                vec![ChannelCapability::Canvas]
            } else {
                Vec::new()
            }
        }

        async fn open(&self, _inbound: InboundSink) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message.text.clone());
            Ok(())
        }

        async fn render(&self, content: &DisplayContent, _message: &OutboundMessage) -> Result<()> {
            self.rendered.lock().unwrap().push(content.content_type.clone());
            Ok(())
        }
    }

    async fn channel(name: &str, canvas: bool, start: bool) -> Arc<Channel> {
        let spec = ChannelSpec::new(name, ChannelType::WEB);
        let channel = Channel::new(
            &spec,
            Box::new(Recording {
                canvas,
                ..Recording::default()
            }),
        );
        channel
            .set_handler(Arc::new(|_m: InboundMessage| -> ReplyFuture {
                futures::future::ready(None).boxed()
            }))
            .unwrap();
        if start {
            assert!(channel.start().await);
        }
        Arc::new(channel)
    }

    fn recording(channel: &Channel) -> &Recording {
        channel.transport::<Recording>().unwrap()
    }

    fn router(channels: &[Arc<Channel>]) -> DisplayRouter {
        let map = channels
            .iter()
            .map(|c| (c.name().to_string(), Arc::clone(c)))
            .collect();
        DisplayRouter::new(Arc::new(map))
    }

    fn chart() -> DisplayContent {
        DisplayContent::new("chart", serde_json::json!({"mark": "bar"}))
    }

    #[tokio::test]
    async fn canvas_named_channel_gets_content_exclusively() {
        let chat = channel("chat", false, true).await;
        let canvas = channel("main-canvas", false, true).await;
        let router = router(&[Arc::clone(&chat), Arc::clone(&canvas)]);

        let target = router
            .display(chart(), Some(DisplayMetadata { id: Some("c1".to_string()) }))
            .await;

        assert_eq!(target.as_deref(), Some("main-canvas"));
        assert_eq!(*recording(&canvas).rendered.lock().unwrap(), vec!["chart"]);
        assert!(recording(&chat).sent.lock().unwrap().is_empty());
        assert!(recording(&chat).rendered.lock().unwrap().is_empty());
        assert_eq!(router.canvas_entry("c1").unwrap().content_type, "chart");
    }

    #[tokio::test]
    async fn canvas_capability_counts_and_entries_are_overwritten() {
        let surface = channel("surface", true, true).await;
        let router = router(&[Arc::clone(&surface)]);
        let mut updates = router.subscribe();

        let meta = || Some(DisplayMetadata { id: Some("x".to_string()) });
        router.display(chart(), meta()).await;
        router
            .display(DisplayContent::new("markdown", serde_json::json!("# hi")), meta())
            .await;

        assert_eq!(router.canvas_state().len(), 1);
        assert_eq!(router.canvas_entry("x").unwrap().content_type, "markdown");
        assert_eq!(updates.recv().await.unwrap().entry.content_type, "chart");
    }

    #[tokio::test]
    async fn without_canvas_exactly_one_chat_gets_text() {
        let first = channel("first", false, true).await;
        let second = channel("second", false, true).await;
        let router = router(&[Arc::clone(&first), Arc::clone(&second)]);

        let target = router
            .display(DisplayContent::new("text", serde_json::json!("hello")), None)
            .await;

        assert_eq!(target.as_deref(), Some("first"));
        assert_eq!(*recording(&first).sent.lock().unwrap(), vec!["hello"]);
        assert!(recording(&second).sent.lock().unwrap().is_empty());
        assert!(router.canvas_state().is_empty());
    }

    #[tokio::test]
    async fn stopped_channels_are_skipped() {
        let canvas = channel("canvas", false, false).await;
        let chat = channel("chat", false, true).await;
        let router = router(&[Arc::clone(&canvas), Arc::clone(&chat)]);

        assert_eq!(router.display(chart(), None).await.as_deref(), Some("chat"));
        assert!(recording(&canvas).rendered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_channels_is_a_silent_noop() {
        let router = router(&[]);
        assert!(router.display(chart(), None).await.is_none());

        let idle = channel("idle", false, false).await;
        let router = self::router(&[idle]);
        assert!(router.display(chart(), None).await.is_none());
    }
}
