//! Web chat channel
//!
//! Browser clients connect over WebSocket (`/ws/{instance}`). Operator sends
//! and display events are broadcast to every connected client. Replies to a
//! client's own text go back to that client only, through
//! [`WebTransport::converse`]. With `canvas = true` the instance is a canvas
//! surface for rich display content.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{
    ChannelCapability, ChannelSpec, DisplayContent, InboundSink, OutboundMessage, Transport,
};
use crate::{Error, Result};

/// Channel capacity for web events
const CHANNEL_CAPACITY: usize = 64;

/// Event pushed to web clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebEvent {
    /// Chat text
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        text: String,
    },
    /// Rich content for canvas clients
    Display {
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        content_type: String,
        content: serde_json::Value,
    },
}

/// Broadcast-based web chat transport
pub struct WebTransport {
    canvas: bool,
    trust_sender_ids: bool,
    tx: broadcast::Sender<WebEvent>,
    inbound: Mutex<Option<InboundSink>>,
}

impl WebTransport {
    /// Create a web transport
    #[must_use]
    pub fn new(canvas: bool) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            canvas,
            trust_sender_ids: false,
            tx,
            inbound: Mutex::new(None),
        }
    }

    /// Build from channel settings (`canvas`, `trust_sender_ids`)
    #[must_use]
    pub fn from_spec(spec: &ChannelSpec) -> Self {
        Self::new(spec.bool("canvas").unwrap_or(false))
            .with_trusted_sender_ids(spec.bool("trust_sender_ids").unwrap_or(false))
    }

    /// Accept client-supplied sender ids
    ///
    /// Only for deployments where a fronting proxy authenticates clients;
    /// otherwise every connection gets a server-assigned id.
    #[must_use]
    pub const fn with_trusted_sender_ids(mut self, trust: bool) -> Self {
        self.trust_sender_ids = trust;
        self
    }

    /// Whether client-supplied sender ids are honoured
    #[must_use]
    pub const fn trusts_sender_ids(&self) -> bool {
        self.trust_sender_ids
    }

    /// Subscribe to outbound events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WebEvent> {
        self.tx.subscribe()
    }

    /// Number of connected clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Submit a client message and hand the reply to `deliver`
    ///
    /// The reply is never broadcast; `deliver` decides who sees it. Delivery
    /// follows the channel lifecycle and send timeout like any other reply.
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not open
    pub fn converse<F, Fut>(
        &self,
        sender_id: &str,
        text: &str,
        thread_id: Option<String>,
        deliver: F,
    ) -> Result<()>
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let sink = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::Channel("web channel is not open".to_string()))?;
        let reply = sink.dispatch(sink.message(sender_id, sender_id, text, thread_id));
        sink.spawn_reply(reply, deliver);
        Ok(())
    }

    fn publish(&self, event: WebEvent) {
        // No subscribers is not an error for a broadcast surface
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl Transport for WebTransport {
    fn capabilities(&self) -> Vec<ChannelCapability> {
        if self.canvas {
            vec![ChannelCapability::Canvas]
        } else {
            Vec::new()
        }
    }

    async fn open(&self, inbound: InboundSink) -> Result<()> {
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        self.publish(WebEvent::Message {
            thread_id: message.thread_id.clone(),
            text: message.text.clone(),
        });
        Ok(())
    }

    async fn render(&self, content: &DisplayContent, message: &OutboundMessage) -> Result<()> {
        if !self.canvas {
            return self.deliver(message).await;
        }
        self.publish(WebEvent::Display {
            thread_id: message.thread_id.clone(),
            content_type: content.content_type.clone(),
            content: content.content.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::FutureExt;

    use super::*;
    use crate::channels::{ChannelType, InboundMessage, ReplyFuture};

    fn echo_sink() -> InboundSink {
        InboundSink::new(
            ChannelType::WEB,
            "web",
            Arc::new(|m: InboundMessage| -> ReplyFuture {
                futures::future::ready(Some(format!("echo: {}", m.text))).boxed()
            }),
        )
    }

    #[tokio::test]
    async fn deliver_broadcasts_to_subscribers() {
        let web = WebTransport::new(false);
        let mut rx = web.subscribe();
        assert_eq!(web.client_count(), 1);

        web.deliver(&OutboundMessage::text(ChannelType::WEB, "web", "hi"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            WebEvent::Message { text, .. } => assert_eq!(text, "hi"),
            WebEvent::Display { .. } => panic!("expected message"),
        }
    }

    #[tokio::test]
    async fn canvas_renders_display_events() {
        let web = WebTransport::new(true);
        assert_eq!(web.capabilities(), vec![ChannelCapability::Canvas]);
        let mut rx = web.subscribe();

        let content = DisplayContent::new("markdown", serde_json::json!("# Title"));
        let message = OutboundMessage::text(ChannelType::WEB, "web", content.as_text());
        web.render(&content, &message).await.unwrap();

        match rx.recv().await.unwrap() {
            WebEvent::Display { content_type, .. } => assert_eq!(content_type, "markdown"),
            WebEvent::Message { .. } => panic!("expected display"),
        }
    }

    fn forward_to(tx: tokio::sync::mpsc::Sender<String>) -> impl FnOnce(String) -> futures::future::BoxFuture<'static, Result<()>> + Send + 'static {
        move |text| {
            async move { tx.send(text).await.map_err(|e| Error::Channel(e.to_string())) }.boxed()
        }
    }

    #[tokio::test]
    async fn converse_requires_open_channel() {
        let web = WebTransport::new(false);
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        assert!(web.converse("u1", "hello", None, forward_to(tx.clone())).is_err());

        web.open(echo_sink()).await.unwrap();
        web.converse("u1", "hello", None, forward_to(tx.clone())).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("echo: hello"));

        web.close().await.unwrap();
        assert!(web.converse("u1", "hello", None, forward_to(tx)).is_err());
    }

    #[tokio::test]
    async fn conversation_replies_are_not_broadcast() {
        let web = WebTransport::new(false);
        let mut everyone = web.subscribe();
        web.open(echo_sink()).await.unwrap();

        let (tx, mut own) = tokio::sync::mpsc::channel(1);
        web.converse("u1", "secret", None, forward_to(tx)).unwrap();

        assert_eq!(own.recv().await.as_deref(), Some("echo: secret"));
        assert!(matches!(
            everyone.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn sender_ids_are_untrusted_by_default() {
        let web = WebTransport::new(false);
        assert!(!web.trusts_sender_ids());
        assert!(web.with_trusted_sender_ids(true).trusts_sender_ids());
    }

    #[test]
    fn events_serialize_tagged() {
        let value = serde_json::to_value(WebEvent::Message {
            thread_id: None,
            text: "x".to_string(),
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"type": "message", "text": "x"}));
    }
}
