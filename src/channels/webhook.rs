//! Generic HTTP webhook channel
//!
//! Inbound messages arrive as `POST /webhooks/{instance}` and the reply is
//! returned in the response body. Outbound messages are POSTed to
//! `callback_url` when one is configured, otherwise they are kept in a bounded
//! outbox that clients drain over HTTP.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ChannelSpec, InboundSink, OutboundMessage, ReplyFuture, Transport};
use crate::{Error, Result};

/// Default number of undelivered messages kept without a callback
const DEFAULT_OUTBOX_CAPACITY: usize = 100;

/// Inbound webhook body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub sender_id: String,
    #[serde(default)]
    pub sender_label: Option<String>,
    pub text: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// Outbound body, posted to the callback or queued in the outbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub text: String,
}

/// Webhook transport
pub struct WebhookTransport {
    callback_url: Option<Url>,
    secret: Option<String>,
    client: Client,
    outbox: Mutex<VecDeque<WebhookDelivery>>,
    outbox_capacity: usize,
    inbound: Mutex<Option<InboundSink>>,
}

impl WebhookTransport {
    /// Build from channel settings
    ///
    /// Keys: `callback_url`, `secret`, `outbox_capacity`
    ///
    /// # Errors
    ///
    /// Returns error if `callback_url` is not a valid http(s) URL
    pub fn from_spec(spec: &ChannelSpec) -> Result<Self> {
        let callback_url = spec
            .str("callback_url")
            .map(|raw| {
                let url = Url::parse(raw)
                    .map_err(|e| Error::Config(format!("{}: invalid callback_url: {e}", spec.name)))?;
                if matches!(url.scheme(), "http" | "https") {
                    Ok(url)
                } else {
                    Err(Error::Config(format!(
                        "{}: callback_url must be http or https",
                        spec.name
                    )))
                }
            })
            .transpose()?;

        let outbox_capacity = spec
            .u64("outbox_capacity")
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_OUTBOX_CAPACITY)
            .max(1);

        Ok(Self {
            callback_url,
            secret: spec.str("secret").map(String::from),
            client: Client::new(),
            outbox: Mutex::new(VecDeque::new()),
            outbox_capacity,
            inbound: Mutex::new(None),
        })
    }

    /// Whether a request carrying `token` may post to this webhook
    ///
    /// Without a configured secret every request is accepted.
    #[must_use]
    pub fn accepts(&self, token: Option<&str>) -> bool {
        self.secret
            .as_deref()
            .is_none_or(|secret| token == Some(secret))
    }

    /// Accept an inbound webhook call
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not open
    pub fn receive(&self, payload: WebhookPayload) -> Result<ReplyFuture> {
        let inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        let sink = inbound
            .as_ref()
            .ok_or_else(|| Error::Channel("webhook channel is not open".to_string()))?;
        let label = payload
            .sender_label
            .unwrap_or_else(|| payload.sender_id.clone());
        let message = sink.message(payload.sender_id, label, payload.text, payload.thread_id);
        Ok(sink.dispatch(message))
    }

    /// Take every queued outbound message
    pub fn drain_outbox(&self) -> Vec<WebhookDelivery> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    fn enqueue(&self, delivery: WebhookDelivery) {
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        if outbox.len() >= self.outbox_capacity {
            outbox.pop_front();
            tracing::debug!(instance = %delivery.instance, "webhook outbox full, dropping oldest");
        }
        outbox.push_back(delivery);
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn open(&self, inbound: InboundSink) -> Result<()> {
        tracing::info!(
            instance = %inbound.instance(),
            callback = self.callback_url.as_ref().map(Url::as_str),
            "webhook channel ready"
        );
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        let delivery = WebhookDelivery {
            instance: message.instance.clone(),
            thread_id: message.thread_id.clone(),
            text: message.text.clone(),
        };

        let Some(url) = &self.callback_url else {
            self.enqueue(delivery);
            return Ok(());
        };

        let mut request = self.client.post(url.clone()).json(&delivery);
        if let Some(secret) = &self.secret {
            request = request.bearer_auth(secret);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Send(format!("webhook callback returned {status}: {body}")));
        }

        tracing::debug!(instance = %delivery.instance, "webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelType;

    fn spec() -> ChannelSpec {
        ChannelSpec::new("hook", ChannelType::WEBHOOK)
    }

    #[test]
    fn callback_url_is_validated() {
        assert!(WebhookTransport::from_spec(&spec().with("callback_url", "not a url")).is_err());
        assert!(WebhookTransport::from_spec(&spec().with("callback_url", "ftp://x.test/")).is_err());
        assert!(WebhookTransport::from_spec(&spec().with("callback_url", "https://x.test/hook")).is_ok());
    }

    #[test]
    fn secret_gates_inbound() {
        let open = WebhookTransport::from_spec(&spec()).unwrap();
        assert!(open.accepts(None));

        let guarded = WebhookTransport::from_spec(&spec().with("secret", "s3cret")).unwrap();
        assert!(!guarded.accepts(None));
        assert!(!guarded.accepts(Some("wrong")));
        assert!(guarded.accepts(Some("s3cret")));
    }

    #[tokio::test]
    async fn outbox_is_bounded() {
        let hook = WebhookTransport::from_spec(&spec().with("outbox_capacity", 2)).unwrap();
        for text in ["a", "b", "c"] {
            hook.deliver(&OutboundMessage::text(ChannelType::WEBHOOK, "hook", text))
                .await
                .unwrap();
        }

        let texts: Vec<_> = hook.drain_outbox().into_iter().map(|d| d.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert!(hook.drain_outbox().is_empty());
    }

    #[test]
    fn receive_before_open_fails() {
        let hook = WebhookTransport::from_spec(&spec()).unwrap();
        let payload = WebhookPayload {
            sender_id: "u1".to_string(),
            sender_label: None,
            text: "hi".to_string(),
            thread_id: None,
        };
        assert!(hook.receive(payload).is_err());
    }
}
