//! Signal channel adapter
//!
//! Drives `signal-cli -a <account> jsonRpc` over the process bridge. The
//! binary is an optional dependency: if it is not installed, start fails and
//! the channel stays inert.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;

use super::process::{ProcessBridge, ProcessConfig};
use super::{ChannelSpec, InboundSink, OutboundMessage, Transport};
use crate::{Error, Result};

/// Default signal-cli executable name
const SIGNAL_CLI: &str = "signal-cli";

/// Signal transport over signal-cli's JSON-RPC mode
pub struct SignalTransport {
    account: String,
    default_recipient: Option<String>,
    bridge: Arc<ProcessBridge>,
    next_id: Arc<AtomicU64>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SignalTransport {
    /// Build from channel settings
    ///
    /// Keys: `account` (required), `cli_path`, `default_recipient`
    ///
    /// # Errors
    ///
    /// Returns error if `account` is missing
    pub fn from_spec(spec: &ChannelSpec) -> Result<Self> {
        let account = spec
            .str("account")
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::Config(format!("{}: signal account required", spec.name)))?
            .to_string();
        let program = spec.str("cli_path").unwrap_or(SIGNAL_CLI);
        let grace = spec.u64("stop_grace_secs").map_or(Duration::from_secs(5), Duration::from_secs);

        let config = ProcessConfig::new(program)
            .args(["-a", account.as_str(), "jsonRpc"])
            .grace(grace);

        Ok(Self {
            account,
            default_recipient: spec.str("default_recipient").map(String::from),
            bridge: Arc::new(ProcessBridge::new(config)),
            next_id: Arc::new(AtomicU64::new(1)),
            pump: std::sync::Mutex::new(None),
        })
    }

    /// Registered account number
    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    fn send_request(
        next_id: &AtomicU64,
        recipient: &str,
        text: &str,
    ) -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "send",
            "id": next_id.fetch_add(1, Ordering::Relaxed),
            "params": {
                "recipient": [recipient],
                "message": text,
            }
        })
    }
}

#[async_trait]
impl Transport for SignalTransport {
    async fn open(&self, inbound: InboundSink) -> Result<()> {
        let mut lines = self.bridge.spawn().await?;

        let bridge = Arc::clone(&self.bridge);
        let next_id = Arc::clone(&self.next_id);
        let pump = tokio::spawn(async move {
            while let Some(value) = lines.recv().await {
                let Ok(notification) = serde_json::from_value::<RpcNotification>(value) else {
                    continue;
                };
                if notification.method.as_deref() != Some("receive") {
                    continue;
                }
                let Some(params) = notification.params else {
                    continue;
                };
                let Some(message) = params.envelope.into_message() else {
                    continue;
                };

                let label = message.source_name.clone().unwrap_or_else(|| message.source.clone());
                let inbound_message = inbound.message(message.source.clone(), label, message.text, None);
                let reply = inbound.dispatch(inbound_message);

                let bridge = Arc::clone(&bridge);
                let next_id = Arc::clone(&next_id);
                let recipient = message.source;
                inbound.spawn_reply(reply, move |text| async move {
                    let request = Self::send_request(&next_id, &recipient, &text);
                    bridge.send(&request).await
                });
            }
            tracing::debug!("signal-cli output closed");
        });

        *self.pump.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pump);
        tracing::info!(account = %self.account, "Signal channel connected");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.bridge.terminate().await;
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        tracing::info!(account = %self.account, "Signal channel disconnected");
        Ok(())
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        let recipient = message
            .thread_id
            .as_deref()
            .or(self.default_recipient.as_deref())
            .ok_or_else(|| Error::Send("Signal message has no recipient".to_string()))?;

        let request = Self::send_request(&self.next_id, recipient, &message.text);
        self.bridge.send(&request).await?;
        tracing::debug!(to = recipient, "Signal message sent");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RpcNotification {
    method: Option<String>,
    params: Option<ReceiveParams>,
}

#[derive(Debug, Deserialize)]
struct ReceiveParams {
    envelope: SignalEnvelope,
}

/// Signal message envelope
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub source: Option<String>,
    pub source_number: Option<String>,
    pub source_uuid: Option<String>,
    pub source_name: Option<String>,
    pub data_message: Option<SignalDataMessage>,
}

/// Data message payload inside a Signal envelope
#[derive(Debug, Clone, Deserialize)]
pub struct SignalDataMessage {
    pub message: Option<String>,
}

/// Text message flattened out of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub source: String,
    pub source_name: Option<String>,
    pub text: String,
}

impl SignalEnvelope {
    /// Flatten into a text message, skipping receipts, typing indicators and
    /// empty messages
    #[must_use]
    pub fn into_message(self) -> Option<SignalMessage> {
        let text = self.data_message?.message.filter(|t| !t.is_empty())?;
        let source = self.source_number.or(self.source).or(self.source_uuid)?;
        Some(SignalMessage {
            source,
            source_name: self.source_name,
            text,
        })
    }
}
