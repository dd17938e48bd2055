//! Backend conversation engine interface
//!
//! The switchboard does not generate replies itself. Approved messages are
//! handed to a [`Backend`] together with the session they belong to.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::channels::InboundMessage;
use crate::{Error, Result};

/// Who produced a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// Session state handed to the backend with each message
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    /// Stable id of the session; a new id means a fresh conversation
    pub session_id: String,
    /// Earlier turns, oldest first, excluding the current message
    pub history: Vec<Turn>,
}

/// Produces replies for approved inbound messages
#[async_trait]
pub trait Backend: Send + Sync {
    /// Respond to a message; `None` means no reply
    async fn respond(&self, message: &InboundMessage, session: &SessionContext) -> Result<Option<String>>;
}

/// Replies with the message text; used when no backend is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoBackend;

#[async_trait]
impl Backend for EchoBackend {
    async fn respond(&self, message: &InboundMessage, _session: &SessionContext) -> Result<Option<String>> {
        Ok(Some(message.text.clone()))
    }
}

#[derive(Serialize)]
struct BackendRequest<'a> {
    session_id: &'a str,
    channel_type: &'a str,
    instance: &'a str,
    sender_id: &'a str,
    sender_label: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
    history: &'a [Turn],
}

#[derive(Deserialize)]
struct BackendResponse {
    #[serde(default)]
    reply: Option<String>,
}

/// Backend reached over HTTP
///
/// POSTs the message and session as JSON and expects `{"reply": "..."}`
/// (or `{"reply": null}` for no reply).
pub struct HttpBackend {
    client: Client,
    url: url::Url,
}

impl HttpBackend {
    /// Create a backend posting to `url`
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the client cannot be built
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = url::Url::parse(url).map_err(|e| Error::Config(format!("invalid backend url: {e}")))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn respond(&self, message: &InboundMessage, session: &SessionContext) -> Result<Option<String>> {
        let body = BackendRequest {
            session_id: &session.session_id,
            channel_type: message.channel_type.as_str(),
            instance: &message.instance,
            sender_id: &message.sender_id,
            sender_label: &message.sender_label,
            text: &message.text,
            thread_id: message.thread_id.as_deref(),
            history: &session.history,
        };

        let response = self.client.post(self.url.clone()).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Backend(format!("{status}: {text}")));
        }

        let parsed: BackendResponse = response.json().await?;
        Ok(parsed.reply.filter(|r| !r.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::channels::ChannelType;

    #[tokio::test]
    async fn echo_replies_with_text() {
        let message = InboundMessage {
            channel_type: ChannelType::WEB,
            instance: "web".to_string(),
            sender_id: "u1".to_string(),
            sender_label: "User".to_string(),
            text: "ping".to_string(),
            thread_id: None,
            received_at: Utc::now(),
        };
        let session = SessionContext {
            session_id: "s".to_string(),
            history: Vec::new(),
        };
        assert_eq!(
            EchoBackend.respond(&message, &session).await.unwrap().as_deref(),
            Some("ping")
        );
    }

    #[test]
    fn http_backend_rejects_bad_url() {
        assert!(HttpBackend::new("not a url", Duration::from_secs(1)).is_err());
        assert!(HttpBackend::new("http://localhost:9000/respond", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn response_reply_is_optional() {
        let parsed: BackendResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.reply.is_none());
        let parsed: BackendResponse = serde_json::from_str(r#"{"reply":"hi"}"#).unwrap();
        assert_eq!(parsed.reply.as_deref(), Some("hi"));
    }
}
