//! WebSocket endpoint for web chat channels
//!
//! Clients connect to `/ws/{instance}`, receive every [`WebEvent`] the
//! instance publishes, and send chat text as
//! `{"text": "...", "thread_id": "..."}` frames (bare text is accepted too).
//! Replies to a client's own text are sent to that connection only.
//!
//! Each connection gets a server-assigned sender id. `?sender=<id>` is
//! honoured only on instances configured with `trust_sender_ids = true`.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use super::{ApiError, ApiState};
use crate::Error;
use crate::channels::{Channel, WebEvent, WebTransport};

/// Optional query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
struct WsQuery {
    sender: Option<String>,
}

/// Incoming chat frame
#[derive(Debug, Deserialize)]
struct WsIncoming {
    text: String,
    #[serde(default)]
    thread_id: Option<String>,
}

/// Outgoing frame for this connection only
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsOutgoing {
    Connected { instance: String, sender_id: String },
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        text: String,
    },
    Error { message: String },
}

impl WsIncoming {
    fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self {
            text: raw.to_string(),
            thread_id: None,
        })
    }
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/{instance}", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Path(instance): Path<String>,
    query: Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some((channel, trusted)) = state.daemon.channel(&instance).and_then(|c| {
        let trusted = c.transport::<WebTransport>()?.trusts_sender_ids();
        Some((Arc::clone(c), trusted))
    }) else {
        return ApiError::not_found(format!("web channel {instance}")).into_response();
    };

    let requested = query.0.sender.filter(|s| !s.trim().is_empty());
    if requested.is_some() && !trusted {
        tracing::debug!(channel = %instance, "ignoring client-supplied sender id");
    }
    let sender_id = requested
        .filter(|_| trusted)
        .unwrap_or_else(|| format!("web-{}", uuid::Uuid::new_v4()));

    ws.on_upgrade(move |socket| handle_socket(socket, channel, sender_id))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, channel: Arc<Channel>, sender_id: String) {
    let Some(mut events) = channel.transport::<WebTransport>().map(WebTransport::subscribe) else {
        return;
    };
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsOutgoing>(16);

    let _ = tx
        .send(WsOutgoing::Connected {
            instance: channel.name().to_string(),
            sender_id: sender_id.clone(),
        })
        .await;
    tracing::info!(channel = %channel.name(), sender = %sender_id, "web client connected");

    // Forward broadcast events and connection-local frames to the client
    let mut send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => serde_json::to_string(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "web client lagging, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(local) = rx.recv() => serde_json::to_string(&local),
            };
            let Ok(text) = text else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_channel = Arc::clone(&channel);
    let recv_sender = sender_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => submit(&recv_channel, &recv_sender, &text, &tx).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::info!(channel = %channel.name(), sender = %sender_id, "web client disconnected");
}

/// Submit one chat frame; the reply goes back on this connection only
async fn submit(channel: &Arc<Channel>, sender_id: &str, raw: &str, tx: &mpsc::Sender<WsOutgoing>) {
    let incoming = WsIncoming::parse(raw);
    if incoming.text.trim().is_empty() {
        return;
    }

    let Some(transport) = channel.transport::<WebTransport>() else {
        return;
    };

    let reply_tx = tx.clone();
    let thread_id = incoming.thread_id.clone();
    let submitted = transport.converse(sender_id, &incoming.text, incoming.thread_id, move |text| async move {
        reply_tx
            .send(WsOutgoing::Message { thread_id, text })
            .await
            .map_err(|_| Error::Channel("web client disconnected".to_string()))
    });

    if let Err(e) = submitted {
        let _ = tx.send(WsOutgoing::Error { message: e.to_string() }).await;
    }
}
