//! Webhook channel endpoints
//!
//! `POST /webhooks/{instance}` submits a message and answers with the reply.
//! `GET /webhooks/{instance}/outbox` drains messages queued for instances
//! without a callback URL. Both check the instance's `secret` when set.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use serde::Serialize;

use super::{ApiError, ApiState, bearer_token};
use crate::channels::{WebhookDelivery, WebhookPayload, WebhookTransport};

#[derive(Debug, Serialize)]
pub struct WebhookReply {
    pub reply: Option<String>,
}

fn webhook<'a>(state: &'a ApiState, instance: &str, headers: &HeaderMap) -> Result<&'a WebhookTransport, ApiError> {
    let transport = state
        .daemon
        .channel(instance)
        .and_then(|c| c.transport::<WebhookTransport>())
        .ok_or_else(|| ApiError::not_found(format!("webhook channel {instance}")))?;

    if !transport.accepts(bearer_token(headers)) {
        tracing::warn!(channel = %instance, "webhook call with invalid secret");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid webhook secret"));
    }
    Ok(transport)
}

/// Submit an inbound message and wait for the reply
async fn receive(
    State(state): State<Arc<ApiState>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> Result<Json<WebhookReply>, ApiError> {
    let reply = webhook(&state, &instance, &headers)?.receive(payload)?;
    Ok(Json(WebhookReply { reply: reply.await }))
}

/// Take queued outbound messages
async fn outbox(
    State(state): State<Arc<ApiState>>,
    Path(instance): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<WebhookDelivery>>, ApiError> {
    Ok(Json(webhook(&state, &instance, &headers)?.drain_outbox()))
}

/// Build webhook router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/{instance}", post(receive))
        .route("/{instance}/outbox", get(outbox))
        .with_state(state)
}
