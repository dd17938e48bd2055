//! Admin API endpoints
//!
//! Mounted under `/api` behind the admin bearer token and the rate limiter.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiState, auth::require_admin_token, rate_limit::rate_limit_middleware};
use crate::channels::{ChannelType, DisplayContent};
use crate::daemon::{ChannelStatus, DaemonStatus};
use crate::display::DisplayMetadata;
use crate::registry::Provenance;
use crate::security::{SenderEvent, SenderRecord};
use crate::sessions::{SessionInfo, SessionKey};

// --- Request/Response types ---

#[derive(Serialize)]
pub struct ChannelTypeInfo {
    pub name: String,
    pub provenance: Provenance,
}

#[derive(Serialize)]
pub struct ChannelsResponse {
    pub instances: Vec<ChannelStatus>,
    pub types: Vec<ChannelTypeInfo>,
}

#[derive(Deserialize)]
pub struct SendersQuery {
    pub channel: Option<String>,
}

#[derive(Serialize)]
pub struct SenderResponse {
    #[serde(flatten)]
    pub record: SenderRecord,
    pub events: Vec<SenderEvent>,
}

#[derive(Deserialize)]
pub struct ApproveCodeRequest {
    pub channel: String,
    pub code: String,
}

#[derive(Deserialize)]
pub struct DisplayRequest {
    pub content_type: String,
    pub content: serde_json::Value,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Serialize)]
pub struct DisplayResponse {
    /// Instance the content was routed to
    pub target: Option<String>,
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub types: Vec<String>,
}

// --- Handlers ---

/// Configured instances and discovered channel types
async fn list_channels(State(state): State<Arc<ApiState>>) -> Json<ChannelsResponse> {
    let catalog = state.daemon.catalog().snapshot();
    let types = catalog
        .names()
        .filter_map(|name| {
            catalog.provenance(name).map(|p| ChannelTypeInfo {
                name: name.to_string(),
                provenance: p.clone(),
            })
        })
        .collect();

    Json(ChannelsResponse {
        instances: state.daemon.status().channels,
        types,
    })
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<DaemonStatus> {
    Json(state.daemon.status())
}

async fn list_sessions(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionInfo>> {
    Json(state.daemon.sessions().list_sessions())
}

/// Close a session; the next message from the sender starts fresh
async fn close_session(
    State(state): State<Arc<ApiState>>,
    Path((instance, sender)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.daemon.sessions().close_session(&SessionKey::new(instance, sender)) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("session"))
    }
}

async fn list_senders(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SendersQuery>,
) -> Result<Json<Vec<SenderRecord>>, ApiError> {
    let channel = query.channel.map(ChannelType::new);
    Ok(Json(state.daemon.senders().list(channel.as_ref())?))
}

async fn get_sender(
    State(state): State<Arc<ApiState>>,
    Path((channel, sender)): Path<(String, String)>,
) -> Result<Json<SenderResponse>, ApiError> {
    let channel = ChannelType::new(channel);
    let store = state.daemon.senders();
    let record = store
        .get(&channel, &sender)?
        .ok_or_else(|| ApiError::not_found(format!("sender {channel}/{sender}")))?;
    let events = store.events(&channel, &sender)?;
    Ok(Json(SenderResponse { record, events }))
}

/// Approve, block or unblock a sender
async fn sender_action(
    State(state): State<Arc<ApiState>>,
    Path((channel, sender, action)): Path<(String, String, String)>,
) -> Result<Json<SenderRecord>, ApiError> {
    let channel = ChannelType::new(channel);
    let store = state.daemon.senders();
    let record = match action.as_str() {
        "approve" => store.approve(&channel, &sender).await?,
        "block" => store.block(&channel, &sender).await?,
        "unblock" => store.unblock(&channel, &sender).await?,
        other => return Err(ApiError::not_found(format!("action {other}"))),
    };
    tracing::info!(channel = %channel, sender = %sender, action = %action, "sender updated by operator");
    Ok(Json(record))
}

/// Approve whichever pending sender holds a code
async fn approve_code(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ApproveCodeRequest>,
) -> Result<Json<SenderRecord>, ApiError> {
    let channel = ChannelType::new(req.channel);
    state
        .daemon
        .senders()
        .approve_code(&channel, &req.code)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no pending sender holds that code"))
}

async fn display(State(state): State<Arc<ApiState>>, Json(req): Json<DisplayRequest>) -> Json<DisplayResponse> {
    let content = DisplayContent::new(req.content_type, req.content);
    let metadata = req.id.map(|id| DisplayMetadata { id: Some(id) });
    let target = state.daemon.display().display(content, metadata).await;
    Json(DisplayResponse { target })
}

async fn reload_registry(State(state): State<Arc<ApiState>>) -> Json<ReloadResponse> {
    Json(ReloadResponse {
        types: state.daemon.reload_registry(),
    })
}

/// Build admin router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/channels", get(list_channels))
        .route("/status", get(status))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{instance}/{sender}", delete(close_session))
        .route("/senders", get(list_senders))
        .route("/senders/{channel}/{sender}", get(get_sender))
        .route("/senders/{channel}/{sender}/{action}", post(sender_action))
        .route("/pairing/approve", post(approve_code))
        .route("/display", post(display))
        .route("/registry/reload", post(reload_registry))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), require_admin_token))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit_middleware))
        .with_state(state)
}
