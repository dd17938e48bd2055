//! HTTP API server for the switchboard
//!
//! Always mounted: `/health`, `/webhooks/{instance}` and `/ws/{instance}`.
//! The admin API under `/api` is mounted only when an admin token is
//! configured.

pub mod admin;
mod auth;
pub mod health;
pub mod rate_limit;
pub mod webhooks;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use secrecy::SecretString;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{Daemon, Error};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub daemon: Arc<Daemon>,
    pub admin_token: Option<SecretString>,
    pub limiter: rate_limit::SharedLimiter,
}

impl ApiState {
    /// State for `daemon` using its server configuration
    #[must_use]
    pub fn new(daemon: Arc<Daemon>) -> Self {
        let server = &daemon.config().server;
        Self {
            admin_token: server.admin_token.clone(),
            limiter: rate_limit::create_limiter(server.requests_per_minute),
            daemon,
        }
    }
}

/// Build the router with all routes
pub fn router(daemon: Arc<Daemon>) -> Router {
    let state = Arc::new(ApiState::new(daemon));

    let mut router = Router::new()
        .merge(health::router())
        .nest("/webhooks", webhooks::router(Arc::clone(&state)))
        .nest("/ws", websocket::router(Arc::clone(&state)));

    if state.admin_token.is_some() {
        router = router.nest("/api", admin::router(Arc::clone(&state)));
    } else {
        tracing::info!("admin token not configured, admin API disabled");
    }

    // CORS layer for cross-origin requests from web clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router.layer(cors).layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Error returned by handlers
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(what) => Self::not_found(what),
            Error::Auth(msg) => Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Error::Channel(msg) => Self::new(StatusCode::SERVICE_UNAVAILABLE, "channel_unavailable", msg),
            other => {
                tracing::error!(error = %other, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Extract a bearer token from the Authorization header
pub(crate) fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
