//! Admin token authentication middleware

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;

use super::{ApiState, bearer_token};

/// Middleware to verify the admin bearer token
///
/// Fails closed: without a configured token every request is rejected.
pub async fn require_admin_token(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = &state.admin_token else {
        tracing::warn!("admin token not configured - rejecting admin request");
        return Err(StatusCode::UNAUTHORIZED);
    };

    match bearer_token(req.headers()) {
        Some(token) if token == expected.expose_secret() => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("invalid admin token provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::debug!("no admin token provided");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
