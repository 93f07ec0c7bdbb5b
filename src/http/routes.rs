//! Routes served behind the admission gate.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::middleware::{AdmissionLayer, HeaderPolicy};
use super::response::ErrorBody;
use crate::ratelimit::AdmissionPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Liveness probe on `/`.
pub async fn root() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
    })
}

/// Liveness probe on `/ping`.
pub async fn ping() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "OK".to_string(),
    })
}

/// Fallback for unknown paths.
pub async fn not_found() -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::NOT_FOUND, Json(ErrorBody::new("not found")))
}

/// Build the application router with every route gated by `policy`.
pub fn router<P>(policy: Arc<P>, headers: HeaderPolicy) -> Router
where
    P: AdmissionPolicy + 'static,
{
    Router::new()
        .route("/", get(root))
        .route("/ping", get(ping))
        .fallback(not_found)
        .layer(AdmissionLayer::new(policy).with_headers(headers))
        .layer(TraceLayer::new_for_http())
}
