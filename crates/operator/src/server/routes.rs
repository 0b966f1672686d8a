use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use super::Readiness;
use crate::metrics::gather_metrics;

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn readyz(State(readiness): State<Readiness>) -> Response {
    if readiness.is_ready() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "controllers not started").into_response()
    }
}

pub async fn metrics() -> Response {
    match gather_metrics() {
        Ok(body) => (
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
