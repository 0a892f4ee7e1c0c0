pub mod buckets;
pub mod config;
pub mod health;
pub mod metrics;
pub mod reserve;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

/// JSON error body used by every route.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "status": "error",
            "message": message.into()
        })),
    )
}
