use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use cadence_common::LedgerConfig;
use serde_json::json;

use super::error_response;
use crate::state::SharedState;

/// GET /api/config
///
/// Returns the ledger configuration currently in force.
pub async fn get_config(State(state): State<SharedState>) -> impl IntoResponse {
    let config = state.ledger.config();
    Json(serde_json::to_value(&*config).unwrap_or(json!({"error": "serialization failed"})))
}

/// PUT /api/config
///
/// Accepts a full ledger configuration as JSON, validates it, and applies it
/// to every bucket. Rejected configurations leave the running one in place.
pub async fn update_config(
    State(state): State<SharedState>,
    Json(new_config): Json<LedgerConfig>,
) -> impl IntoResponse {
    if let Err(e) = state.reload(&new_config) {
        return error_response(StatusCode::BAD_REQUEST, format!("validation failed: {}", e));
    }

    tracing::info!("configuration updated via admin API");

    (
        StatusCode::OK,
        Json(json!({
            "status": "updated"
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use cadence_ledger::Ledger;
    use std::sync::Arc;

    fn state() -> SharedState {
        Arc::new(AppState::new(Ledger::new(&LedgerConfig::default()).unwrap()))
    }

    #[tokio::test]
    async fn get_returns_running_config() {
        let response = get_config(State(state())).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["burst"], 30.0);
        assert_eq!(value["buckets"][0]["name"], "slash32");
    }

    #[tokio::test]
    async fn put_applies_valid_config() {
        let state = state();
        let mut config = LedgerConfig::default();
        config.buckets[3].rate = 0.5;

        let response = update_config(State(state.clone()), Json(config))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.ledger.bucket("user_agent").unwrap().settings().rate, 0.5);
    }

    #[tokio::test]
    async fn put_rejects_invalid_config() {
        let state = state();
        let mut config = LedgerConfig::default();
        config.max_entries = 0;

        let response = update_config(State(state.clone()), Json(config))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.ledger.config().max_entries, 10_000);
        assert_eq!(state.metrics.config_reloads.get(), 0);
    }
}
