use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cadence_ledger::ClientRequest;
use serde::{Deserialize, Serialize};

use super::error_response;
use crate::state::SharedState;

/// A request observed by a front-end proxy, submitted for admission.
#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    /// Transport-level peer, `ip:port`.
    pub remote_addr: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Cost units to charge.
    #[serde(default = "default_cost")]
    pub cost: f64,
}

fn default_cost() -> f64 {
    1.0
}

#[derive(Debug, Serialize)]
pub struct BucketOutcome {
    pub bucket: String,
    pub delay_ms: u64,
    pub admitted: bool,
}

#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    pub delay_ms: u64,
    pub admitted: bool,
    pub buckets: Vec<BucketOutcome>,
}

/// POST /api/reserve
///
/// Charges the request against every bucket and reports how long the caller
/// should hold it, or that it should be refused.
pub async fn reserve(
    State(state): State<SharedState>,
    Json(body): Json<ReserveRequest>,
) -> Response {
    let start = Instant::now();

    let headers = match header_map(&body.headers) {
        Ok(headers) => headers,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message).into_response(),
    };

    let verdict = state
        .ledger
        .reserve(&ClientRequest::new(&body.remote_addr, &headers), start, body.cost);
    state.metrics.observe(&verdict);

    Json(ReserveResponse {
        delay_ms: millis(verdict.delay),
        admitted: verdict.admitted,
        buckets: verdict
            .decisions
            .into_iter()
            .map(|d| BucketOutcome {
                bucket: d.bucket,
                delay_ms: millis(d.reservation.delay),
                admitted: d.reservation.admitted,
            })
            .collect(),
    })
    .into_response()
}

fn header_map(raw: &HashMap<String, String>) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for (name, value) in raw {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("invalid header name '{}'", name))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| format!("invalid value for header '{}'", name))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
