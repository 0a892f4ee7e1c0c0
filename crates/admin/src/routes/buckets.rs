use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cadence_ledger::{Bucket, EntryView};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error_response;
use crate::state::SharedState;

#[derive(Debug, Serialize)]
pub struct BucketSummary {
    pub name: String,
    pub strategy: String,
    pub rate: f64,
    pub burst: f64,
    pub max_entries: usize,
    pub entries: usize,
}

impl BucketSummary {
    fn of(bucket: &Bucket) -> Self {
        let settings = bucket.settings();
        Self {
            name: bucket.name().to_string(),
            strategy: bucket.classifier().describe(),
            rate: settings.rate,
            burst: settings.burst,
            max_entries: settings.max_entries,
            entries: bucket.len(),
        }
    }
}

/// One row of a bucket dump.
#[derive(Debug, Serialize)]
pub struct EntryRow {
    pub id: String,
    pub label: String,
    pub last_used: String,
    pub idle_secs: f64,
    pub avg_wait_secs: f64,
    pub avg_since_prev_secs: f64,
    pub avg_cpu_secs: f64,
}

impl EntryRow {
    /// `now` and `wall_now` are the same moment on the monotonic and the wall clock.
    fn from_view(view: EntryView, now: Instant, wall_now: DateTime<Utc>) -> Self {
        let idle = now.saturating_duration_since(view.last_used);
        let last_used = chrono::Duration::from_std(idle)
            .ok()
            .and_then(|idle| wall_now.checked_sub_signed(idle))
            .unwrap_or(wall_now);

        Self {
            id: view.id.to_string(),
            label: view.label,
            last_used: last_used.to_rfc3339(),
            idle_secs: idle.as_secs_f64(),
            avg_wait_secs: view.avg_wait.as_secs_f64(),
            avg_since_prev_secs: view.avg_since_prev.as_secs_f64(),
            avg_cpu_secs: view.avg_cpu_secs,
        }
    }
}

/// GET /api/buckets
pub async fn list_buckets(State(state): State<SharedState>) -> Json<Vec<BucketSummary>> {
    Json(state.ledger.buckets().iter().map(BucketSummary::of).collect())
}

/// GET /api/buckets/{name}/entries
///
/// Dumps every live entry of one bucket, sorted by label.
pub async fn list_entries(State(state): State<SharedState>, Path(name): Path<String>) -> Response {
    let bucket = match state.ledger.require_bucket(&name) {
        Ok(bucket) => bucket,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };

    let now = Instant::now();
    let wall_now = Utc::now();
    let mut rows: Vec<EntryRow> = bucket
        .snapshot()
        .into_iter()
        .map(|view| EntryRow::from_view(view, now, wall_now))
        .collect();
    rows.sort_by(|a, b| a.label.cmp(&b.label));

    Json(rows).into_response()
}

/// DELETE /api/buckets/{name}/entries/{id}
///
/// Forgets one key. Its next request starts with a full limiter.
pub async fn delete_entry(
    State(state): State<SharedState>,
    Path((name, id)): Path<(String, String)>,
) -> Response {
    let bucket = match state.ledger.require_bucket(&name) {
        Ok(bucket) => bucket,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };

    if !bucket.forget(&id) {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("entry {} not found in bucket {}", id, name),
        )
        .into_response();
    }

    tracing::info!(bucket = %name, id = %id, "entry removed via admin API");
    StatusCode::NO_CONTENT.into_response()
}
