//! Review API
//!
//! Small HTTP surface over the persisted pipeline state: an HTML page and
//! JSON endpoints listing entries that need a human, plus a retry action.

use askama::Template;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::db::entries::{self, PipelineEntry};
use crate::db::models::{FeedStatus, RenameRecord, SeenRecord};
use crate::db::{Db, feeds, history, seen};
use crate::pipeline::state::EntryState;

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub db: Db,
}

pub fn router(db: Db) -> Router {
    Router::new()
        .route("/", get(review_page))
        .route("/health", get(health))
        .route("/api/review", get(review))
        .route("/api/entries/:id", get(entry_detail))
        .route("/api/entries/:id/retry", post(retry_entry))
        .route("/api/history", get(rename_history))
        .route("/api/seen", get(seen_entries))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { db })
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(e) => {
                tracing::error!("Request failed: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Renders an askama template, or a 500 with the render error
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template. Error: {}", err),
            )
                .into_response(),
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
pub struct ReviewReport {
    pub failed: Vec<PipelineEntry>,
    pub active: Vec<PipelineEntry>,
    pub feeds: Vec<FeedStatus>,
}

async fn load_report(db: &Db) -> anyhow::Result<ReviewReport> {
    db.with_conn(|conn| {
        Ok(ReviewReport {
            failed: entries::list_failed(conn)?,
            active: entries::list_active(conn)?,
            feeds: feeds::list_feed_status(conn)?,
        })
    })
    .await
}

async fn review(State(state): State<ApiState>) -> Result<Json<ReviewReport>, ApiError> {
    Ok(Json(load_report(&state.db).await?))
}

/// One table row of the review page
struct ReviewRow {
    entry_id: String,
    raw_title: String,
    state: String,
    detail: String,
    updated_at: String,
}

impl ReviewRow {
    fn from_entry(entry: &PipelineEntry) -> Self {
        let state = match (&entry.failure_reason, &entry.failed_from) {
            (Some(reason), Some(from)) => format!("{} (at {})", reason, from),
            (Some(reason), None) => reason.to_string(),
            _ => entry.state.to_string(),
        };
        Self {
            entry_id: entry.entry_id.clone(),
            raw_title: entry.raw_title.clone(),
            state,
            detail: entry.last_error.clone().unwrap_or_default(),
            updated_at: entry.updated_at.clone(),
        }
    }
}

struct PausedFeedRow {
    url: String,
    last_error: String,
}

#[derive(Template)]
#[template(path = "review.html")]
struct ReviewTemplate {
    failed: Vec<ReviewRow>,
    active: Vec<ReviewRow>,
    paused_feeds: Vec<PausedFeedRow>,
}

async fn review_page(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let report = load_report(&state.db).await?;
    Ok(HtmlTemplate(ReviewTemplate {
        failed: report.failed.iter().map(ReviewRow::from_entry).collect(),
        active: report.active.iter().map(ReviewRow::from_entry).collect(),
        paused_feeds: report
            .feeds
            .into_iter()
            .filter(|f| f.paused)
            .map(|f| PausedFeedRow {
                url: f.url,
                last_error: f.last_error.unwrap_or_default(),
            })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct EntryDetail {
    pub entry: PipelineEntry,
    pub seen: Option<SeenRecord>,
}

async fn entry_detail(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<EntryDetail>, ApiError> {
    let detail = state
        .db
        .with_conn(|conn| {
            let Some(entry) = entries::get_entry(conn, &id)? else {
                return Ok(None);
            };
            let seen = seen::get_seen(conn, &id)?;
            Ok(Some(EntryDetail { entry, seen }))
        })
        .await?;

    detail
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no entry {}", id)))
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub entry_id: String,
    pub state: EntryState,
}

/// Move a failed entry back into the pipeline
async fn retry_entry(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    let outcome = state
        .db
        .with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if entries::get_entry(&tx, &id)?.is_none() {
                return Ok(None);
            }

            let restored = entries::retry_failed(&tx, &id)?;
            match restored {
                Some(EntryState::Fetched) => {
                    seen::reopen(&tx, &id)?;
                }
                Some(EntryState::Dispatched) => entries::reset_dispatch_clock(&tx, &id)?,
                _ => {}
            }
            tx.commit()?;
            Ok(Some(restored))
        })
        .await?;

    match outcome {
        None => Err(ApiError::NotFound(format!("no entry {}", id))),
        Some(None) => Err(ApiError::Conflict(format!("entry {} has not failed", id))),
        Some(Some(state)) => {
            tracing::info!("Entry {} queued for retry from {}", id, state);
            Ok(Json(RetryResponse { entry_id: id, state }))
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

async fn rename_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<RenameRecord>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let records = state
        .db
        .with_conn(|conn| history::get_recent_history(conn, limit))
        .await?;
    Ok(Json(records))
}

async fn seen_entries(State(state): State<ApiState>) -> Result<Json<Vec<SeenRecord>>, ApiError> {
    Ok(Json(state.db.with_conn(seen::list_seen).await?))
}
