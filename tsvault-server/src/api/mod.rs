//! HTTP API endpoints

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};
use tsvault_core::cache::CacheStats;
use tsvault_core::{
    Context, Database, QueryRequest, QueryResult, Timestamp, TsError, WriteRequest,
};

/// Header carrying the tenant for writes and queries
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Tenant used when the header is missing or blank
pub const DEFAULT_TENANT: &str = "default";

/// Query window when `start` is omitted
const DEFAULT_LOOKBACK_SECS: i64 = 3600;

/// Shared handler state
pub struct AppState {
    db: Arc<Database>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(db: Arc<Database>, shutdown: CancellationToken, request_timeout: Duration) -> Self {
        Self {
            db,
            shutdown,
            request_timeout,
        }
    }

    /// Context cancelled on shutdown or once the request deadline passes
    fn request_context(&self) -> Context {
        Context::with_token(self.shutdown.child_token()).with_timeout(self.request_timeout)
    }

    /// Run a storage call on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &Context) -> tsvault_core::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        let ctx = self.request_context();
        tokio::task::spawn_blocking(move || f(&*db, &ctx))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(ApiError::from)
    }
}

pub type SharedState = Arc<AppState>;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/write", post(write))
        .route("/api/v1/query", get(query).post(query_json))
        .route("/api/v1/labels", get(labels))
        .route("/api/v1/label/:name/values", get(label_values))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Storage(#[from] TsError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(err) => match err {
                TsError::InvalidQuery(_) | TsError::Config(_) => StatusCode::BAD_REQUEST,
                TsError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
                TsError::Cancelled | TsError::Closed(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = ErrorResponse {
            status: "error",
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub status: &'static str,
    pub data: T,
}

/// `GET /api/v1/query` parameters; times are RFC 3339 or Unix seconds
#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    pub query: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// `POST /api/v1/query` body
#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub query: String,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: tsvault_core::VERSION,
    })
}

async fn write(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Result<Json<WriteRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(mut req) = body?;
    req.tenant_id = tenant_id(&headers);
    debug!(
        "Write for tenant {}: {} series, {} samples",
        req.tenant_id,
        req.series.len(),
        req.sample_count()
    );

    state.run(move |db, ctx| db.write(ctx, req)).await?;
    Ok(Json(StatusResponse { status: "success" }))
}

async fn query(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<QueryParams>,
) -> Result<Json<QueryResult>, ApiError> {
    let query = params
        .query
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("query parameter is required".into()))?;
    let end = params.end.as_deref().map(parse_time).transpose()?;
    let start = params.start.as_deref().map(parse_time).transpose()?;
    let (start, end) = query_window(start, end, Utc::now().timestamp());

    run_query(&state, QueryRequest::new(tenant_id(&headers), query, start, end)).await
}

async fn query_json(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Json<QueryResult>, ApiError> {
    let Json(body) = body?;
    let (start, end) = query_window(body.start_time, body.end_time, Utc::now().timestamp());

    run_query(&state, QueryRequest::new(tenant_id(&headers), body.query, start, end)).await
}

async fn run_query(state: &AppState, req: QueryRequest) -> Result<Json<QueryResult>, ApiError> {
    let result = state.run(move |db, ctx| db.query(ctx, &req)).await?;
    Ok(Json(result))
}

async fn labels(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<DataResponse<Vec<String>>>, ApiError> {
    let tenant = tenant_id(&headers);
    let names = state.run(move |db, _ctx| db.label_names(&tenant)).await?;
    Ok(Json(DataResponse {
        status: "success",
        data: names,
    }))
}

async fn label_values(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<DataResponse<Vec<String>>>, ApiError> {
    let tenant = tenant_id(&headers);
    let values = state
        .run(move |db, _ctx| db.label_values(&tenant, &name))
        .await?;
    Ok(Json(DataResponse {
        status: "success",
        data: values,
    }))
}

async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    let body = MetricsSnapshot::collect(&state.db).render();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

// ============================================================================
// Helpers
// ============================================================================

/// Tenant from `X-Tenant-ID`, falling back to `"default"`
pub fn tenant_id(headers: &HeaderMap) -> String {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_TENANT)
        .to_string()
}

/// Parse Unix seconds or an RFC 3339 timestamp
pub fn parse_time(raw: &str) -> Result<Timestamp, ApiError> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Ok(secs);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.timestamp())
        .map_err(|e| ApiError::BadRequest(format!("invalid time {:?}: {}", raw, e)))
}

/// Fill in missing bounds: `end` defaults to now, `start` to an hour before `end`
fn query_window(
    start: Option<Timestamp>,
    end: Option<Timestamp>,
    now: Timestamp,
) -> (Timestamp, Timestamp) {
    let end = end.unwrap_or(now);
    let start = start.unwrap_or_else(|| end.saturating_sub(DEFAULT_LOOKBACK_SECS));
    (start, end)
}

/// Point-in-time view of the gauges exported on `/metrics`
#[derive(Debug, Default)]
struct MetricsSnapshot {
    series: usize,
    pending_writes: usize,
    cache: Option<CacheStats>,
    cache_hit_rate: Option<f64>,
}

impl MetricsSnapshot {
    fn collect(db: &Database) -> Self {
        Self {
            series: db.series_count(),
            pending_writes: db.pending_writes(),
            cache: db.cache_stats(),
            cache_hit_rate: db.cache_hit_rate(),
        }
    }

    /// Prometheus text exposition format
    fn render(&self) -> String {
        let mut output = String::new();
        gauge(&mut output, "tsvault_series_total", "Number of indexed series", self.series as f64);
        gauge(
            &mut output,
            "tsvault_pending_writes",
            "Write requests buffered ahead of the storage engine",
            self.pending_writes as f64,
        );

        if let Some(cache) = self.cache {
            gauge(&mut output, "tsvault_cache_entries", "Cached query results", cache.size as f64);
            gauge(
                &mut output,
                "tsvault_cache_capacity",
                "Maximum cached query results",
                cache.capacity as f64,
            );
            gauge(
                &mut output,
                "tsvault_cache_expired_entries",
                "Cached results past their TTL",
                cache.expired as f64,
            );
        }
        if let Some(rate) = self.cache_hit_rate {
            gauge(&mut output, "tsvault_cache_hit_ratio", "Query cache hit ratio", rate);
        }

        output
    }
}

fn gauge(output: &mut String, name: &str, help: &str, value: f64) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} gauge\n", name));
    output.push_str(&format!("{} {}\n", name, value));
}
