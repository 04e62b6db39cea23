//! REST API endpoints.
//!
//! Sensor ids contain `/` (e.g. `tank-1/ph`) and must be percent-encoded in
//! paths: `GET /api/sensors/tank-1%2Fph/series`.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. A series
//! request for a range that is not fully synced returns `409 Conflict` with
//! the uncovered sub-ranges, so clients can wait for backfill and retry.
//!
//! # Example
//!
//! ```ignore
//! use tanksync_service::api;
//!
//! let app = api::router().with_state(state);
//! ```

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use tanksync_core::{Error as SyncError, SensorStatus, Series};
use tanksync_types::{DateFilter, TimeRange, Timestamp};

use crate::state::AppState;

/// Bucket width used when a series request does not name one.
pub const DEFAULT_BUCKET_MS: i64 = 3_600_000;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sensors", get(list_sensors))
        .route("/api/sensors/{id}", get(get_sensor))
        .route("/api/sensors/{id}/series", get(get_series))
        .route("/api/sensors/{id}/retry", post(retry_gap))
        .route("/api/sensors/{id}/resubscribe", post(resubscribe))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when any sensor has incomplete data.
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub uptime_secs: i64,
    pub sensors: usize,
    pub unhealthy: Vec<String>,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let sensors = state.coordinator.sensors().await;
    let unhealthy: Vec<String> = sensors
        .iter()
        .filter(|s| !s.health.is_healthy())
        .map(|s| s.sensor_id.clone())
        .collect();
    let now = OffsetDateTime::now_utc();

    Json(HealthResponse {
        status: if unhealthy.is_empty() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        timestamp: now,
        uptime_secs: (now - state.started_at).whole_seconds(),
        sensors: sensors.len(),
        unhealthy,
    })
}

/// A sensor's sync status with its configured alias.
#[derive(Debug, Serialize)]
pub struct SensorResponse {
    #[serde(flatten)]
    pub status: SensorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl SensorResponse {
    fn new(state: &AppState, status: SensorStatus) -> Self {
        let alias = state.alias(&status.sensor_id).map(str::to_string);
        Self { status, alias }
    }
}

async fn list_sensors(State(state): State<Arc<AppState>>) -> Json<Vec<SensorResponse>> {
    let sensors = state.coordinator.sensors().await;
    Json(
        sensors
            .into_iter()
            .map(|status| SensorResponse::new(&state, status))
            .collect(),
    )
}

async fn get_sensor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SensorResponse>, AppError> {
    let status = state
        .coordinator
        .status(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Sensor not found: {}", id)))?;
    Ok(Json(SensorResponse::new(&state, status)))
}

/// Query parameters for a series request.
///
/// Either `filter` (a preset such as `last_24_hours`) or both `start` and
/// `end` (Unix milliseconds, end exclusive). With neither, the last 24
/// hours are returned. Presets end at the last full bucket boundary, since
/// the bucket still filling up is never covered.
#[derive(Debug, Default, Deserialize)]
pub struct SeriesQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub filter: Option<String>,
    /// Bucket width in milliseconds.
    pub bucket: Option<i64>,
}

impl SeriesQuery {
    /// Resolve the requested time range for buckets of `width_ms`.
    pub fn range(&self, now: Timestamp, width_ms: i64) -> Result<TimeRange, AppError> {
        match (self.start, self.end, self.filter.as_deref()) {
            (None, None, None) => Ok(DateFilter::default().bucketed_range(now, width_ms)),
            (None, None, Some(filter)) => filter
                .parse::<DateFilter>()
                .map(|f| f.bucketed_range(now, width_ms))
                .map_err(|e| AppError::BadRequest(e.to_string())),
            (Some(start), Some(end), None) => {
                TimeRange::from_millis(start, end).map_err(|e| AppError::BadRequest(e.to_string()))
            }
            (_, _, Some(_)) => Err(AppError::BadRequest(
                "use either filter or start/end, not both".to_string(),
            )),
            _ => Err(AppError::BadRequest(
                "start and end must be given together".to_string(),
            )),
        }
    }

    /// Bucket width and range.
    pub fn resolve(&self, now: Timestamp) -> Result<(TimeRange, i64), AppError> {
        let width = self.bucket_width()?;
        let range = self.range(now, width)?;
        Ok((range, width))
    }

    /// Requested bucket width.
    pub fn bucket_width(&self) -> Result<i64, AppError> {
        match self.bucket {
            None => Ok(DEFAULT_BUCKET_MS),
            Some(width) if width > 0 => Ok(width),
            Some(width) => Err(AppError::BadRequest(format!(
                "bucket width must be positive, got {}",
                width
            ))),
        }
    }
}

async fn get_series(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<Series>, AppError> {
    let (range, width) = query.resolve(Timestamp::now())?;
    let series = state.coordinator.query(&id, range, width).await?;
    Ok(Json(series))
}

/// Response to a sensor action.
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub sensor_id: String,
    pub action: &'static str,
}

async fn retry_gap(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ActionResponse>), AppError> {
    state.coordinator.retry_gap(&id).await?;
    info!(sensor = %id, "Gap retry requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            sensor_id: id,
            action: "retry_gap",
        }),
    ))
}

async fn resubscribe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ActionResponse>), AppError> {
    state.coordinator.resubscribe(&id).await?;
    info!(sensor = %id, "Resubscribe requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            sensor_id: id,
            action: "resubscribe",
        }),
    ))
}

/// API error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// The range is not fully synced yet.
    Uncovered {
        message: String,
        missing: Vec<TimeRange>,
    },
    Internal(String),
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::UncoveredRange { ref missing, .. } => AppError::Uncovered {
                missing: missing.clone(),
                message: e.to_string(),
            },
            SyncError::UnknownSensor(_) => AppError::NotFound(e.to_string()),
            SyncError::InvalidRange(_) | SyncError::InvalidConfig(_) => {
                AppError::BadRequest(e.to_string())
            }
            SyncError::SubscriptionLimit { .. } => AppError::Conflict(e.to_string()),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({ "error": msg })),
            AppError::Uncovered { message, missing } => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": message, "missing": missing }),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": msg }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    use tanksync_core::mock::{MockFeed, MockHistory, StaticIdentity};
    use tanksync_core::{FeedEvent, Reading, Sources, SyncCoordinator};

    use crate::config::{Config, SensorConfig};

    const SENSOR: &str = "tank-1/ph";
    const SENSOR_PATH: &str = "tank-1%2Fph";

    fn reading(seq: u64) -> Reading {
        Reading::new(SENSOR, seq, Timestamp::from_millis(seq as i64 * 1_000), 7.0)
    }

    fn create_test_state(feed: Arc<MockFeed>, history: Arc<MockHistory>) -> Arc<AppState> {
        let mut config = Config::default();
        config.sync.max_buckets_per_query = 100;
        config.sensors.push(SensorConfig {
            id: SENSOR.to_string(),
            metric: None,
            alias: Some("Main tank".to_string()),
        });
        let sources = Sources::new(feed, history, Arc::new(StaticIdentity::new("token")));
        let coordinator = SyncCoordinator::new(sources, config.sync_config()).unwrap();
        AppState::new(coordinator, config)
    }

    fn empty_state() -> Arc<AppState> {
        create_test_state(Arc::new(MockFeed::new()), Arc::new(MockHistory::new()))
    }

    /// State with readings 1..=5 of `SENSOR` synced, covering [1000, 5001).
    async fn synced_state() -> Arc<AppState> {
        let feed = Arc::new(MockFeed::new());
        feed.push_events_then_hang((1..=5).map(|s| FeedEvent::Reading(reading(s))).collect());
        let state = create_test_state(feed, Arc::new(MockHistory::new()));
        state.coordinator.subscribe(SENSOR).await.unwrap();
        wait_for(&state, |s| s.last_sequence == Some(5)).await;
        state
    }

    async fn wait_for<F: Fn(&SensorStatus) -> bool>(state: &AppState, predicate: F) {
        for _ in 0..1_000 {
            if let Some(status) = state.coordinator.status(SENSOR).await
                && predicate(&status)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sensor never reached the expected state");
    }

    async fn get(state: Arc<AppState>, uri: &str) -> axum::response::Response {
        router()
            .with_state(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post(state: Arc<AppState>, uri: &str) -> axum::response::Response {
        router()
            .with_state(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = get(empty_state(), "/api/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert!(json["timestamp"].is_string());
        assert_eq!(json["sensors"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reports_degraded_sensors() {
        let feed = Arc::new(MockFeed::new());
        feed.push_events_then_hang(
            [1, 3]
                .into_iter()
                .map(|s| FeedEvent::Reading(reading(s)))
                .collect(),
        );
        let history = Arc::new(MockHistory::new());
        history.extend((1..=3).map(reading));
        history.omit(2);
        let state = create_test_state(feed, history.clone());
        state.coordinator.subscribe(SENSOR).await.unwrap();
        wait_for(&state, |s| !s.health.is_healthy() && s.pending == 1).await;
        wait_for(&state, |s| {
            matches!(s.health, tanksync_core::DataHealth::Degraded { .. })
        })
        .await;

        let json = response_json(get(state.clone(), "/api/health").await).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["unhealthy"][0], SENSOR);

        history.restore_omitted();
        let response = post(state.clone(), &format!("/api/sensors/{}/retry", SENSOR_PATH)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        wait_for(&state, |s| s.health.is_healthy()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_and_get_sensor() {
        let state = synced_state().await;

        let json = response_json(get(state.clone(), "/api/sensors").await).await;
        let sensors = json.as_array().unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0]["sensor_id"], SENSOR);
        assert_eq!(sensors[0]["alias"], "Main tank");
        assert_eq!(sensors[0]["metric"], "ph");

        let response = get(state, &format!("/api/sensors/{}", SENSOR_PATH)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["last_sequence"], 5);
        assert_eq!(json["health"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_unknown_sensor_is_not_found() {
        let state = empty_state();
        let response = get(state.clone(), "/api/sensors/tank-9%2Fph").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = response_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("tank-9/ph"));

        let response = get(state.clone(), "/api/sensors/tank-9%2Fph/series?filter=24h").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = post(state, "/api/sensors/tank-9%2Fph/retry").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_series_for_synced_range() {
        let state = synced_state().await;
        let uri = format!(
            "/api/sensors/{}/series?start=1000&end=5000&bucket=1000",
            SENSOR_PATH
        );
        let response = get(state, &uri).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["sensor_id"], SENSOR);
        assert_eq!(json["bucket_width_ms"], 1000);
        let total: u64 = json["buckets"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["count"].as_u64().unwrap())
            .sum();
        assert_eq!(total, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_series_for_unsynced_range_is_conflict() {
        let state = synced_state().await;
        let uri = format!("/api/sensors/{}/series?start=0&end=4001", SENSOR_PATH);
        let response = get(state, &uri).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let json = response_json(response).await;
        let missing = json["missing"].as_array().unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0]["start"], 0);
        assert_eq!(missing[0]["end"], 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_series_partial_edge_bucket_is_conflict() {
        let state = synced_state().await;
        // Ends inside the last reading's bucket, which extends past the window
        let uri = format!("/api/sensors/{}/series?start=1000&end=5001&bucket=1000", SENSOR_PATH);
        let response = get(state, &uri).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let json = response_json(response).await;
        assert_eq!(json["missing"][0]["start"], 5001);
        assert_eq!(json["missing"][0]["end"], 6000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_series_too_many_buckets() {
        let state = synced_state().await;
        let uri = format!("/api/sensors/{}/series?start=1000&end=5000&bucket=1", SENSOR_PATH);
        let response = get(state.clone(), &uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("buckets"));

        let uri = format!("/api/sensors/{}/series?start=1000&end=5000&bucket=40", SENSOR_PATH);
        assert_eq!(get(state, &uri).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_series_bad_requests() {
        let state = empty_state();
        for query in [
            "start=10&end=5",
            "start=10",
            "filter=yesterday",
            "filter=24h&start=0&end=10",
            "start=0&end=10&bucket=0",
        ] {
            let uri = format!("/api/sensors/{}/series?{}", SENSOR_PATH, query);
            let response = get(state.clone(), &uri).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query {}", query);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_endpoint() {
        let state = synced_state().await;
        let response = post(state.clone(), &format!("/api/sensors/{}/resubscribe", SENSOR_PATH)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = response_json(response).await;
        assert_eq!(json["action"], "resubscribe");
        assert_eq!(json["sensor_id"], SENSOR);
    }

    #[test]
    fn test_series_query_defaults() {
        let now = Timestamp::from_millis(100 * 3_600_000);
        let query = SeriesQuery::default();
        assert_eq!(
            query.range(now, DEFAULT_BUCKET_MS).unwrap(),
            DateFilter::Last24Hours.bucketed_range(now, DEFAULT_BUCKET_MS)
        );
        assert_eq!(query.bucket_width().unwrap(), DEFAULT_BUCKET_MS);
    }

    #[test]
    fn test_presets_end_at_last_full_bucket() {
        let hour = 3_600_000;
        let now = Timestamp::from_millis(100 * hour + 1_800_000);

        let (range, width) = SeriesQuery::default().resolve(now).unwrap();
        assert_eq!(width, DEFAULT_BUCKET_MS);
        assert_eq!(range.end, Timestamp::from_millis(100 * hour));
        assert_eq!(range.start, Timestamp::from_millis(76 * hour));

        let explicit = SeriesQuery {
            start: Some(0),
            end: Some(1_500),
            bucket: Some(1_000),
            ..Default::default()
        };
        let (range, _) = explicit.resolve(now).unwrap();
        assert_eq!(range.end, Timestamp::from_millis(1_500));
    }

    #[test]
    fn test_error_mapping() {
        let err: AppError = SyncError::UnknownSensor("x".into()).into();
        assert!(matches!(err, AppError::NotFound(_)));
        let err: AppError = SyncError::invalid_range("bad").into();
        assert!(matches!(err, AppError::BadRequest(_)));
        let err: AppError = SyncError::Cancelled.into();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
