//! Axum JSON status API over the process log and watermark ledger.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDateTime;
use ewdw_storage::{PgWarehouse, StateStore, WarehouseError};
use ewdw_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "ewdw-web";

const DEFAULT_RUN_LIMIT: i64 = 20;
const MAX_RUN_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<dyn StateStore>,
}

impl AppState {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkResponse {
    pub stream: String,
    pub watermark: NaiveDateTime,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/runs", get(runs_handler))
        .route("/streams", get(streams_handler))
        .route("/streams/{name}/watermark", get(watermark_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "status api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Serves against the warehouse named by the environment, on `EWDW_WEB_PORT` (default 8000).
pub async fn serve_from_env(addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let addr = addr.unwrap_or_else(|| {
        let port: u16 = std::env::var("EWDW_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);
        SocketAddr::from(([0, 0, 0, 0], port))
    });
    let config = SyncConfig::from_env();
    let warehouse = PgWarehouse::connect(&config.warehouse_config()).await?;
    warehouse.ensure_state_tables().await?;
    serve(addr, AppState::new(Arc::new(warehouse))).await
}

async fn health_handler() -> Response {
    Json(serde_json::json!({"status": "ok", "service": CRATE_NAME})).into_response()
}

async fn runs_handler(State(app): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    match app.state.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => store_error(err),
    }
}

async fn streams_handler(State(app): State<Arc<AppState>>) -> Response {
    match app.state.watermarks().await {
        Ok(watermarks) => Json(watermarks).into_response(),
        Err(err) => store_error(err),
    }
}

async fn watermark_handler(State(app): State<Arc<AppState>>, AxumPath(name): AxumPath<String>) -> Response {
    match app.state.committed_watermark(&name).await {
        Ok(Some(watermark)) => Json(WatermarkResponse { stream: name, watermark }).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no committed watermark for {name}")})),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

fn store_error(err: WarehouseError) -> Response {
    error!(error = %err, "state store request failed");
    let status = if err.is_connectivity() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{NaiveDate, Utc};
    use ewdw_core::{ProcessRun, RunStatus};
    use ewdw_storage::MemoryWarehouse;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(AppState::new(Arc::new(MemoryWarehouse::new())));
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn runs_are_listed_newest_first_and_limited() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.seed_run("STREAM_LOAD", RunStatus::Success, Utc::now()).await;
        wh.seed_run("STREAM_PRICE", RunStatus::Failed, Utc::now()).await;
        wh.seed_run("FACT_PROCESSING", RunStatus::Running, Utc::now()).await;
        let app = app(AppState::new(wh));

        let (status, body) = get_json(app.clone(), "/runs").await;
        assert_eq!(status, StatusCode::OK);
        let runs: Vec<ProcessRun> = serde_json::from_value(body).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].process_name, "FACT_PROCESSING");
        assert_eq!(runs[0].status, RunStatus::Running);

        let (_, body) = get_json(app, "/runs?limit=1").await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["status"], "RUNNING");
    }

    #[tokio::test]
    async fn watermark_is_served_once_committed() {
        let wh = Arc::new(MemoryWarehouse::new());
        let app = app(AppState::new(wh.clone()));
        let (status, _) = get_json(app.clone(), "/streams/weather/watermark").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let ts = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(2, 0, 0).unwrap();
        wh.advance_watermark("weather", ts).await.unwrap();
        let (status, body) = get_json(app.clone(), "/streams/weather/watermark").await;
        assert_eq!(status, StatusCode::OK);
        let served: WatermarkResponse = serde_json::from_value(body).unwrap();
        assert_eq!(served.stream, "weather");
        assert_eq!(served.watermark, ts);

        let (_, body) = get_json(app, "/streams").await;
        assert_eq!(body[0]["stream_name"], "weather");
    }

    #[tokio::test]
    async fn offline_store_is_unavailable() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.set_offline(true).await;
        let app = app(AppState::new(wh));
        let (status, body) = get_json(app, "/runs").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("offline"));
    }
}
