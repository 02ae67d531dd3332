use crate::alerts::AlertTrackState;
use crate::inventory::{DeviceClass, DeviceRecord, InventoryError};
use crate::metrics::Metrics;
use crate::monitor::FleetMonitor;
use crate::refresh::RefreshError;
use crate::snapshot::DeviceEntry;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub monitor: Arc<FleetMonitor>,
    pub default_interval: Duration,
}

/// Inventory record as exposed over HTTP. Credentials never leave the process.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub class: DeviceClass,
    pub vendor: Option<String>,
    pub tags: BTreeSet<String>,
    pub has_credentials: bool,
    pub latest: Option<DeviceEntry>,
    pub alert: Option<AlertTrackState>,
}

impl DeviceView {
    fn new(
        record: DeviceRecord,
        latest: Option<DeviceEntry>,
        alert: Option<AlertTrackState>,
    ) -> Self {
        Self {
            has_credentials: record.credentials.is_some(),
            id: record.id,
            hostname: record.hostname,
            address: record.address,
            class: record.class,
            vendor: record.vendor,
            tags: record.tags,
            latest,
            alert,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub interval_secs: Option<u64>,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    monitor: Arc<FleetMonitor>,
    default_interval: Duration,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/:id", get(device_handler))
        .route("/api/background", get(background_status_handler))
        .route("/api/background/start", post(background_start_handler))
        .route("/api/background/stop", post(background_stop_handler))
        .with_state(HttpAppState {
            metrics,
            monitor,
            default_interval,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let snapshot = state.monitor.get_snapshot().await;
    Json(snapshot.as_ref().clone())
}

async fn refresh_handler(State(state): State<HttpAppState>) -> Response {
    match state.monitor.refresh_now().await {
        Ok(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        Err(err) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            err.to_string(),
            Some(err.stage()),
        ),
    }
}

async fn devices_handler(State(state): State<HttpAppState>) -> Response {
    let devices = match state.monitor.list_devices().await {
        Ok(devices) => devices,
        Err(err) => return inventory_error(err),
    };
    let snapshot = state.monitor.get_snapshot().await;
    let views: Vec<DeviceView> = devices
        .into_iter()
        .map(|d| {
            let latest = snapshot.per_device.get(&d.id).cloned();
            let alert = state.monitor.alert_state(&d.id);
            DeviceView::new(d, latest, alert)
        })
        .collect();
    Json(views).into_response()
}

async fn device_handler(State(state): State<HttpAppState>, Path(id): Path<String>) -> Response {
    match state.monitor.get_device(&id).await {
        Ok(record) => {
            let latest = state.monitor.latest_entry(&id).await;
            let alert = state.monitor.alert_state(&id);
            Json(DeviceView::new(record, latest, alert)).into_response()
        }
        Err(err) => inventory_error(err),
    }
}

async fn background_status_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(state.monitor.background_status().await)
}

/// An empty body starts with the default interval; a body that is not valid JSON is rejected.
async fn background_start_handler(State(state): State<HttpAppState>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice::<StartRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("некорректное тело запроса: {err}"),
                    None,
                )
            }
        }
    };
    let interval = request
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or(state.default_interval);

    match state.monitor.start_background_refresh(interval).await {
        Ok(()) => Json(state.monitor.background_status().await).into_response(),
        Err(err) => refresh_error(err),
    }
}

async fn background_stop_handler(State(state): State<HttpAppState>) -> Response {
    match state.monitor.stop_background_refresh().await {
        Ok(outcome) => Json(json!({ "outcome": outcome })).into_response(),
        Err(err) => refresh_error(err),
    }
}

fn inventory_error(err: InventoryError) -> Response {
    let status = match err {
        InventoryError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, err.to_string(), None)
}

fn refresh_error(err: RefreshError) -> Response {
    let status = match err {
        RefreshError::AlreadyRunning | RefreshError::NotRunning => StatusCode::CONFLICT,
        RefreshError::InvalidInterval => StatusCode::BAD_REQUEST,
    };
    error_response(status, err.to_string(), None)
}

fn error_response(status: StatusCode, message: String, stage: Option<&str>) -> Response {
    (status, Json(json!({ "error": message, "stage": stage }))).into_response()
}
