use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use journal::JournalEntry;

use crate::services::{
    ClearScheduleRequest, ControlService, ReadRegisterRequest, ReadRegisterResponse,
    ScheduleResponse, ServiceError, SetScheduleSlotRequest, SetSchedulePowerRequest,
    WriteRegisterRequest, WriteRegisterResponse, CLEAR_SCHEDULE_ACTION, READ_REGISTER_ACTION,
    SET_SCHEDULE_POWER_ACTION, SET_SCHEDULE_SLOT_ACTION, WRITE_REGISTER_ACTION,
};

const DEFAULT_JOURNAL_LIMIT: i64 = 50;
const MAX_JOURNAL_LIMIT: i64 = 1_000;

static PROMETHEUS: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Installs the process-wide Prometheus recorder once and returns its handle.
pub fn install_metrics() -> Result<PrometheusHandle> {
    let mut slot = PROMETHEUS
        .lock()
        .map_err(|_| anyhow::anyhow!("metrics recorder lock poisoned"))?;
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    *slot = Some(handle.clone());
    Ok(handle)
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ControlService>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&service_path(WRITE_REGISTER_ACTION), post(write_register))
        .route(&service_path(READ_REGISTER_ACTION), post(read_register))
        .route(&service_path(SET_SCHEDULE_SLOT_ACTION), post(set_schedule_slot))
        .route(&service_path(CLEAR_SCHEDULE_ACTION), post(clear_schedule))
        .route(&service_path(SET_SCHEDULE_POWER_ACTION), post(set_schedule_power))
        .route("/batteries/:isn/schedule", get(show_schedule))
        .route("/journal", get(recent_journal))
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
}

fn service_path(action: &str) -> String {
    format!("/services/{action}")
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) | ServiceError::Codec(_) | ServiceError::Schedule(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::UnknownBattery(_) => StatusCode::NOT_FOUND,
            ServiceError::Device(_) | ServiceError::CorruptSchedule(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Journal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::JournalDisabled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn bad_json(rejection: JsonRejection) -> ServiceError {
    ServiceError::Validation(rejection.body_text())
}

async fn write_register(
    State(state): State<AppState>,
    payload: Result<Json<WriteRegisterRequest>, JsonRejection>,
) -> Result<Json<WriteRegisterResponse>, ServiceError> {
    let Json(request) = payload.map_err(bad_json)?;
    Ok(Json(state.service.write_register(request).await?))
}

async fn read_register(
    State(state): State<AppState>,
    payload: Result<Json<ReadRegisterRequest>, JsonRejection>,
) -> Result<Json<ReadRegisterResponse>, ServiceError> {
    let Json(request) = payload.map_err(bad_json)?;
    Ok(Json(state.service.read_register(request).await?))
}

async fn set_schedule_slot(
    State(state): State<AppState>,
    payload: Result<Json<SetScheduleSlotRequest>, JsonRejection>,
) -> Result<Json<ScheduleResponse>, ServiceError> {
    let Json(request) = payload.map_err(bad_json)?;
    Ok(Json(state.service.set_schedule_slot(request).await?))
}

async fn clear_schedule(
    State(state): State<AppState>,
    payload: Result<Json<ClearScheduleRequest>, JsonRejection>,
) -> Result<Json<ScheduleResponse>, ServiceError> {
    let Json(request) = payload.map_err(bad_json)?;
    Ok(Json(state.service.clear_schedule(request).await?))
}

async fn set_schedule_power(
    State(state): State<AppState>,
    payload: Result<Json<SetSchedulePowerRequest>, JsonRejection>,
) -> Result<Json<ScheduleResponse>, ServiceError> {
    let Json(request) = payload.map_err(bad_json)?;
    Ok(Json(state.service.set_schedule_power(request).await?))
}

async fn show_schedule(
    State(state): State<AppState>,
    Path(isn): Path<String>,
) -> Result<Json<ScheduleResponse>, ServiceError> {
    Ok(Json(state.service.get_schedule(&isn).await?))
}

#[derive(Debug, Deserialize)]
struct JournalQuery {
    limit: Option<i64>,
}

async fn recent_journal(
    State(state): State<AppState>,
    query: Result<Query<JournalQuery>, QueryRejection>,
) -> Result<Json<Vec<JournalEntry>>, ServiceError> {
    let Query(query) = query.map_err(|rejection| ServiceError::Validation(rejection.body_text()))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_JOURNAL_LIMIT)
        .clamp(1, MAX_JOURNAL_LIMIT);
    Ok(Json(state.service.recent_journal(limit).await?))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
