//! Alarm records, ack RPC and rule configuration

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::{debug, info};

use crate::UveKey;
use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::{AckRequest, AckResponse, AlarmsResponse},
};
use crate::asm::AckResult;
use crate::rules::AlarmConfig;

/// GET /api/v1/alarms
pub async fn list_alarms(State(state): State<ApiState>) -> ApiResult<Json<AlarmsResponse>> {
    let alarms = state.alarm.alarms().await?;
    let aggregates = state.alarm.aggregates().await?;
    Ok(Json(AlarmsResponse { alarms, aggregates }))
}

/// POST /api/v1/alarms/ack
///
/// Answers 200 on success, 404 when no such alarm is public and 400 when
/// the timestamp does not match the published record.
pub async fn ack_alarm(
    State(state): State<ApiState>,
    Json(request): Json<AckRequest>,
) -> ApiResult<(StatusCode, Json<AckResponse>)> {
    debug!(
        "ack {}:{} {} @ {}",
        request.table, request.name, request.alarm_name, request.timestamp
    );

    let key = UveKey::new(request.table, request.name);
    let result = state
        .alarm
        .ack(key, &request.alarm_name, request.timestamp)
        .await?;

    let status = match result {
        AckResult::Success => StatusCode::OK,
        AckResult::NotPresent => StatusCode::NOT_FOUND,
        AckResult::InvalidRequest => StatusCode::BAD_REQUEST,
    };
    Ok((status, Json(AckResponse { result })))
}

/// GET /api/v1/alarm-configs
pub async fn list_configs(State(state): State<ApiState>) -> ApiResult<Json<Vec<AlarmConfig>>> {
    Ok(Json(state.alarm.configs().await?))
}

/// PUT /api/v1/alarm-configs
///
/// Creates or replaces the rule with the body's name.
pub async fn put_config(
    State(state): State<ApiState>,
    Json(config): Json<AlarmConfig>,
) -> ApiResult<StatusCode> {
    info!("updating alarm config '{}'", config.name);
    state.alarm.set_config(config).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/v1/alarm-configs/:name
pub async fn delete_config(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    if state.alarm.delete_config(&name).await? {
        info!("deleted alarm config '{name}'");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("alarm config '{name}' not found")))
    }
}
