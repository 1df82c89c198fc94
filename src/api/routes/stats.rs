//! Statistics endpoint

use axum::{Json, extract::State};

use crate::api::{error::ApiResult, state::ApiState, types::StatsResponse};

/// GET /api/v1/stats
///
/// Owned partitions, cache counts, alarm and output counters
pub async fn get_stats(State(state): State<ApiState>) -> ApiResult<Json<StatsResponse>> {
    let alarms = state.alarm.stats().await?;
    let output = state.output.stats().await?;

    Ok(Json(StatsResponse {
        timestamp: chrono::Utc::now().to_rfc3339(),
        owned_partitions: state.cache.owned_partitions(),
        cache: state.cache.stats(),
        alarms,
        output,
    }))
}
