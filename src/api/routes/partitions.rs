//! Partition ownership endpoints

use axum::{
    Json,
    extract::{Path, State},
};
use tracing::info;

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::{PartitionsResponse, SetPartitionRequest},
};

/// GET /api/v1/partitions
pub async fn list_partitions(State(state): State<ApiState>) -> ApiResult<Json<PartitionsResponse>> {
    Ok(Json(PartitionsResponse {
        partition_count: state.cache.partition_count(),
        partitions: state.manager.status().await?,
    }))
}

/// POST /api/v1/partitions/:id
///
/// Acquires (`owned = true`) or releases a partition through the
/// coordinator. Responds once the change has been applied locally.
pub async fn set_partition(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
    Json(request): Json<SetPartitionRequest>,
) -> ApiResult<Json<PartitionsResponse>> {
    let count = state.cache.partition_count();
    if id >= count {
        return Err(ApiError::InvalidRequest(format!(
            "partition {id} out of range (0..{count})"
        )));
    }

    info!("manual partition change: {id} owned={}", request.owned);
    state.ownership.set_partition(id, request.owned).await?;

    list_partitions(State(state)).await
}
