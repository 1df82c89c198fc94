//! UVE lookup endpoints

use axum::{
    Json,
    extract::{Path, State},
};

use crate::UveKey;
use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::{UveNamesResponse, UveResponse},
};

/// GET /api/v1/uves/:table
pub async fn list_uves(State(state): State<ApiState>, Path(table): Path<String>) -> Json<UveNamesResponse> {
    let names = state.cache.keys_in_table(&table);
    Json(UveNamesResponse { table, names })
}

/// GET /api/v1/uves/:table/*name
///
/// The name may contain `/` and `:`.
pub async fn get_uve(
    State(state): State<ApiState>,
    Path((table, name)): Path<(String, String)>,
) -> ApiResult<Json<UveResponse>> {
    let key = UveKey::new(table, name.trim_start_matches('/'));
    let contents = state
        .cache
        .lookup(&key)
        .ok_or_else(|| ApiError::NotFound(format!("UVE {key} not found")))?;

    Ok(Json(UveResponse {
        key: key.to_string(),
        contents,
    }))
}
