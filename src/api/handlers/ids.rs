use crate::api::{error::ApiError, AppState};
use crate::snowflake::{self, AllocatorInfo, IdAllocator, SnowflakeParts};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Path, Query,
    },
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MAX_BATCH: usize = 100;
pub const MAX_PARSE_BATCH: usize = 50;
const DEFAULT_BATCH: usize = 10;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdResponse {
    pub id: i64,
    /// Same value as a string, for clients without 64-bit integers.
    pub id_str: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub ids: Vec<i64>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct BatchQuery {
    pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedId {
    pub id: i64,
    #[serde(flatten)]
    pub parts: SnowflakeParts,
}

#[derive(Debug, Serialize)]
pub struct ParseFailure {
    pub id: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchParseResponse {
    pub total_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub results: Vec<ParsedId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ParseFailure>,
}

fn decode(id: i64) -> Option<ParsedId> {
    u64::try_from(id).ok().map(|raw| ParsedId {
        id,
        parts: snowflake::parse(raw),
    })
}

// Allocation may sleep while waiting for the next millisecond.
async fn allocate(ids: Arc<IdAllocator>, count: usize) -> Result<Vec<i64>, ApiError> {
    tokio::task::spawn_blocking(move || {
        (0..count)
            .map(|_| ids.generate())
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|err| ApiError::Internal(format!("id allocation task failed: {err}")))?
    .map_err(ApiError::from)
}

pub async fn generate(state: Extension<Arc<AppState>>) -> Result<Json<IdResponse>, ApiError> {
    let id = allocate(state.ids.clone(), 1)
        .await?
        .pop()
        .ok_or_else(|| ApiError::Internal("no id allocated".to_string()))?;

    Ok(Json(IdResponse {
        id,
        id_str: id.to_string(),
    }))
}

pub async fn generate_batch(
    state: Extension<Arc<AppState>>,
    query: Result<Query<BatchQuery>, QueryRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    let Query(query) = query?;
    let count = query.count.unwrap_or(DEFAULT_BATCH);
    if !(1..=MAX_BATCH).contains(&count) {
        return Err(ApiError::BadRequest(format!(
            "count must be between 1 and {MAX_BATCH}"
        )));
    }

    let ids = allocate(state.ids.clone(), count).await?;

    Ok(Json(BatchResponse { count: ids.len(), ids }))
}

pub async fn parse(Path(raw): Path<String>) -> Result<Json<ParsedId>, ApiError> {
    raw.parse::<i64>()
        .ok()
        .and_then(decode)
        .map(Json)
        .ok_or_else(|| ApiError::BadRequest(format!("'{raw}' is not a valid id")))
}

pub async fn parse_batch(
    body: Result<Json<Vec<i64>>, JsonRejection>,
) -> Result<Json<BatchParseResponse>, ApiError> {
    let Json(ids) = body?;
    if ids.is_empty() || ids.len() > MAX_PARSE_BATCH {
        return Err(ApiError::BadRequest(format!(
            "between 1 and {MAX_PARSE_BATCH} ids are required"
        )));
    }

    let total_count = ids.len();
    let mut results = Vec::with_capacity(total_count);
    let mut errors = Vec::new();
    for id in ids {
        match decode(id) {
            Some(parsed) => results.push(parsed),
            None => errors.push(ParseFailure {
                id,
                message: "negative ids are never allocated".to_string(),
            }),
        }
    }

    Ok(Json(BatchParseResponse {
        total_count,
        success_count: results.len(),
        error_count: errors.len(),
        results,
        errors,
    }))
}

pub async fn info(state: Extension<Arc<AppState>>) -> Json<AllocatorInfo> {
    Json(state.ids.info())
}
