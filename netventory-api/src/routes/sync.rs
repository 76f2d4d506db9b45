//! Sync REST Routes (cloud role)
//!
//! Push, legacy multi-model push, and pull. Every handler runs its
//! database work inside one transaction on one connection; transient
//! failures are retried with exponential backoff before surfacing 503,
//! and permanent database failures are captured in `sync_errors`.

use axum::{extract::State, routing::post, Json, Router};
use serde_json::Value;
use std::time::Duration;

use netventory_core::{
    ModelKind, PullBatch, PullRequest, PushOutcome, PushRequest, SyncRecord,
};
use netventory_sync::{process_pull, PullOptions, PushContext, PushProcessor};

use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::middleware::{site_auth_middleware, SiteContext, SiteExtractor};
use crate::pg_store::PgStore;
use crate::state::AppState;

/// Transient failures get three attempts per request before the client
/// sees a 503; the batch is transactional, so re-running it is safe.
const MAX_ATTEMPTS: u32 = 3;

async fn backoff(attempt: u32) {
    let delay = Duration::from_millis(100 * 2u64.pow(attempt.saturating_sub(1)));
    tokio::time::sleep(delay).await;
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// POST /api/v1/sync/push - apply a batch of site records
#[utoipa::path(
    post,
    path = "/api/v1/sync/push",
    tag = "Sync",
    request_body = PushRequest,
    responses(
        (status = 200, description = "Batch applied; counts per outcome", body = PushOutcome),
        (status = 400, description = "Malformed batch", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 503, description = "Transient failure, retry", body = ApiError),
    ),
)]
pub async fn push(
    State(state): State<AppState>,
    SiteExtractor(site): SiteExtractor,
    Json(body): Json<Value>,
) -> ApiResult<Json<PushOutcome>> {
    // Parsed by hand so every malformed batch is a 400, not a 422.
    let body: PushRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::validation_failed(format!("Malformed push batch: {}", e)))?;
    let outcome = run_push(&state, &site, &body.records).await?;
    Ok(Json(outcome))
}

/// POST /api/v1/sync - legacy multi-model push
///
/// Body shape is `{<model>: [record, ...], ...}`. JSON object key order
/// is not preserved by the parser, so models are processed in the fixed
/// `ModelKind::ALL` order, records in array order within each model.
#[utoipa::path(
    post,
    path = "/api/v1/sync",
    tag = "Sync",
    responses(
        (status = 200, description = "Batch applied; counts per outcome", body = PushOutcome),
        (status = 400, description = "Malformed batch", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
    ),
)]
pub async fn push_legacy(
    State(state): State<AppState>,
    SiteExtractor(site): SiteExtractor,
    Json(body): Json<Value>,
) -> ApiResult<Json<PushOutcome>> {
    let records = flatten_legacy_body(&body)?;
    let outcome = run_push(&state, &site, &records).await?;
    Ok(Json(outcome))
}

/// POST /api/v1/sync/pull - incremental pull since a cursor
#[utoipa::path(
    post,
    path = "/api/v1/sync/pull",
    tag = "Sync",
    request_body = PullRequest,
    responses(
        (status = 200, description = "Changed records, tombstones included", body = PullBatch),
        (status = 401, description = "Unauthorized", body = ApiError),
    ),
)]
pub async fn pull(
    State(state): State<AppState>,
    SiteExtractor(site): SiteExtractor,
    Json(body): Json<Value>,
) -> ApiResult<Json<PullBatch>> {
    let body: PullRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::validation_failed(format!("Malformed pull request: {}", e)))?;
    let options = PullOptions {
        page_size: state.config.pull_page_size,
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = attempt_pull(&state, &body, &options).await;
        match result {
            Ok(batch) => {
                tracing::debug!(
                    site_id = site.site_id,
                    records = batch.records.len(),
                    "pull served"
                );
                return Ok(Json(batch));
            }
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                tracing::warn!(attempt, error = %err, "transient pull failure, retrying");
                backoff(attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

// ============================================================================
// BATCH EXECUTION
// ============================================================================

async fn run_push(
    state: &AppState,
    site: &SiteContext,
    records: &[SyncRecord],
) -> ApiResult<PushOutcome> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match attempt_push(state, site, records).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                tracing::warn!(
                    site_id = site.site_id,
                    attempt,
                    error = %err,
                    "transient push failure, retrying"
                );
                backoff(attempt).await;
            }
            Err(err) => {
                // Permanent database failures are captured by trace hash;
                // transient ones that exhausted their retries are not.
                if err.code == ErrorCode::DatabaseError {
                    state.db.log_sync_error(None, "push", &err.message).await;
                }
                return Err(err);
            }
        }
    }
}

async fn attempt_push(
    state: &AppState,
    site: &SiteContext,
    records: &[SyncRecord],
) -> ApiResult<PushOutcome> {
    let mut conn = state.db.get_conn().await?;
    let tx = conn.transaction().await?;
    let outcome = {
        let store = PgStore::new(&tx);
        PushProcessor::new(&store, PushContext::from_site(site.site_id))
            .process(records)
            .await
            .map_err(ApiError::from)?
    };
    tx.commit().await?;
    Ok(outcome)
}

async fn attempt_pull(
    state: &AppState,
    request: &PullRequest,
    options: &PullOptions,
) -> ApiResult<PullBatch> {
    let mut conn = state.db.get_conn().await?;
    let tx = conn.transaction().await?;
    let batch = {
        let store = PgStore::new(&tx);
        process_pull(&store, request, options)
            .await
            .map_err(ApiError::from)?
    };
    tx.commit().await?;
    Ok(batch)
}

/// Flatten the legacy `{<model>: [record, ...]}` body into an ordered
/// record list. Unknown model keys abort the batch.
fn flatten_legacy_body(body: &Value) -> ApiResult<Vec<SyncRecord>> {
    let object = body
        .as_object()
        .ok_or_else(|| ApiError::invalid_input("Expected a JSON object keyed by model name"))?;

    for key in object.keys() {
        if key.parse::<ModelKind>().is_err() {
            return Err(ApiError::validation_failed(format!(
                "Unknown model kind: {}",
                key
            )));
        }
    }

    let mut records = Vec::new();
    for model in ModelKind::ALL {
        let Some(value) = object.get(model.table_name()) else {
            continue;
        };
        let items = value.as_array().ok_or_else(|| {
            ApiError::invalid_input(format!("'{}' must be an array of records", model))
        })?;
        for item in items {
            let mut record = item.as_object().cloned().ok_or_else(|| {
                ApiError::invalid_input(format!("'{}' records must be objects", model))
            })?;
            record.insert("model".into(), Value::String(model.table_name().into()));
            let record: SyncRecord = serde_json::from_value(Value::Object(record))
                .map_err(|e| ApiError::validation_failed(format!("Malformed record: {}", e)))?;
            records.push(record);
        }
    }
    Ok(records)
}

// ============================================================================
// ROUTER SETUP
// ============================================================================

/// Create the sync router. Mounted only on cloud instances.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/sync/push", post(push))
        .route("/sync", post(push_legacy))
        .route("/sync/pull", post(pull))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            site_auth_middleware,
        ))
        .with_state(state)
}
