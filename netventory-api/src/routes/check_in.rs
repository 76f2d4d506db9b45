//! Check-In Route (cloud role)
//!
//! Per-site heartbeat. Upserts the site's `connected_sites` row; repeated
//! identical payloads leave the row count at one while `last_check_in`
//! advances.

use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use netventory_core::CheckIn;
use netventory_sync::SiteRegistry;

use crate::error::{ApiError, ApiResult};
use crate::middleware::{site_auth_middleware, SiteExtractor};
use crate::pg_store::PgStore;
use crate::state::AppState;

/// Reply of a successful check-in.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CheckInReply {
    pub ok: bool,
}

/// POST /api/sync/check-in - record a site heartbeat
#[utoipa::path(
    post,
    path = "/api/sync/check-in",
    tag = "Sync",
    request_body = CheckIn,
    responses(
        (status = 200, description = "Heartbeat recorded", body = CheckInReply),
        (status = 400, description = "Site mismatch", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
    ),
)]
pub async fn check_in(
    State(state): State<AppState>,
    SiteExtractor(site): SiteExtractor,
    Json(body): Json<CheckIn>,
) -> ApiResult<Json<CheckInReply>> {
    if body.site_id != site.site_id {
        return Err(ApiError::invalid_input(format!(
            "site_id {} does not match authenticated site {}",
            body.site_id, site.site_id
        )));
    }

    let mut conn = state.db.get_conn().await?;
    let tx = conn.transaction().await?;
    {
        let store = PgStore::new(&tx);
        store
            .record_check_in(&body, Utc::now())
            .await
            .map_err(ApiError::from)?;
    }
    tx.commit().await?;

    tracing::info!(
        site_id = site.site_id,
        git_version = %body.git_version,
        sync_status = %body.sync_status,
        "site checked in"
    );
    Ok(Json(CheckInReply { ok: true }))
}

/// Create the check-in router. Mounted only on cloud instances.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/check-in", post(check_in))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            site_auth_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_in_reply_serialization() {
        let json = serde_json::to_string(&CheckInReply { ok: true }).unwrap();
        assert_eq!(json, r#"{"ok":true}"#);
    }
}
