//! OpenAPI Documentation
//!
//! Aggregated OpenAPI spec for the sync surface, served at
//! `/openapi.json`.

use utoipa::OpenApi;

use crate::error::{ApiError, ErrorCode};
use crate::routes::check_in::CheckInReply;
use crate::routes::health::{ComponentHealth, HealthDetails, HealthResponse, HealthStatus};
use netventory_core::{
    CheckIn, ModelKind, PullBatch, PullCursor, PullRequest, PullSyncState, PushOutcome,
    PushRequest, SyncRecord,
};

/// OpenAPI documentation for the Netventory sync API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Netventory Sync API",
        description = "Hub-and-spoke replication endpoints between site and cloud instances",
        license(name = "MIT")
    ),
    paths(
        crate::routes::sync::push,
        crate::routes::sync::push_legacy,
        crate::routes::sync::pull,
        crate::routes::check_in::check_in,
        crate::routes::health::ping,
        crate::routes::health::liveness,
        crate::routes::health::readiness,
    ),
    components(schemas(
        SyncRecord,
        ModelKind,
        PushRequest,
        PushOutcome,
        PullRequest,
        PullCursor,
        PullSyncState,
        PullBatch,
        CheckIn,
        CheckInReply,
        HealthResponse,
        HealthStatus,
        HealthDetails,
        ComponentHealth,
        ApiError,
        ErrorCode,
    )),
    tags(
        (name = "Sync", description = "Push, pull, and check-in endpoints (cloud role)"),
        (name = "Health", description = "Liveness and readiness probes"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_document_builds() {
        let doc = ApiDoc::openapi();
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("/api/v1/sync/push"));
        assert!(json.contains("/api/v1/sync/pull"));
        assert!(json.contains("/api/sync/check-in"));
    }
}
