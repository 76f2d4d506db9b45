//! REST API Routes Module
//!
//! Route handlers for the sync surface plus role-gated router assembly.
//! The role gate works by not wiring cloud-only routers into the tree on
//! a local instance: probes get an honest 404 instead of a 403.

pub mod check_in;
pub mod health;
pub mod sync;

use axum::{
    http::{header, header::HeaderName, HeaderValue, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::config::ApiConfig;
use crate::openapi::ApiDoc;
use crate::state::AppState;

// ============================================================================
// OPENAPI ENDPOINT
// ============================================================================

/// Handler for /openapi.json endpoint.
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// ============================================================================
// ROUTER ASSEMBLY
// ============================================================================

/// Create the complete router for this instance's role.
///
/// Both roles serve:
/// - Health checks at /health/* (public)
/// - OpenAPI spec at /openapi.json
///
/// Cloud role additionally mounts (site-key authenticated):
/// - POST /api/v1/sync/push, /api/v1/sync, /api/v1/sync/pull
/// - POST /api/sync/check-in
pub fn create_api_router(state: AppState) -> Router {
    let mut router = Router::new()
        .nest("/health", health::create_router(state.clone()))
        .route("/openapi.json", get(openapi_json));

    if state.config.is_cloud() {
        router = router
            .nest("/api/v1", sync::create_router(state.clone()))
            .nest("/api/sync", check_in::create_router(state.clone()));
    } else {
        tracing::info!("local role: sync endpoints not mounted");
    }

    let cors = build_cors_layer(&state.config);
    router
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// ============================================================================
// CORS LAYER
// ============================================================================

/// Build the CORS layer from ApiConfig. Empty origin list means allow
/// all (development); otherwise only configured origins.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("site-id"),
            HeaderName::from_static("api-key"),
        ])
        .max_age(Duration::from_secs(86400));

    if config.cors_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbClient, DbConfig};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use netventory_core::InstanceRole;
    use tower::ServiceExt;

    /// Pool creation is lazy, so a router over an unreachable database
    /// still answers everything that fails before touching it.
    fn test_state(role: InstanceRole) -> AppState {
        let db = DbClient::from_config(&DbConfig::default()).unwrap();
        let config = ApiConfig {
            role,
            ..ApiConfig::default()
        };
        AppState::new(db, config)
    }

    fn sync_request(path: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap()
    }

    #[tokio::test]
    async fn local_role_does_not_mount_sync_routes() {
        let app = create_api_router(test_state(InstanceRole::Local));
        for path in ["/api/v1/sync/push", "/api/v1/sync", "/api/v1/sync/pull", "/api/sync/check-in"]
        {
            let response = app.clone().oneshot(sync_request(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", path);
        }
    }

    #[tokio::test]
    async fn cloud_role_requires_site_headers() {
        let app = create_api_router(test_state(InstanceRole::Cloud));
        // No Site-ID/API-Key headers: rejected before any database work.
        let response = app
            .clone()
            .oneshot(sync_request("/api/v1/sync/pull"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(sync_request("/api/sync/check-in"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_live_is_public_on_both_roles() {
        for role in [InstanceRole::Local, InstanceRole::Cloud] {
            let app = create_api_router(test_state(role));
            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/health/live")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn non_integer_site_id_is_unauthorized() {
        let app = create_api_router(test_state(InstanceRole::Cloud));
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/sync/push")
            .header("content-type", "application/json")
            .header("site-id", "not-a-number")
            .header("api-key", "whatever")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
