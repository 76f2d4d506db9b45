//! Netventory API - HTTP Sync Surface
//!
//! Axum routes for the replication protocol, site-key authentication
//! middleware, the PostgreSQL implementation of the storage traits, and
//! the site-side background workers.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod openapi;
pub mod pg_store;
pub mod routes;
pub mod state;
pub mod workers;

pub use config::ApiConfig;
pub use db::{DbClient, DbConfig};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use pg_store::PgStore;
pub use routes::create_api_router;
pub use state::AppState;
pub use workers::{spawn_sync_workers, WorkerConfig};
