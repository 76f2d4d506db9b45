//! Netventory Sync Server Entry Point
//!
//! Bootstraps configuration, waits for the database, runs the schema
//! self-check, and starts the Axum HTTP server for this instance's role.

use std::net::SocketAddr;

use axum::Router;
use chrono::Utc;
use netventory_api::{
    create_api_router, spawn_sync_workers, ApiConfig, ApiError, ApiResult, AppState, DbClient,
    DbConfig, PgStore,
};
use netventory_sync::run_self_check;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ApiResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let api_config = ApiConfig::from_env();
    let db_config = DbConfig::from_env();

    let db = DbClient::from_config(&db_config)?;
    db.wait_until_ready(&db_config).await?;

    if std::env::var("NETVENTORY_BOOTSTRAP_SCHEMA")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
    {
        db.apply_schema().await?;
    }

    run_startup_self_check(&db).await?;

    // One-shot ops hook: NETVENTORY_PROVISION_SITE="<id>:<name>" mints a
    // site key at startup and logs it once.
    if let Ok(value) = std::env::var("NETVENTORY_PROVISION_SITE") {
        if let Some((id, name)) = value.split_once(':') {
            let site_id = id.trim().parse::<i64>().map_err(|_| {
                ApiError::invalid_input(format!("Invalid NETVENTORY_PROVISION_SITE: {}", value))
            })?;
            let key = db.provision_site_key(site_id, name.trim()).await?;
            tracing::info!(site_id, api_key = %key.api_key, "site key provisioned");
        }
    }

    tracing::info!(
        role = api_config.role.as_str(),
        inventory = api_config.inventory_enabled,
        network = api_config.network_enabled,
        "starting netventory sync server"
    );

    let worker_handles = if api_config.is_cloud() {
        Vec::new()
    } else {
        // Worker cursors live in process memory, so every start of a
        // local instance is a recovery point worth a breadcrumb.
        record_local_recovery(&db, "process start: sync cursors reset to epoch").await?;
        spawn_sync_workers(db.clone(), &api_config)
    };

    let state = AppState::new(db, api_config);
    let app: Router = create_api_router(state);

    let addr = resolve_bind_addr()?;
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    for handle in worker_handles {
        handle.abort();
    }
    Ok(())
}

/// Compare the declared schema against the live database and record
/// every divergence before serving traffic.
async fn run_startup_self_check(db: &DbClient) -> ApiResult<()> {
    let mut conn = db.get_conn().await?;
    let tx = conn.transaction().await?;
    let issues = {
        let store = PgStore::new(&tx);
        run_self_check(&store, Utc::now())
            .await
            .map_err(ApiError::from)?
    };
    tx.commit().await?;
    if !issues.is_empty() {
        tracing::warn!(
            issues = issues.len(),
            "schema self-check recorded divergences"
        );
    }
    Ok(())
}

async fn record_local_recovery(db: &DbClient, description: &str) -> ApiResult<()> {
    use netventory_sync::{ChangeLog, ChangeLogEvent};

    let mut conn = db.get_conn().await?;
    let tx = conn.transaction().await?;
    {
        let store = PgStore::new(&tx);
        store
            .record(ChangeLogEvent::LocalRecovery {
                description: description.to_string(),
                at: Utc::now(),
            })
            .await
            .map_err(ApiError::from)?;
    }
    tx.commit().await?;
    Ok(())
}

fn resolve_bind_addr() -> ApiResult<SocketAddr> {
    let host = std::env::var("NETVENTORY_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port_str = std::env::var("PORT")
        .ok()
        .or_else(|| std::env::var("NETVENTORY_PORT").ok())
        .unwrap_or_else(|| "8080".to_string());
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ApiError::invalid_input(format!("Invalid port value: {}", port_str)))?;

    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
}
