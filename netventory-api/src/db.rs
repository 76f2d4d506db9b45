//! Database Connection Pool Module
//!
//! PostgreSQL connection pooling via deadpool-postgres. The pool-level
//! `DbClient` owns startup concerns (wait-for-database, schema bootstrap,
//! health checks) and the autocommit operations the sync protocol allows
//! outside a transaction: site-key reads, `last_used_at` touches,
//! check-in upserts, and worker bookkeeping. Everything that mutates
//! sync-managed rows goes through the transaction-scoped
//! [`crate::pg_store::PgStore`].

use std::time::Duration;

use chrono::Utc;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;

use netventory_core::{
    compute_error_hash, CheckIn, ModelKind, SiteKey, StoreError, StoredRecord, Timestamp,
};
use netventory_sync::SiteRegistry;

use crate::error::{ApiError, ApiResult};
use crate::pg_store::{record_from_row, RECORD_SELECT_COLUMNS};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Maximum pool size.
    pub max_size: usize,
    /// Startup wait: attempts before giving up on the database.
    pub wait_attempts: u32,
    /// Startup wait: delay between attempts.
    pub wait_delay: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost:5432/netventory".to_string(),
            max_size: 16,
            wait_attempts: 10,
            wait_delay: Duration::from_secs(3),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: connection string
    /// - `NETVENTORY_DB_POOL_SIZE`: max pool size (default 16)
    /// - `DB_WAIT_ATTEMPTS`: startup connection attempts (default 10)
    /// - `DB_WAIT_DELAY`: seconds between attempts (default 3)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("DATABASE_URL").unwrap_or(defaults.url),
            max_size: std::env::var("NETVENTORY_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            wait_attempts: std::env::var("DB_WAIT_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.wait_attempts),
            wait_delay: Duration::from_secs(
                std::env::var("DB_WAIT_DELAY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let pg_config: tokio_postgres::Config = self.url.parse().map_err(|e| {
            ApiError::invalid_input(format!("Invalid DATABASE_URL: {}", e))
        })?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        Pool::builder(manager)
            .max_size(self.max_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| ApiError::internal_error(format!("Failed to create pool: {}", e)))
    }
}

// ============================================================================
// ERROR CLASSIFICATION
// ============================================================================

/// Map a tokio-postgres error onto the store error taxonomy.
/// Serialization failures and deadlocks are transient (retry on a fresh
/// transaction); unique/check violations are constraint violations.
pub(crate) fn store_error_from_pg(err: tokio_postgres::Error) -> StoreError {
    if let Some(db) = err.as_db_error() {
        let code = db.code();
        if code == &SqlState::T_R_SERIALIZATION_FAILURE || code == &SqlState::T_R_DEADLOCK_DETECTED
        {
            return StoreError::Transient {
                reason: db.message().to_string(),
            };
        }
        if code.code().starts_with("23") {
            return StoreError::ConstraintViolation {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
                reason: db.message().to_string(),
            };
        }
        return StoreError::Backend {
            reason: db.message().to_string(),
        };
    }
    if err.is_closed() {
        return StoreError::Transient {
            reason: "database connection closed".to_string(),
        };
    }
    StoreError::Backend {
        reason: err.to_string(),
    }
}

// ============================================================================
// DATABASE CLIENT WRAPPER
// ============================================================================

/// Pool-owning database client.
#[derive(Clone)]
pub struct DbClient {
    pool: Pool,
}

impl DbClient {
    /// Create a new database client with the given pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a new database client from configuration.
    pub fn from_config(config: &DbConfig) -> ApiResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Get a connection from the pool.
    pub async fn get_conn(&self) -> ApiResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(ApiError::from)
    }

    /// Cheap connectivity probe.
    pub async fn health_check(&self) -> ApiResult<()> {
        let conn = self.get_conn().await?;
        conn.execute("SELECT 1", &[]).await?;
        Ok(())
    }

    /// Block startup until the database answers, up to the configured
    /// attempt limit.
    pub async fn wait_until_ready(&self, config: &DbConfig) -> ApiResult<()> {
        for attempt in 1..=config.wait_attempts {
            match self.health_check().await {
                Ok(()) => {
                    tracing::info!(attempt, "database is ready");
                    return Ok(());
                }
                Err(err) if attempt < config.wait_attempts => {
                    tracing::warn!(attempt, error = %err, "database not ready, retrying");
                    tokio::time::sleep(config.wait_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Apply the bundled bootstrap DDL. Idempotent (`IF NOT EXISTS`
    /// throughout); real migration tooling is an external concern.
    pub async fn apply_schema(&self) -> ApiResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(include_str!("../sql/schema.sql")).await?;
        tracing::info!("schema bootstrap applied");
        Ok(())
    }

    /// Capture a permanent server-side failure in `sync_errors`,
    /// deduplicated by trace hash. Best-effort: uses its own connection
    /// because the failing transaction is already aborted.
    pub async fn log_sync_error(&self, model: Option<ModelKind>, action: &str, trace: &str) {
        let hash = compute_error_hash(trace);
        let result = async {
            let conn = self.get_conn().await?;
            conn.execute(
                "INSERT INTO sync_errors (model_name, action, error_trace, error_hash, timestamp) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (error_hash) DO NOTHING",
                &[
                    &model.map(|m| m.table_name()),
                    &action,
                    &trace,
                    &hash,
                    &Utc::now(),
                ],
            )
            .await?;
            Ok::<(), ApiError>(())
        }
        .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "failed to record sync error");
        }
    }

    /// Provision a site key, generating fresh key material. Returns the
    /// stored row; fails if the site already has one.
    pub async fn provision_site_key(&self, site_id: i64, site_name: &str) -> ApiResult<SiteKey> {
        let api_key = crate::middleware::generate_site_key();
        let now = Utc::now();
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO site_keys (site_id, site_name, api_key, active, created_at) \
             VALUES ($1, $2, $3, TRUE, $4)",
            &[&site_id, &site_name, &api_key, &now],
        )
        .await?;
        tracing::info!(site_id, site_name, "provisioned site key");
        Ok(SiteKey {
            site_id,
            site_name: site_name.to_string(),
            api_key,
            active: true,
            created_at: now,
            last_used_at: None,
        })
    }

    // ========================================================================
    // WORKER BOOKKEEPING (local role)
    // ========================================================================

    /// Rows whose version is ahead of what `sync_state` says was shipped.
    pub async fn pending_push_records(&self, limit: usize) -> ApiResult<Vec<StoredRecord>> {
        let conn = self.get_conn().await?;
        let mut pending = Vec::new();
        for model in ModelKind::ALL {
            if pending.len() >= limit {
                break;
            }
            let sql = format!(
                "SELECT {columns}, to_jsonb(t) AS doc FROM {table} t \
                 WHERE t.sync_state IS NULL \
                    OR COALESCE((t.sync_state->>'pushed_version')::bigint, 0) < t.version \
                 ORDER BY t.updated_at LIMIT {limit}",
                columns = RECORD_SELECT_COLUMNS,
                table = model.table_name(),
                limit = limit - pending.len(),
            );
            let rows = conn.query(sql.as_str(), &[]).await?;
            for row in rows {
                pending.push(record_from_row(model, &row).map_err(ApiError::from)?);
            }
        }
        Ok(pending)
    }

    /// Remember that a row was shipped at the given version.
    pub async fn mark_pushed(
        &self,
        model: ModelKind,
        id: i64,
        version: i64,
        at: Timestamp,
    ) -> ApiResult<()> {
        let conn = self.get_conn().await?;
        let state = serde_json::json!({
            "pushed_version": version,
            "pushed_at": at.to_rfc3339(),
        });
        let sql = format!(
            "UPDATE {} SET sync_state = $2 WHERE id = $1",
            model.table_name()
        );
        conn.execute(sql.as_str(), &[&id, &state]).await?;
        Ok(())
    }
}

// ============================================================================
// SITE REGISTRY (pool-level)
// ============================================================================

/// Site-key reads and check-in upserts run autocommit: a pull must not
/// mutate anything beyond `site_keys.last_used_at`, and check-in is a
/// single atomic statement.
#[async_trait::async_trait]
impl SiteRegistry for DbClient {
    async fn find_site_key(&self, site_id: i64) -> Result<Option<SiteKey>, StoreError> {
        let conn = self.pool.get().await.map_err(|e| StoreError::Backend {
            reason: e.to_string(),
        })?;
        let row = conn
            .query_opt(
                "SELECT site_id, site_name, api_key, active, created_at, last_used_at \
                 FROM site_keys WHERE site_id = $1",
                &[&site_id],
            )
            .await
            .map_err(store_error_from_pg)?;

        Ok(row.map(|row| SiteKey {
            site_id: row.get(0),
            site_name: row.get(1),
            api_key: row.get(2),
            active: row.get(3),
            created_at: row.get(4),
            last_used_at: row.get(5),
        }))
    }

    async fn touch_site_key(&self, site_id: i64, at: Timestamp) -> Result<(), StoreError> {
        let conn = self.pool.get().await.map_err(|e| StoreError::Backend {
            reason: e.to_string(),
        })?;
        conn.execute(
            "UPDATE site_keys SET last_used_at = $2 WHERE site_id = $1",
            &[&site_id, &at],
        )
        .await
        .map_err(store_error_from_pg)?;
        Ok(())
    }

    async fn record_check_in(
        &self,
        check_in: &CheckIn,
        at: Timestamp,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get().await.map_err(|e| StoreError::Backend {
            reason: e.to_string(),
        })?;
        conn.execute(
            "INSERT INTO connected_sites \
                 (site_id, git_version, sync_status, last_update_status, last_check_in) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (site_id) DO UPDATE SET \
                 git_version = EXCLUDED.git_version, \
                 sync_status = EXCLUDED.sync_status, \
                 last_update_status = EXCLUDED.last_update_status, \
                 last_check_in = EXCLUDED.last_check_in",
            &[
                &check_in.site_id,
                &check_in.git_version,
                &check_in.sync_status,
                &check_in.last_update_status,
                &at,
            ],
        )
        .await
        .map_err(store_error_from_pg)?;
        Ok(())
    }
}
