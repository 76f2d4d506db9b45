//! Site-Side Sync Workers (local role)
//!
//! Background loops that originate sync traffic from a local instance:
//! the push worker ships rows whose version is ahead of the shipped
//! watermark kept in each row's `sync_state`; the pull worker applies
//! the cloud's changes through the same push processor (mirror mode)
//! and checks in afterwards. Non-200 replies mean no progress; the
//! server is transactional per request, so re-sending is always safe.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use netventory_core::{CheckIn, ModelKind, PullBatch, PullCursor, StoredRecord, SyncRecord};
use netventory_sync::{PushContext, PushProcessor, RecordStore};

use crate::config::ApiConfig;
use crate::db::DbClient;
use crate::error::{ApiError, ApiResult};
use crate::pg_store::PgStore;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Cloud connection settings for the workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the cloud instance.
    pub cloud_url: String,
    /// This site's provisioned id.
    pub site_id: i64,
    /// This site's api key.
    pub api_key: String,
    /// Poll interval.
    pub interval: Duration,
    /// Max records per shipped batch.
    pub batch_size: usize,
}

impl WorkerConfig {
    /// Read worker settings from the environment. Returns None when
    /// `SYNC_CLOUD_URL`, `SYNC_SITE_ID`, or `SYNC_API_KEY` is missing.
    ///
    /// Environment variables:
    /// - `SYNC_CLOUD_URL`: cloud base URL (e.g. https://cloud.example)
    /// - `SYNC_SITE_ID`: this site's id
    /// - `SYNC_API_KEY`: this site's key
    /// - `SYNC_INTERVAL_SECS`: poll interval (default 60)
    /// - `SYNC_BATCH_SIZE`: records per push batch (default 500)
    pub fn from_env() -> Option<Self> {
        let cloud_url = std::env::var("SYNC_CLOUD_URL")
            .ok()?
            .trim_end_matches('/')
            .to_string();
        let site_id = std::env::var("SYNC_SITE_ID").ok()?.parse().ok()?;
        let api_key = std::env::var("SYNC_API_KEY").ok()?;
        Some(Self {
            cloud_url,
            site_id,
            api_key,
            interval: Duration::from_secs(
                std::env::var("SYNC_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            batch_size: std::env::var("SYNC_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500),
        })
    }
}

/// Spawn the workers this instance's flags enable. Local role only.
pub fn spawn_sync_workers(db: DbClient, api_config: &ApiConfig) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    if !api_config.push_worker_enabled && !api_config.pull_worker_enabled {
        return handles;
    }

    let Some(config) = WorkerConfig::from_env() else {
        tracing::warn!(
            "sync workers enabled but SYNC_CLOUD_URL/SYNC_SITE_ID/SYNC_API_KEY not set"
        );
        return handles;
    };

    if api_config.push_worker_enabled {
        let db = db.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            push_worker(db, config).await;
        }));
    }
    if api_config.pull_worker_enabled {
        handles.push(tokio::spawn(async move {
            pull_worker(db, config).await;
        }));
    }
    handles
}

// ============================================================================
// PUSH WORKER
// ============================================================================

async fn push_worker(db: DbClient, config: WorkerConfig) {
    tracing::info!(cloud = %config.cloud_url, site_id = config.site_id, "push worker started");
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        ticker.tick().await;
        if let Err(err) = push_once(&db, &config, &client).await {
            tracing::warn!(error = %err, "push worker cycle failed");
        }
    }
}

/// Ship one batch of pending rows. The watermark in `sync_state` only
/// advances after the cloud confirms the batch.
async fn push_once(db: &DbClient, config: &WorkerConfig, client: &reqwest::Client) -> ApiResult<()> {
    let pending = db.pending_push_records(config.batch_size).await?;
    if pending.is_empty() {
        return Ok(());
    }

    let records: Vec<Value> = pending.iter().map(StoredRecord::to_wire).collect();
    let response = client
        .post(format!("{}/api/v1/sync/push", config.cloud_url))
        .header("Site-ID", config.site_id.to_string())
        .header("API-Key", &config.api_key)
        .json(&json!({ "records": records }))
        .send()
        .await
        .map_err(|e| ApiError::service_unavailable(format!("cloud unreachable: {}", e)))?;

    if !response.status().is_success() {
        return Err(ApiError::service_unavailable(format!(
            "cloud push returned {}",
            response.status()
        )));
    }

    let now = Utc::now();
    for row in &pending {
        db.mark_pushed(row.model, row.id, row.version, now).await?;
    }
    tracing::info!(shipped = pending.len(), "push worker shipped batch");
    Ok(())
}

// ============================================================================
// PULL WORKER
// ============================================================================

async fn pull_worker(db: DbClient, config: WorkerConfig) {
    tracing::info!(cloud = %config.cloud_url, site_id = config.site_id, "pull worker started");
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(config.interval);
    let mut since: DateTime<Utc> = DateTime::UNIX_EPOCH;

    loop {
        ticker.tick().await;
        let mut cursor: Option<PullCursor> = None;
        let mut cycle_ok = true;

        // Page until the cloud reports no truncation.
        loop {
            match pull_once(&db, &config, &client, since, cursor.take()).await {
                Ok((batch, high_water)) => {
                    if let Some(at) = high_water {
                        since = since.max(at);
                    }
                    if batch.sync_state.truncated {
                        cursor = batch.sync_state.cursor;
                        continue;
                    }
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "pull worker cycle failed");
                    cycle_ok = false;
                    break;
                }
            }
        }

        check_in(&config, &client, cycle_ok).await;
    }
}

/// Fetch one page from the cloud and apply it locally in one
/// transaction. Returns the batch and the highest `updated_at` seen.
async fn pull_once(
    db: &DbClient,
    config: &WorkerConfig,
    client: &reqwest::Client,
    since: DateTime<Utc>,
    cursor: Option<PullCursor>,
) -> ApiResult<(PullBatch, Option<DateTime<Utc>>)> {
    let response = client
        .post(format!("{}/api/v1/sync/pull", config.cloud_url))
        .header("Site-ID", config.site_id.to_string())
        .header("API-Key", &config.api_key)
        .json(&json!({
            "since": since.to_rfc3339(),
            "models": ModelKind::ALL,
            "cursor": cursor,
        }))
        .send()
        .await
        .map_err(|e| ApiError::service_unavailable(format!("cloud unreachable: {}", e)))?;

    if !response.status().is_success() {
        return Err(ApiError::service_unavailable(format!(
            "cloud pull returned {}",
            response.status()
        )));
    }
    let batch: PullBatch = response
        .json()
        .await
        .map_err(|e| ApiError::invalid_input(format!("malformed pull reply: {}", e)))?;

    let mut high_water: Option<DateTime<Utc>> = None;
    let mut records = Vec::with_capacity(batch.records.len());
    for wire in &batch.records {
        let mut object = wire
            .as_object()
            .cloned()
            .ok_or_else(|| ApiError::invalid_input("pull records must be objects"))?;
        // The cloud's local id means nothing here; uuid is the identity.
        object.remove("id");
        if let Some(at) = object
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            let at = at.with_timezone(&Utc);
            high_water = Some(high_water.map_or(at, |hw| hw.max(at)));
        }
        let record: SyncRecord = serde_json::from_value(Value::Object(object))
            .map_err(|e| ApiError::invalid_input(format!("malformed pull record: {}", e)))?;
        records.push(record);
    }

    if !records.is_empty() {
        apply_pulled(db, config, &records).await?;
        tracing::info!(applied = records.len(), "pull worker applied batch");
    }
    Ok((batch, high_water))
}

/// Apply pulled records in mirror mode and advance the shipped watermark
/// so the push worker does not echo them straight back.
async fn apply_pulled(db: &DbClient, config: &WorkerConfig, records: &[SyncRecord]) -> ApiResult<()> {
    let mut conn = db.get_conn().await?;
    let tx = conn.transaction().await?;
    {
        let store = PgStore::new(&tx);
        PushProcessor::new(&store, PushContext::from_cloud(config.site_id))
            .process(records)
            .await
            .map_err(ApiError::from)?;

        let now = Utc::now();
        for record in records {
            let Some(uuid) = record.uuid else { continue };
            if let Some(row) = store
                .get_by_uuid(record.model, uuid)
                .await
                .map_err(ApiError::from)?
            {
                store
                    .set_sync_state(
                        record.model,
                        row.id,
                        Some(json!({
                            "pushed_version": row.version,
                            "pushed_at": now.to_rfc3339(),
                        })),
                    )
                    .await
                    .map_err(ApiError::from)?;
            }
        }
    }
    tx.commit().await?;
    Ok(())
}

// ============================================================================
// CHECK-IN
// ============================================================================

async fn check_in(config: &WorkerConfig, client: &reqwest::Client, cycle_ok: bool) {
    let body = CheckIn {
        site_id: config.site_id,
        git_version: option_env!("GIT_VERSION")
            .unwrap_or(env!("CARGO_PKG_VERSION"))
            .to_string(),
        sync_status: if cycle_ok { "ok" } else { "error" }.to_string(),
        last_update_status: "applied".to_string(),
    };
    let result = client
        .post(format!("{}/api/sync/check-in", config.cloud_url))
        .header("Site-ID", config.site_id.to_string())
        .header("API-Key", &config.api_key)
        .json(&body)
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            tracing::warn!(status = %response.status(), "check-in rejected");
        }
        Err(err) => {
            tracing::warn!(error = %err, "check-in failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_requires_cloud_settings() {
        // With the trio of SYNC_* variables unset, no config materializes.
        std::env::remove_var("SYNC_CLOUD_URL");
        assert!(WorkerConfig::from_env().is_none());
    }
}
