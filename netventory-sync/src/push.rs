//! Push processor (C4).
//!
//! Applies an authenticated batch of records to the receiving store,
//! record by record, in arrival order. Each record is located (uuid, then
//! id, then natural key), run through the merge decision core, and
//! written together with its log entries. Natural-key collisions are
//! handed to the duplicate resolver and the lookup retried once.

use chrono::Utc;
use serde_json::{json, Value};

use netventory_core::{
    natural_key_of, new_record_uuid, ModelKind, PushOutcome, StoredRecord, SyncAction,
    SyncOrigin, SyncPeer, SyncRecord, SyncResult, Timestamp, ValidationError,
    VIRTUAL_WAREHOUSE_SITE_ID,
};

use crate::changelog::{ChangeLog, ChangeLogEvent};
use crate::dedupe::{absorb_incoming_duplicate, resolve_duplicates};
use crate::merge::{decide, MergeDecision};
use crate::store::{NewRecord, RecordStore};

/// Authenticated context a batch is processed under.
#[derive(Debug, Clone)]
pub struct PushContext {
    pub site_id: i64,
    /// Which end the batch came from.
    pub origin: SyncPeer,
    /// Which end is applying it.
    pub target: SyncPeer,
    /// Acting user, when the sending side knows one.
    pub user_id: Option<i64>,
    /// Mirror mode: accepted records keep the sender's version instead
    /// of bumping past it. A site applying the authoritative cloud's
    /// records must adopt versions, or every round trip would inflate
    /// them and the two sides would never reach the idempotent-skip
    /// fixpoint. Local divergence (conflicts) still bumps so it
    /// propagates back up.
    pub adopt_versions: bool,
}

impl PushContext {
    /// A site pushing into the cloud.
    pub fn from_site(site_id: i64) -> Self {
        Self {
            site_id,
            origin: SyncPeer::Site,
            target: SyncPeer::Cloud,
            user_id: None,
            adopt_versions: false,
        }
    }

    /// The cloud's records being applied on a site (pull worker).
    pub fn from_cloud(site_id: i64) -> Self {
        Self {
            site_id,
            origin: SyncPeer::Cloud,
            target: SyncPeer::Site,
            user_id: None,
            adopt_versions: true,
        }
    }

    /// Deletion provenance implied by the batch origin.
    fn deletion_origin(&self) -> SyncOrigin {
        match self.origin {
            SyncPeer::Site => SyncOrigin::Local,
            SyncPeer::Cloud => SyncOrigin::Cloud,
        }
    }
}

/// Applies push batches against a record store.
pub struct PushProcessor<'a, S> {
    store: &'a S,
    ctx: PushContext,
}

impl<'a, S: RecordStore + ChangeLog> PushProcessor<'a, S> {
    pub fn new(store: &'a S, ctx: PushContext) -> Self {
        Self { store, ctx }
    }

    /// Process a batch in arrival order. A validation failure aborts the
    /// whole batch; storage errors propagate for the caller's retry
    /// policy. Counts are per spec: conflicts also count as accepted.
    pub async fn process(&self, records: &[SyncRecord]) -> SyncResult<PushOutcome> {
        let mut outcome = PushOutcome::default();
        for record in records {
            validate(record)?;
            self.apply_one(record, &mut outcome).await?;
        }
        tracing::info!(
            site_id = self.ctx.site_id,
            accepted = outcome.accepted,
            conflicts = outcome.conflicts,
            skipped = outcome.skipped,
            "push batch applied"
        );
        Ok(outcome)
    }

    async fn apply_one(&self, record: &SyncRecord, outcome: &mut PushOutcome) -> SyncResult<()> {
        let now = Utc::now();
        let key = natural_key_of(record.model, &record.sanitized_fields());

        // Step 1 may run twice: a natural-key collision collapses the
        // pair and retries the lookup against the survivor.
        for attempt in 0..2 {
            let mut existing = None;
            if let Some(uuid) = record.uuid {
                existing = self.store.get_by_uuid(record.model, uuid).await?;
            }
            if existing.is_none() {
                if let Some(id) = record.id {
                    existing = self.store.get_by_id(record.model, id).await?;
                }
            }

            match existing {
                Some(current) => {
                    if attempt == 0 {
                        if let Some(key) = &key {
                            if let Some(other) = self.store.find_by_natural_key(key).await? {
                                if other.id != current.id {
                                    resolve_duplicates(self.store, &current, &other, now).await?;
                                    continue;
                                }
                            }
                        }
                    }
                    return self.apply_decision(current, record, outcome, now).await;
                }
                None => {
                    if let Some(key) = &key {
                        if let Some(survivor) = self.store.find_by_natural_key(key).await? {
                            if attempt == 0 && record.uuid.map(|u| u != survivor.uuid).unwrap_or(true)
                            {
                                // Brand-new record whose natural key is
                                // already owned: collapse into the owner.
                                let merged = absorb_incoming_duplicate(
                                    self.store, &survivor, record, now,
                                )
                                .await?;
                                self.log_applied(merged.id, record.model, SyncAction::Update, now)
                                    .await?;
                                outcome.record_accepted();
                                return Ok(());
                            }
                            // Post-collapse retry: the identity row was
                            // absorbed; apply against the survivor.
                            return self.apply_decision(survivor, record, outcome, now).await;
                        }
                    }
                    return self.insert_new(record, outcome, now).await;
                }
            }
        }
        unreachable!("duplicate resolution retries at most once");
    }

    async fn insert_new(
        &self,
        record: &SyncRecord,
        outcome: &mut PushOutcome,
        now: Timestamp,
    ) -> SyncResult<()> {
        let mut fields = record.sanitized_fields();
        if record.model == ModelKind::Devices {
            // Devices with no real site land in the virtual warehouse.
            fields
                .entry("site_id".to_string())
                .or_insert_with(|| json!(VIRTUAL_WAREHOUSE_SITE_ID));
            fields
                .entry("is_deleted".to_string())
                .or_insert_with(|| json!(record.deleted_at.is_some()));
        }

        let new = NewRecord {
            model: record.model,
            uuid: record.uuid.unwrap_or_else(new_record_uuid),
            version: record.version.max(1),
            created_at: record.created_at.unwrap_or(now),
            updated_at: now,
            deleted_at: record.deleted_at,
            conflict_data: None,
            fields,
        };
        let row = self.store.insert(new).await?;

        self.log_applied(row.id, record.model, SyncAction::Create, now)
            .await?;
        if record.deleted_at.is_some() {
            self.log_deleted(&row, now).await?;
        }
        outcome.record_accepted();
        Ok(())
    }

    async fn apply_decision(
        &self,
        current: StoredRecord,
        record: &SyncRecord,
        outcome: &mut PushOutcome,
        now: Timestamp,
    ) -> SyncResult<()> {
        // Mirror mode adopts the sender's version on applied mutations
        // instead of bumping past it.
        let adopted = |decided: i64| {
            if self.ctx.adopt_versions {
                record.version.max(current.version)
            } else {
                decided
            }
        };

        match decide(Some(&current), record) {
            MergeDecision::Insert { .. } => unreachable!("insert decisions have no existing row"),

            MergeDecision::Accept { version, resurrect } => {
                let version = adopted(version);
                let mut merged = current.clone();
                for (k, v) in record.sanitized_fields() {
                    merged.fields.insert(k, v);
                }
                merged.version = version;
                merged.updated_at = now;
                merged.conflict_data = None;
                if resurrect {
                    merged.deleted_at = None;
                    if merged.model == ModelKind::Devices {
                        merged.fields.insert("is_deleted".into(), json!(false));
                        merged.fields.insert("deleted_origin".into(), Value::Null);
                        merged.fields.insert("deleted_by_id".into(), Value::Null);
                    }
                }
                self.store.update(&merged).await?;
                self.log_applied(merged.id, merged.model, SyncAction::Update, now)
                    .await?;
                outcome.record_accepted();
            }

            MergeDecision::Delete { version } => {
                let version = adopted(version);
                let mut merged = current.clone();
                for (k, v) in record.sanitized_fields() {
                    merged.fields.insert(k, v);
                }
                merged.deleted_at = Some(record.deleted_at.unwrap_or(now));
                merged.version = version;
                merged.updated_at = now;
                merged.conflict_data = None;
                if merged.model == ModelKind::Devices {
                    merged.fields.insert("is_deleted".into(), json!(true));
                    merged.fields.insert(
                        "deleted_origin".into(),
                        json!(self.ctx.deletion_origin().as_str()),
                    );
                }
                self.store.update(&merged).await?;
                self.log_deleted(&merged, now).await?;
                self.log_applied(merged.id, merged.model, SyncAction::Delete, now)
                    .await?;
                outcome.record_accepted();
            }

            MergeDecision::Conflict { version } => {
                // Receiver's row wins by value; the incoming payload is
                // parked verbatim for later human resolution.
                let mut merged = current.clone();
                merged.conflict_data = Some(json!({
                    "version": record.version,
                    "payload": Value::Object(record.sanitized_fields()),
                    "received_at": now.to_rfc3339(),
                }));
                merged.version = version;
                merged.updated_at = now;
                self.store.update(&merged).await?;
                self.store
                    .record(ChangeLogEvent::ConflictResolved {
                        record_id: merged.id,
                        model: merged.model,
                        local_version: current.version,
                        cloud_version: record.version,
                        resolved_version: version,
                        at: now,
                    })
                    .await?;
                tracing::debug!(
                    model = %merged.model,
                    record_id = merged.id,
                    local_version = current.version,
                    incoming_version = record.version,
                    "merge conflict resolved receiver-wins"
                );
                outcome.record_conflict();
            }

            MergeDecision::IdempotentSkip
            | MergeDecision::StaleSkip
            | MergeDecision::DeleteWinsSkip => {
                outcome.record_skipped();
            }
        }
        Ok(())
    }

    async fn log_applied(
        &self,
        record_id: i64,
        model: ModelKind,
        action: SyncAction,
        at: Timestamp,
    ) -> SyncResult<()> {
        self.store
            .record(ChangeLogEvent::SyncApplied {
                record_id,
                model,
                action,
                origin: self.ctx.origin,
                target: self.ctx.target,
                user_id: self.ctx.user_id,
                at,
            })
            .await?;
        Ok(())
    }

    async fn log_deleted(&self, row: &StoredRecord, at: Timestamp) -> SyncResult<()> {
        self.store
            .record(ChangeLogEvent::Deleted {
                record_id: row.id,
                model: row.model,
                deleted_by: self.ctx.user_id,
                origin: self.ctx.deletion_origin(),
                at,
            })
            .await?;
        Ok(())
    }
}

fn validate(record: &SyncRecord) -> SyncResult<()> {
    if record.version < 0 {
        return Err(ValidationError::InvalidValue {
            field: "version".into(),
            reason: format!("version must be non-negative, got {}", record.version),
        }
        .into());
    }
    Ok(())
}
