//! End-to-end replication scenarios against the in-memory store.
//!
//! Each test drives the push/pull processors exactly as the HTTP layer
//! does, then asserts on rows and bookkeeping tables.

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use netventory_core::{
    CheckIn, ModelKind, PullCursor, PullRequest, PushOutcome, StoredRecord, SyncAction, SyncRecord,
};
use netventory_sync::{
    process_pull, run_self_check, ChangeLog, ChangeLogEvent, InMemoryStore, LiveColumn,
    PullOptions, PushContext, PushProcessor, RecordStore, SiteRegistry,
};

const SITE_ID: i64 = 7;

fn stored(model: ModelKind, id: i64, version: i64, fields: serde_json::Value) -> StoredRecord {
    let now = Utc::now();
    StoredRecord {
        model,
        id,
        uuid: Uuid::new_v4(),
        version,
        created_at: now - Duration::days(1),
        updated_at: now - Duration::days(1),
        deleted_at: None,
        conflict_data: None,
        sync_state: None,
        fields: fields.as_object().cloned().unwrap_or_default(),
    }
}

fn incoming(model: ModelKind, fields: serde_json::Value) -> SyncRecord {
    let mut object = fields.as_object().cloned().unwrap_or_default();
    object.insert("model".into(), json!(model.table_name()));
    serde_json::from_value(serde_json::Value::Object(object)).unwrap()
}

async fn push(store: &InMemoryStore, records: &[SyncRecord]) -> PushOutcome {
    PushProcessor::new(store, PushContext::from_site(SITE_ID))
        .process(records)
        .await
        .unwrap()
}

#[tokio::test]
async fn natural_key_collision_collapses_into_older_row() {
    let store = InMemoryStore::new();
    store.seed_record(stored(
        ModelKind::Devices,
        1,
        1,
        json!({"mac": "aa", "site_id": 3, "is_deleted": false}),
    ));

    let record = incoming(
        ModelKind::Devices,
        json!({
            "id": 2,
            "hostname": "dup",
            "ip": "2.2.2.2",
            "mac": "aa",
            "manufacturer": "cisco",
            "device_type_id": 1,
            "version": 1
        }),
    );

    let outcome = push(&store, &[record]).await;
    assert_eq!(
        outcome,
        PushOutcome {
            accepted: 1,
            conflicts: 0,
            skipped: 0
        }
    );

    // The new record collapsed into the existing row; count unchanged.
    assert_eq!(store.row_count(ModelKind::Devices), 1);
    let row = store.get_by_id(ModelKind::Devices, 1).await.unwrap().unwrap();
    assert_eq!(row.fields["mac"], json!("aa"));
    assert_eq!(row.fields["hostname"], json!("dup"));
    assert_eq!(row.fields["ip"], json!("2.2.2.2"));
    assert!(row.version > 1);

    let dups = store.duplicate_logs();
    assert_eq!(dups.len(), 1);
    assert_eq!(dups[0].kept_id, 1);
    assert_eq!(dups[0].removed_id, Some(2));
}

#[tokio::test]
async fn mixed_batch_creates_and_updates_in_order() {
    let store = InMemoryStore::new();
    store.seed_record(stored(
        ModelKind::Users,
        1,
        1,
        json!({"email": "first@x", "is_active": true}),
    ));

    let batch = vec![
        incoming(
            ModelKind::Users,
            json!({"id": 2, "email": "second@x", "version": 1}),
        ),
        // Version 0: a record from a client that does not track versions.
        incoming(ModelKind::Users, json!({"id": 1, "version": 0})),
    ];

    let outcome = push(&store, &batch).await;
    assert_eq!(
        outcome,
        PushOutcome {
            accepted: 2,
            conflicts: 0,
            skipped: 0
        }
    );

    let user1 = store.get_by_id(ModelKind::Users, 1).await.unwrap().unwrap();
    assert_eq!(user1.version, 2);
    assert_eq!(store.row_count(ModelKind::Users), 2);
}

#[tokio::test]
async fn same_version_divergence_parks_the_loser_in_conflict_data() {
    let store = InMemoryStore::new();
    store.seed_record(stored(
        ModelKind::Users,
        1,
        1,
        json!({"email": "a@x", "is_active": true}),
    ));

    let record = incoming(ModelKind::Users, json!({"id": 1, "email": "b@x", "version": 1}));
    let outcome = push(&store, &[record]).await;
    assert_eq!(
        outcome,
        PushOutcome {
            accepted: 1,
            conflicts: 1,
            skipped: 0
        }
    );

    let row = store.get_by_id(ModelKind::Users, 1).await.unwrap().unwrap();
    // Receiver wins by value; the incoming payload is parked verbatim.
    assert_eq!(row.fields["email"], json!("a@x"));
    assert_eq!(row.version, 2);
    let conflict = row.conflict_data.unwrap();
    assert_eq!(conflict["payload"]["email"], json!("b@x"));
    assert_eq!(conflict["version"], json!(1));

    let conflicts = store.conflict_logs();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local_version, 1);
    assert_eq!(conflicts[0].cloud_version, 1);
    assert_eq!(conflicts[0].resolved_version, 2);
}

#[tokio::test]
async fn conflict_data_clears_on_next_clean_accept() {
    let store = InMemoryStore::new();
    store.seed_record(stored(ModelKind::Users, 1, 1, json!({"email": "a@x"})));

    push(
        &store,
        &[incoming(ModelKind::Users, json!({"id": 1, "email": "b@x", "version": 1}))],
    )
    .await;
    let row = store.get_by_id(ModelKind::Users, 1).await.unwrap().unwrap();
    assert!(row.conflict_data.is_some());

    // A strictly newer version is accepted cleanly and clears the marker.
    push(
        &store,
        &[incoming(ModelKind::Users, json!({"id": 1, "email": "c@x", "version": 5}))],
    )
    .await;
    let row = store.get_by_id(ModelKind::Users, 1).await.unwrap().unwrap();
    assert_eq!(row.fields["email"], json!("c@x"));
    assert!(row.conflict_data.is_none());
}

#[tokio::test]
async fn idempotent_repeat_is_skipped_without_version_bump() {
    let store = InMemoryStore::new();
    store.seed_record(stored(ModelKind::Tags, 1, 3, json!({"name": "prod"})));

    let record = incoming(ModelKind::Tags, json!({"id": 1, "name": "prod", "version": 3}));
    let outcome = push(&store, &[record]).await;
    assert_eq!(
        outcome,
        PushOutcome {
            accepted: 0,
            conflicts: 0,
            skipped: 1
        }
    );

    let row = store.get_by_id(ModelKind::Tags, 1).await.unwrap().unwrap();
    assert_eq!(row.version, 3);
    assert!(store.sync_logs().is_empty());
}

#[tokio::test]
async fn newer_tombstone_deletes_and_logs() {
    let store = InMemoryStore::new();
    store.seed_record(stored(
        ModelKind::Devices,
        1,
        1,
        json!({"mac": "aa", "site_id": 3, "is_deleted": false}),
    ));

    let record = incoming(
        ModelKind::Devices,
        json!({"id": 1, "version": 2, "deleted_at": Utc::now().to_rfc3339()}),
    );
    let outcome = push(&store, &[record]).await;
    assert_eq!(outcome.accepted, 1);

    let row = store.get_by_id(ModelKind::Devices, 1).await.unwrap().unwrap();
    assert!(row.is_tombstone());
    assert_eq!(row.fields["is_deleted"], json!(true));
    assert_eq!(row.fields["deleted_origin"], json!("local"));

    assert_eq!(store.deletion_logs().len(), 1);
    let applied = store.sync_logs();
    assert!(applied.iter().any(|l| l.action == SyncAction::Delete));
}

#[tokio::test]
async fn resurrect_only_with_newer_version() {
    let store = InMemoryStore::new();
    let mut row = stored(
        ModelKind::Devices,
        1,
        3,
        json!({"mac": "aa", "site_id": 3, "is_deleted": true}),
    );
    row.deleted_at = Some(Utc::now() - Duration::hours(1));
    store.seed_record(row);

    // An earlier edit loses to the tombstone.
    let stale = incoming(
        ModelKind::Devices,
        json!({"id": 1, "mac": "aa", "hostname": "back", "version": 2}),
    );
    let outcome = push(&store, &[stale]).await;
    assert_eq!(outcome.skipped, 1);
    assert!(store
        .get_by_id(ModelKind::Devices, 1)
        .await
        .unwrap()
        .unwrap()
        .is_tombstone());

    // A strictly newer edit resurrects.
    let newer = incoming(
        ModelKind::Devices,
        json!({"id": 1, "mac": "aa", "hostname": "back", "version": 4}),
    );
    let outcome = push(&store, &[newer]).await;
    assert_eq!(outcome.accepted, 1);
    let row = store.get_by_id(ModelKind::Devices, 1).await.unwrap().unwrap();
    assert!(!row.is_tombstone());
    assert_eq!(row.fields["is_deleted"], json!(false));
    assert_eq!(row.fields["hostname"], json!("back"));
}

#[tokio::test]
async fn pull_boundary_is_strictly_greater_than_cursor() {
    let store = InMemoryStore::new();
    let row = store.seed_record(stored(ModelKind::Vlans, 0, 1, json!({"vlan_id": 10, "site_id": 3})));

    let request = PullRequest {
        since: row.updated_at - Duration::seconds(1),
        models: vec![ModelKind::Vlans],
        cursor: None,
    };
    let batch = process_pull(&store, &request, &PullOptions::default())
        .await
        .unwrap();
    assert_eq!(batch.records.len(), 1);
    assert!(!batch.sync_state.truncated);

    // Polling again with the row's own updated_at returns nothing.
    let request = PullRequest {
        since: row.updated_at,
        models: vec![ModelKind::Vlans],
        cursor: None,
    };
    let batch = process_pull(&store, &request, &PullOptions::default())
        .await
        .unwrap();
    assert!(batch.records.is_empty());
}

#[tokio::test]
async fn pull_includes_tombstones() {
    let store = InMemoryStore::new();
    let mut row = stored(ModelKind::Tags, 0, 2, json!({"name": "stale"}));
    row.deleted_at = Some(Utc::now());
    row.updated_at = Utc::now();
    let row = store.seed_record(row);

    let request = PullRequest {
        since: row.updated_at - Duration::hours(1),
        models: vec![ModelKind::Tags],
        cursor: None,
    };
    let batch = process_pull(&store, &request, &PullOptions::default())
        .await
        .unwrap();
    assert_eq!(batch.records.len(), 1);
    assert!(!batch.records[0]["deleted_at"].is_null());
}

#[tokio::test]
async fn truncated_pull_resumes_without_skips_or_duplicates() {
    let store = InMemoryStore::new();
    // Ten rows sharing one updated_at, so paging exercises the
    // (model, uuid) tie-break.
    let stamp = Utc::now();
    for i in 0..10 {
        let mut row = stored(ModelKind::Tags, 0, 1, json!({ "name": format!("tag-{}", i) }));
        row.updated_at = stamp;
        store.seed_record(row);
    }

    let options = PullOptions { page_size: 3 };
    let mut request = PullRequest {
        since: stamp - Duration::seconds(1),
        models: vec![ModelKind::Tags],
        cursor: None,
    };

    let mut seen = std::collections::HashSet::new();
    loop {
        let batch = process_pull(&store, &request, &options).await.unwrap();
        for record in &batch.records {
            assert!(
                seen.insert(record["uuid"].as_str().unwrap().to_string()),
                "row delivered twice"
            );
        }
        if !batch.sync_state.truncated {
            break;
        }
        request.cursor = batch.sync_state.cursor.clone();
    }
    assert_eq!(seen.len(), 10);
}

#[tokio::test]
async fn pull_cursor_orders_across_models() {
    let store = InMemoryStore::new();
    let stamp = Utc::now();
    for model in [ModelKind::Devices, ModelKind::Tags, ModelKind::Sites] {
        let mut row = stored(model, 0, 1, json!({"name": "x", "site_id": 3, "mac": "aa"}));
        row.updated_at = stamp;
        store.seed_record(row);
    }

    let request = PullRequest {
        since: stamp - Duration::seconds(1),
        models: vec![ModelKind::Tags, ModelKind::Sites, ModelKind::Devices],
        cursor: None,
    };
    let batch = process_pull(&store, &request, &PullOptions::default())
        .await
        .unwrap();
    let order: Vec<&str> = batch
        .records
        .iter()
        .map(|r| r["model"].as_str().unwrap())
        .collect();
    // Lexicographic by table name at equal timestamps.
    assert_eq!(order, vec!["devices", "sites", "tags"]);
}

#[tokio::test]
async fn check_in_upserts_a_single_row() {
    let store = InMemoryStore::new();
    let check_in = CheckIn {
        site_id: SITE_ID,
        git_version: "v2.4.1".into(),
        sync_status: "ok".into(),
        last_update_status: "applied".into(),
    };

    let first = Utc::now();
    store.record_check_in(&check_in, first).await.unwrap();
    let second = first + Duration::seconds(30);
    store.record_check_in(&check_in, second).await.unwrap();

    let sites = store.connected_sites();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].last_check_in, second);
    assert_eq!(sites[0].git_version, "v2.4.1");
}

#[tokio::test]
async fn batch_processes_in_arrival_order_for_colliding_records() {
    let store = InMemoryStore::new();
    // Two records for the same new row in one batch: the first creates,
    // the second lands on the created row by natural key.
    let uuid = Uuid::new_v4();
    let batch = vec![
        incoming(
            ModelKind::Sites,
            json!({"uuid": uuid, "name": "hq", "version": 1}),
        ),
        incoming(ModelKind::Sites, json!({"name": "hq", "version": 2})),
    ];
    let outcome = push(&store, &batch).await;
    assert_eq!(outcome.accepted, 2);
    assert_eq!(store.row_count(ModelKind::Sites), 1);
}

#[tokio::test]
async fn validation_failure_aborts_the_whole_batch() {
    let store = InMemoryStore::new();
    let good = incoming(ModelKind::Tags, json!({"name": "ok", "version": 1}));
    let bad = incoming(ModelKind::Tags, json!({"name": "bad", "version": -3}));

    let result = PushProcessor::new(&store, PushContext::from_site(SITE_ID))
        .process(&[good, bad])
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn fields_not_provided_are_preserved_on_accept() {
    let store = InMemoryStore::new();
    store.seed_record(stored(
        ModelKind::Devices,
        1,
        1,
        json!({"mac": "aa", "hostname": "keep-me", "site_id": 3, "is_deleted": false}),
    ));

    let record = incoming(ModelKind::Devices, json!({"id": 1, "ip": "9.9.9.9", "version": 2}));
    push(&store, &[record]).await;

    let row = store.get_by_id(ModelKind::Devices, 1).await.unwrap().unwrap();
    assert_eq!(row.fields["hostname"], json!("keep-me"));
    assert_eq!(row.fields["ip"], json!("9.9.9.9"));
}

#[tokio::test]
async fn existing_duplicate_rows_are_collapsed_then_retried() {
    let store = InMemoryStore::new();
    // Two stored rows already collide on (name): id 1 wins.
    let a = store.seed_record(stored(ModelKind::DeviceTypes, 1, 1, json!({"name": "switch"})));
    let _b = store.seed_record(stored(
        ModelKind::DeviceTypes,
        2,
        4,
        json!({"name": "switch", "manufacturer": "juniper"}),
    ));
    // Reference the loser from a device, to observe the rewrite.
    store.seed_record(stored(
        ModelKind::Devices,
        10,
        1,
        json!({"mac": "aa", "site_id": 3, "device_type_id": 2, "is_deleted": false}),
    ));

    let record = incoming(
        ModelKind::DeviceTypes,
        json!({"uuid": a.uuid, "name": "switch", "version": 6}),
    );
    let outcome = push(&store, &[record]).await;
    assert_eq!(outcome.accepted, 1);

    assert_eq!(store.row_count(ModelKind::DeviceTypes), 1);
    let survivor = store.get_by_id(ModelKind::DeviceTypes, 1).await.unwrap().unwrap();
    // Loser's non-empty field filled the survivor's gap.
    assert_eq!(survivor.fields["manufacturer"], json!("juniper"));

    let device = store.get_by_id(ModelKind::Devices, 10).await.unwrap().unwrap();
    assert_eq!(device.fields["device_type_id"], json!(1));

    assert_eq!(store.duplicate_logs().len(), 1);
}

#[tokio::test]
async fn pull_never_ships_sync_state() {
    let store = InMemoryStore::new();
    let mut row = stored(ModelKind::Sites, 0, 1, json!({"name": "hq"}));
    row.sync_state = Some(json!({"pushed_version": 1}));
    row.updated_at = Utc::now();
    let row = store.seed_record(row);

    let request = PullRequest {
        since: row.updated_at - Duration::hours(1),
        models: vec![ModelKind::Sites],
        cursor: None,
    };
    let batch = process_pull(&store, &request, &PullOptions::default())
        .await
        .unwrap();
    assert!(batch.records[0].get("sync_state").is_none());
}

#[tokio::test]
async fn warehouse_constraints_hold() {
    let store = InMemoryStore::new();
    let processor = PushProcessor::new(&store, PushContext::from_site(SITE_ID));

    // Locations may never reference the virtual warehouse.
    let record = incoming(
        ModelKind::Locations,
        json!({"name": "shelf", "site_id": 100, "version": 1}),
    );
    assert!(processor.process(&[record]).await.is_err());

    // Warehouse devices may not carry a location.
    let record = incoming(
        ModelKind::Devices,
        json!({"mac": "zz", "site_id": 100, "location_id": 5, "version": 1}),
    );
    assert!(processor.process(&[record]).await.is_err());

    // But a bare warehouse device is fine, and defaults to site 100.
    let record = incoming(ModelKind::Devices, json!({"mac": "zz", "version": 1}));
    let outcome = processor.process(&[record]).await.unwrap();
    assert_eq!(outcome.accepted, 1);
    let row = store.get_by_id(ModelKind::Devices, 1).await.unwrap().unwrap();
    assert_eq!(row.fields["site_id"], json!(100));
}

#[tokio::test]
async fn pull_cursor_structs_roundtrip() {
    let cursor = PullCursor {
        since: Utc::now(),
        model: Some(ModelKind::Devices),
        uuid: Some(Uuid::new_v4()),
    };
    let json = serde_json::to_string(&cursor).unwrap();
    let back: PullCursor = serde_json::from_str(&json).unwrap();
    assert_eq!(back, cursor);
}

#[tokio::test]
async fn unprovided_payload_never_loses_fields_on_dedupe_absorb() {
    let store = InMemoryStore::new();
    store.seed_record(stored(
        ModelKind::Users,
        1,
        2,
        json!({"email": "a@x", "name": "Alice"}),
    ));

    // Same email, no uuid/id match: absorbed, existing values win.
    let record = incoming(
        ModelKind::Users,
        json!({"id": 9, "email": "A@X", "name": "Impostor", "version": 1}),
    );
    let outcome = push(&store, &[record]).await;
    assert_eq!(outcome.accepted, 1);

    let row = store.get_by_id(ModelKind::Users, 1).await.unwrap().unwrap();
    assert_eq!(row.fields["name"], json!("Alice"));
    assert_eq!(store.row_count(ModelKind::Users), 1);
}

#[tokio::test]
async fn schema_self_check_records_divergences() {
    let store = InMemoryStore::new();

    // A clean database yields no issues.
    let issues = run_self_check(&store, Utc::now()).await.unwrap();
    assert!(issues.is_empty());

    // Perturb the live view of `tags`: drop `color`, break `name`'s type.
    store.override_live_schema(
        "tags",
        Some(vec![
            LiveColumn {
                name: "id".into(),
                data_type: "bigint".into(),
                nullable: false,
            },
            LiveColumn {
                name: "name".into(),
                data_type: "integer".into(),
                nullable: false,
            },
        ]),
    );
    let issues = run_self_check(&store, Utc::now()).await.unwrap();
    assert!(!issues.is_empty());
    let recorded = store.schema_issues();
    assert_eq!(recorded.len(), issues.len());
    assert!(recorded
        .iter()
        .any(|i| i.table_name == "tags" && i.column_name.as_deref() == Some("color")));
    assert!(recorded
        .iter()
        .any(|i| i.column_name.as_deref() == Some("name") && i.actual.as_deref() == Some("integer")));
}

#[tokio::test]
async fn repeated_sync_errors_deduplicate_by_trace_hash() {
    let store = InMemoryStore::new();
    for _ in 0..3 {
        store
            .record(ChangeLogEvent::Error {
                model: Some(ModelKind::Devices),
                action: "push".into(),
                trace: "duplicate key value violates unique constraint".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();
    }
    store
        .record(ChangeLogEvent::Error {
            model: Some(ModelKind::Devices),
            action: "push".into(),
            trace: "a different failure".into(),
            at: Utc::now(),
        })
        .await
        .unwrap();

    assert_eq!(store.sync_errors().len(), 2);
}

#[tokio::test]
async fn repeated_sync_issues_deduplicate_by_tuple() {
    let store = InMemoryStore::new();
    for _ in 0..2 {
        store
            .record(ChangeLogEvent::Issue {
                model: ModelKind::Devices,
                field: "mac".into(),
                issue_type: "invalid_format".into(),
                instance: "device-42".into(),
                at: Utc::now(),
            })
            .await
            .unwrap();
    }
    assert_eq!(store.sync_issues().len(), 1);
}
