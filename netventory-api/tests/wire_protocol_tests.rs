//! Wire-protocol tests for the sync surface.
//!
//! The HTTP layer and the site-side workers exchange the exact JSON
//! shapes defined in netventory-core. These tests pin the shapes down:
//! what a site serializes must be what the cloud parses, and a pulled
//! wire record must apply cleanly on the other side.

use chrono::{Duration, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};

use netventory_sync::{authenticate, process_pull, PullOptions, PushContext, PushProcessor};
use netventory_test_utils::{
    arb_email, arb_identifier, arb_model_kind, arb_version_chain, device_record, seeded_store,
    stored_record, user_record, ModelKind, PullRequest, PushOutcome, PushRequest, SyncRecord,
    SyncRecordBuilder, TEST_API_KEY, TEST_SITE_ID,
};

#[test]
fn push_request_roundtrips_builder_records() {
    let request = PushRequest {
        records: vec![
            user_record(1, "ops@example.net", 3),
            device_record(2, "edge-01", "10.0.0.1", "aa:bb:cc:dd:ee:ff", 1),
        ],
    };

    let wire = serde_json::to_value(&request).unwrap();
    // Domain fields are flattened, not nested.
    assert_eq!(wire["records"][0]["email"], json!("ops@example.net"));
    assert_eq!(wire["records"][1]["hostname"], json!("edge-01"));
    assert!(wire["records"][0].get("fields").is_none());

    let back: PushRequest = serde_json::from_value(wire).unwrap();
    assert_eq!(back.records, request.records);
}

#[test]
fn push_outcome_wire_shape_is_flat_counts() {
    let outcome = PushOutcome {
        accepted: 2,
        conflicts: 1,
        skipped: 3,
    };
    let wire = serde_json::to_string(&outcome).unwrap();
    assert_eq!(wire, r#"{"accepted":2,"conflicts":1,"skipped":3}"#);
}

#[tokio::test]
async fn pulled_wire_records_apply_on_the_other_side() {
    // Cloud side: a couple of committed rows.
    let cloud = seeded_store();
    cloud.seed_record(stored_record(
        ModelKind::Tags,
        0,
        2,
        json!({"name": "prod", "color": "red"}),
    ));
    let mut tombstone = stored_record(ModelKind::Tags, 0, 3, json!({"name": "old"}));
    tombstone.deleted_at = Some(Utc::now());
    cloud.seed_record(tombstone);

    let batch = process_pull(
        &cloud,
        &PullRequest {
            since: Utc::now() - Duration::hours(1),
            models: vec![ModelKind::Tags],
            cursor: None,
        },
        &PullOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(batch.records.len(), 2);

    // Site side: strip the cloud-local id (as the pull worker does) and
    // apply in mirror mode.
    let records: Vec<SyncRecord> = batch
        .records
        .iter()
        .map(|wire| {
            let mut object = wire.as_object().cloned().unwrap();
            object.remove("id");
            serde_json::from_value(Value::Object(object)).unwrap()
        })
        .collect();

    let site = seeded_store();
    let outcome = PushProcessor::new(&site, PushContext::from_cloud(TEST_SITE_ID))
        .process(&records)
        .await
        .unwrap();
    assert_eq!(outcome.accepted, 2);
    assert_eq!(site.row_count(ModelKind::Tags), 2);

    // Mirror mode adopts the cloud's versions verbatim, so replaying the
    // same page is pure skips.
    let replay = PushProcessor::new(&site, PushContext::from_cloud(TEST_SITE_ID))
        .process(&records)
        .await
        .unwrap();
    assert_eq!(replay.accepted, 0);
    assert_eq!(replay.skipped, 2);
}

#[tokio::test]
async fn site_key_fixture_authenticates() {
    let store = seeded_store();
    let key = authenticate(&store, TEST_SITE_ID, TEST_API_KEY, Utc::now())
        .await
        .unwrap();
    assert_eq!(key.site_id, TEST_SITE_ID);
    assert!(store.site_key(TEST_SITE_ID).unwrap().last_used_at.is_some());

    assert!(authenticate(&store, TEST_SITE_ID, "nv_wrong", Utc::now())
        .await
        .is_err());
    assert!(authenticate(&store, 999, TEST_API_KEY, Utc::now())
        .await
        .is_err());
}

proptest! {
    /// Any builder-produced record survives the wire intact.
    #[test]
    fn builder_records_roundtrip(
        email in arb_email(),
        versions in arb_version_chain(1),
        id in 1i64..10_000,
    ) {
        let record = SyncRecordBuilder::new(ModelKind::Users)
            .id(id)
            .version(versions[0])
            .field("email", json!(email))
            .build();

        let wire = serde_json::to_value(&record).unwrap();
        let back: SyncRecord = serde_json::from_value(wire).unwrap();
        prop_assert_eq!(back, record);
    }

    /// Model tags on the wire always parse back to the same kind, and a
    /// pull request for any model set round-trips.
    #[test]
    fn model_tags_roundtrip(model in arb_model_kind(), name in arb_identifier()) {
        let record = SyncRecordBuilder::new(model)
            .version(1)
            .field("name", json!(name))
            .build();
        let wire = serde_json::to_value(&record).unwrap();
        prop_assert_eq!(wire["model"].as_str().unwrap(), model.table_name());

        let request = PullRequest {
            since: Utc::now(),
            models: vec![model],
            cursor: None,
        };
        let back: PullRequest =
            serde_json::from_value(serde_json::to_value(&request).unwrap()).unwrap();
        prop_assert_eq!(back.models, vec![model]);
    }

    /// The legacy body shape and the v1 shape carry the same records.
    #[test]
    fn legacy_and_v1_shapes_agree(email in arb_email(), version in 1i64..100) {
        let record = user_record(1, &email, version);

        let v1 = serde_json::to_value(PushRequest { records: vec![record.clone()] }).unwrap();
        let legacy = json!({ "users": [serde_json::to_value(&record).unwrap()] });

        // A legacy record is the v1 record without the model tag.
        let mut from_v1 = v1["records"][0].as_object().cloned().unwrap();
        from_v1.remove("model");
        let mut from_legacy = legacy["users"][0].as_object().cloned().unwrap();
        from_legacy.remove("model");
        prop_assert_eq!(from_v1, from_legacy);
    }
}
