//! End-to-end tests of the capture pipeline over the in-memory connection.

#![allow(clippy::arithmetic_side_effects)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use changewatch_capture::prelude::*;
use changewatch_core::{Principal, PrincipalProfile, RoleRef};
use chrono::Utc;
use common::{AUDIT, Pipeline, config, delete, insert, update};
use serde_json::json;

// ---------------------------------------------------------------------------
// Record shape
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_delete_of_paid_order_produces_one_record() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let mut p = Pipeline::start(conn.clone(), config(&["orders"]).build().unwrap()).await;
    assert_eq!(p.manager.provisioning()[0].1, ProvisionOutcome::Enabled);

    conn.emit("orders", delete(json!(7), json!({ "_id": 7, "status": "paid" })));

    let record = p.next_record().await;
    assert_eq!(record.collection, "orders");
    assert_eq!(record.document_id, json!(7));
    assert_eq!(record.operation, OperationKind::Delete);
    assert_eq!(
        record.before.as_ref().map(|d| json!(d)),
        Some(json!({ "_id": 7, "status": "paid" }))
    );
    assert!(record.after.is_none());

    let stored = p.wait_for_audit(1).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["collection"], json!("orders"));
    assert_eq!(stored[0]["documentId"], json!(7));
    assert_eq!(stored[0]["operation"], json!("delete"));
    assert_eq!(stored[0]["before"], json!({ "_id": 7, "status": "paid" }));
    assert_eq!(stored[0]["after"], json!(null));

    conn.settle(AUDIT, Duration::from_millis(50)).await;
    assert!(p.records.try_recv().is_err(), "exactly one notification");
    p.stop().await;
}

#[tokio::test]
async fn test_update_record_carries_both_images_and_capture_time() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let mut p = Pipeline::start(conn.clone(), config(&["orders"]).build().unwrap()).await;

    let invoked = Utc::now();
    conn.emit(
        "orders",
        update(
            json!("X"),
            json!({ "_id": "X", "qty": 1 }),
            json!({ "_id": "X", "qty": 2 }),
        ),
    );

    let record = p.next_record().await;
    assert_eq!(record.document_id, json!("X"));
    assert_eq!(record.operation.as_str(), "update");
    assert_eq!(record.before.as_ref().unwrap()["qty"], json!(1));
    assert_eq!(record.after.as_ref().unwrap()["qty"], json!(2));
    assert!(record.timestamp >= invoked);
    p.stop().await;
}

#[tokio::test]
async fn test_redaction_leaves_absent_before_image_absent() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let redact = Transform::infallible(|_| {
        json!({ "redacted": true })
            .as_object()
            .cloned()
            .unwrap_or_default()
    });
    let config = config(&["users"]).transform(redact).build().unwrap();
    let mut p = Pipeline::start(conn.clone(), config).await;

    conn.emit("users", insert(json!(1), json!({ "_id": 1, "ssn": "123" })));
    let record = p.next_record().await;
    assert!(record.before.is_none());
    assert_eq!(json!(record.after), json!({ "redacted": true }));

    conn.emit(
        "users",
        update(json!(1), json!({ "_id": 1, "ssn": "123" }), json!({ "_id": 1 })),
    );
    let record = p.next_record().await;
    assert_eq!(json!(record.before), json!({ "redacted": true }));
    assert_eq!(json!(record.after), json!({ "redacted": true }));

    let stored = p.wait_for_audit(2).await;
    assert_eq!(stored[0]["before"], json!(null));
    p.stop().await;
}

// ---------------------------------------------------------------------------
// Degraded provisioning
// ---------------------------------------------------------------------------

async fn assert_degraded(conn: Arc<MemoryConnection>, expected: fn(&ProvisionOutcome) -> bool) {
    let mut p = Pipeline::start(conn.clone(), config(&["orders"]).build().unwrap()).await;
    let outcome = &p.manager.provisioning()[0].1;
    assert!(expected(outcome), "unexpected outcome {outcome:?}");
    assert!(!conn.images_enabled("orders"));

    conn.emit("orders", delete(json!(3), json!({ "_id": 3 })));
    let record = p.next_record().await;
    assert_eq!(record.document_id, json!(3));
    assert!(record.before.is_none(), "before-image requires retention");
    p.stop().await;
}

#[tokio::test]
async fn test_audits_without_authenticated_principal() {
    assert_degraded(Arc::new(MemoryConnection::new()), |o| {
        *o == ProvisionOutcome::SkippedNoPrincipal
    })
    .await;
}

#[tokio::test]
async fn test_audits_without_permission() {
    let conn = MemoryConnection::new();
    let reader = Principal::new("reader", "admin");
    conn.add_user(PrincipalProfile::new(&reader).with_role(RoleRef::new("read", "shop")));
    conn.authenticate_as(reader);
    assert_degraded(Arc::new(conn), |o| *o == ProvisionOutcome::SkippedNoPermission).await;
}

#[tokio::test]
async fn test_audits_after_storage_failure() {
    let conn = MemoryConnection::with_admin();
    conn.fail_coll_mod("pre- and post-images are not supported");
    assert_degraded(Arc::new(conn), |o| {
        matches!(o, ProvisionOutcome::FailedAtStorage(_))
    })
    .await;
}

// ---------------------------------------------------------------------------
// Ordering and isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_commits_follow_observation_order_within_a_collection() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let mut p = Pipeline::start(conn.clone(), config(&["orders"]).build().unwrap()).await;

    for i in 0..50 {
        conn.emit(
            "orders",
            update(json!(1), json!({ "_id": 1, "v": i }), json!({ "_id": 1, "v": i + 1 })),
        );
    }

    let stored = p.wait_for_audit(50).await;
    let versions: Vec<_> = stored.iter().map(|d| d["after"]["v"].clone()).collect();
    let expected: Vec<_> = (1..=50).map(|v| json!(v)).collect();
    assert_eq!(versions, expected);

    for v in 1..=50 {
        let record = p.next_record().await;
        assert_eq!(record.after.as_ref().unwrap()["v"], json!(v));
    }
    p.stop().await;
}

#[tokio::test]
async fn test_feed_fault_in_one_collection_does_not_block_another() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let p = Pipeline::start(conn.clone(), config(&["orders", "users"]).build().unwrap()).await;

    conn.fail_next_watches(3);
    conn.fail_feed("orders", "node stepped down");

    conn.emit("users", insert(json!("u1"), json!({ "_id": "u1" })));
    let stored = p.wait_for_audit(1).await;
    assert_eq!(stored[0]["collection"], json!("users"));

    // orders recovers once the injected open failures are used up
    tokio::time::timeout(common::WAIT, conn.wait_for_watchers("orders", 2))
        .await
        .unwrap();
    conn.emit("orders", insert(json!(9), json!({ "_id": 9 })));
    let stored = p.wait_for_audit(2).await;
    assert_eq!(stored[1]["collection"], json!("orders"));
    p.stop().await;
}

#[tokio::test]
async fn test_resubscribe_resumes_without_loss_or_duplicates() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let p = Pipeline::start(conn.clone(), config(&["orders"]).build().unwrap()).await;

    conn.emit("orders", insert(json!(1), json!({ "_id": 1 })));
    p.wait_for_audit(1).await;

    conn.close_feeds("orders");
    conn.emit("orders", insert(json!(2), json!({ "_id": 2 })));
    conn.emit("orders", insert(json!(3), json!({ "_id": 3 })));

    let stored = p.wait_for_audit(3).await;
    let ids: Vec<_> = stored.iter().map(|d| d["documentId"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);

    conn.settle(AUDIT, Duration::from_millis(50)).await;
    assert_eq!(conn.inserted(AUDIT).len(), 3);
    assert!(conn.watch_requests("orders")[1].resume_after.is_some());
    p.stop().await;
}

// ---------------------------------------------------------------------------
// Per-event failures
// ---------------------------------------------------------------------------

fn poison_aware() -> Transform {
    Transform::new(|doc| {
        if doc.contains_key("poison") {
            Err(TransformError::Failed("poisoned document".into()))
        } else {
            Ok(doc.clone())
        }
    })
}

async fn run_with_policy(policy: TransformFailurePolicy) -> Vec<Document> {
    let conn = Arc::new(MemoryConnection::with_admin());
    let config = config(&["orders"])
        .transform(poison_aware())
        .transform_failure(policy)
        .build()
        .unwrap();
    let p = Pipeline::start(conn.clone(), config).await;

    conn.emit("orders", insert(json!(1), json!({ "_id": 1, "poison": true })));
    conn.emit("orders", insert(json!(2), json!({ "_id": 2 })));

    let expected = if policy == TransformFailurePolicy::Drop { 1 } else { 2 };
    let stored = p.wait_for_audit(expected).await;
    conn.settle(AUDIT, Duration::from_millis(50)).await;
    let stored_after = conn.inserted(AUDIT);
    assert_eq!(stored.len(), stored_after.len());
    p.stop().await;
    stored_after
}

#[tokio::test]
async fn test_drop_policy_skips_failed_event_and_continues() {
    let stored = run_with_policy(TransformFailurePolicy::Drop).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["documentId"], json!(2));
}

#[tokio::test]
async fn test_untransformed_policy_keeps_raw_images() {
    let stored = run_with_policy(TransformFailurePolicy::Untransformed).await;
    assert_eq!(stored[0]["after"], json!({ "_id": 1, "poison": true }));
    assert!(stored[0].get("transformError").is_none());
    assert_eq!(stored[1]["documentId"], json!(2));
}

#[tokio::test]
async fn test_mark_errored_policy_flags_record() {
    let stored = run_with_policy(TransformFailurePolicy::MarkErrored).await;
    assert_eq!(stored[0]["after"], json!(null));
    assert_eq!(
        stored[0]["transformError"],
        json!("transform failed: poisoned document")
    );
    assert_eq!(stored[1]["documentId"], json!(2));
}

#[tokio::test]
async fn test_panicking_transform_is_contained() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let exploding = Transform::new(|doc| {
        assert!(!doc.contains_key("boom"), "transform exploded");
        Ok(doc.clone())
    });
    let config = config(&["orders"])
        .transform(exploding)
        .transform_failure(TransformFailurePolicy::MarkErrored)
        .build()
        .unwrap();
    let p = Pipeline::start(conn.clone(), config).await;

    conn.emit("orders", insert(json!(1), json!({ "_id": 1, "boom": true })));
    conn.emit("orders", insert(json!(2), json!({ "_id": 2 })));

    let stored = p.wait_for_audit(2).await;
    assert!(
        stored[0]["transformError"]
            .as_str()
            .unwrap()
            .contains("transform exploded")
    );
    assert_eq!(stored[1]["documentId"], json!(2));
    p.stop().await;
}

#[tokio::test]
async fn test_write_outage_holds_record_until_storage_recovers() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let mut p = Pipeline::start(conn.clone(), config(&["orders"]).build().unwrap()).await;

    // Two full rounds of three attempts fail before the store comes back.
    conn.fail_next_inserts(6);
    conn.emit("orders", insert(json!(1), json!({ "_id": 1 })));
    conn.emit("orders", insert(json!(2), json!({ "_id": 2 })));

    assert_eq!(p.next_record().await.document_id, json!(1));
    assert_eq!(p.next_record().await.document_id, json!(2));
    let ids: Vec<_> = p
        .wait_for_audit(2)
        .await
        .iter()
        .map(|d| d["documentId"].clone())
        .collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
    p.stop().await;
}

#[tokio::test]
async fn test_back_to_back_updates_get_distinct_timestamps() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let p = Pipeline::start(conn.clone(), config(&["orders"]).build().unwrap()).await;

    for qty in 0..20 {
        conn.emit(
            "orders",
            update(
                json!("X"),
                json!({ "_id": "X", "qty": qty }),
                json!({ "_id": "X", "qty": qty + 1 }),
            ),
        );
    }

    let stored = p.wait_for_audit(20).await;
    let stamps: std::collections::HashSet<_> = stored
        .iter()
        .map(|d| d["timestamp"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(stamps.len(), 20);
    assert!(stored.iter().all(|d| d["documentId"] == json!("X")));
    p.stop().await;
}

#[tokio::test]
async fn test_transient_write_failure_is_retried() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let mut p = Pipeline::start(conn.clone(), config(&["orders"]).build().unwrap()).await;

    conn.fail_next_inserts(2);
    conn.emit("orders", insert(json!(1), json!({ "_id": 1 })));

    let record = p.next_record().await;
    assert_eq!(record.document_id, json!(1));
    assert_eq!(conn.inserted(AUDIT).len(), 1);
    p.stop().await;
}

// ---------------------------------------------------------------------------
// Observers and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_panicking_observer_does_not_affect_others() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let mut p = Pipeline::start(conn.clone(), config(&["orders"]).build().unwrap()).await;
    p.observers().register(Arc::new(FnObserver::new("exploding", |_: &AuditRecord| {
        panic!("observer exploded");
    })));

    conn.emit("orders", insert(json!(1), json!({ "_id": 1 })));
    conn.emit("orders", insert(json!(2), json!({ "_id": 2 })));
    assert_eq!(p.next_record().await.document_id, json!(1));
    assert_eq!(p.next_record().await.document_id, json!(2));
    p.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_every_feed() {
    let conn = Arc::new(MemoryConnection::with_admin());
    let p = Pipeline::start(conn.clone(), config(&["orders", "users"]).build().unwrap()).await;
    assert!(!p.handle.is_finished());

    p.stop().await;
    assert_eq!(conn.open_feeds("orders"), 0);
    assert_eq!(conn.open_feeds("users"), 0);

    assert_eq!(conn.emit("orders", insert(json!(1), json!({ "_id": 1 }))), 0);
    assert_eq!(conn.settle(AUDIT, Duration::from_millis(30)).await, 0);
}

#[tokio::test]
async fn test_start_fails_fast_without_connection() {
    common::init_logging();
    let conn = Arc::new(MemoryConnection::with_admin());
    conn.set_connected(false);
    let manager = AuditManager::initialize(config(&["orders"]).build().unwrap(), conn)
        .await
        .unwrap();
    let err = manager.start().unwrap_err();
    assert!(matches!(err, CaptureError::NotConnected));
    assert!(err.is_fatal());
}
