//! Bootstrapping a pipeline from a configuration file.

mod common;

use std::sync::Arc;

use changewatch_capture::CHECKPOINT_FILE;
use changewatch_capture::prelude::*;
use changewatch_config::{CaptureConfig, ConfigError};
use changewatch_telemetry::{LogConfig, LogFormat};
use common::{AUDIT, WAIT, insert};
use serde_json::json;
use tempfile::TempDir;

fn load(path: &std::path::Path) -> AuditConfiguration {
    AuditConfiguration::from_config(&CaptureConfig::load_file(path).unwrap()).unwrap()
}

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("changewatch.toml");
    std::fs::write(&path, body).unwrap();
    path
}

fn checkpointed_config(dir: &TempDir) -> std::path::PathBuf {
    let state = dir.path().join("state");
    write_config(
        dir,
        &format!(
            r#"
            [connection]
            uri = "mongodb://auditor@db:27017/shop"

            [capture]
            collections = ["orders"]

            [feed]
            resubscribe_initial_ms = 5
            resubscribe_max_ms = 20

            [sink]
            write_attempts = 2
            retry_backoff_ms = 1

            [checkpoint]
            enabled = true
            path = "{}"

            [logging]
            level = "debug"
            format = "json"
            "#,
            state.display().to_string().replace('\\', "/")
        ),
    )
}

#[tokio::test]
async fn test_file_config_drives_the_pipeline() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = checkpointed_config(&dir);

    let file = CaptureConfig::load_file(&path).unwrap();
    let logging = LogConfig::from_section(&file.logging).unwrap();
    assert_eq!(logging.format, LogFormat::Json);

    let config = AuditConfiguration::from_config(&file).unwrap();
    assert_eq!(config.destination(), AUDIT);
    assert_eq!(config.write_attempts(), 2);
    assert!(config.checkpoint_store().is_some());

    let conn = Arc::new(MemoryConnection::with_admin());
    let manager = AuditManager::initialize(config, conn.clone()).await.unwrap();
    let handle = manager.start().unwrap();
    tokio::time::timeout(WAIT, conn.wait_for_watchers("orders", 1))
        .await
        .unwrap();

    conn.emit("orders", insert(json!(1), json!({ "_id": 1 })));
    tokio::time::timeout(WAIT, conn.wait_for_inserts(AUDIT, 1))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.shutdown()).await.unwrap();

    assert!(dir.path().join("state").join(CHECKPOINT_FILE).exists());
}

#[tokio::test]
async fn test_restart_resumes_from_file_checkpoint() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = checkpointed_config(&dir);
    let conn = Arc::new(MemoryConnection::with_admin());

    // First run audits one mutation, then stops.
    let manager = AuditManager::initialize(load(&path), conn.clone()).await.unwrap();
    let handle = manager.start().unwrap();
    tokio::time::timeout(WAIT, conn.wait_for_watchers("orders", 1))
        .await
        .unwrap();
    conn.emit("orders", insert(json!(1), json!({ "_id": 1 })));
    tokio::time::timeout(WAIT, conn.wait_for_inserts(AUDIT, 1))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.shutdown()).await.unwrap();

    // A mutation made while the pipeline is down.
    conn.emit("orders", insert(json!(2), json!({ "_id": 2 })));

    // Second run picks it up from the checkpoint.
    let manager = AuditManager::initialize(load(&path), conn.clone()).await.unwrap();
    let handle = manager.start().unwrap();
    tokio::time::timeout(WAIT, conn.wait_for_inserts(AUDIT, 2))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.shutdown()).await.unwrap();

    let ids: Vec<_> = conn
        .inserted(AUDIT)
        .iter()
        .map(|d| d["documentId"].clone())
        .collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
    assert!(conn.watch_requests("orders")[1].resume_after.is_some());
}

#[tokio::test]
async fn test_without_checkpoints_restart_starts_from_now() {
    common::init_logging();
    let conn = Arc::new(MemoryConnection::with_admin());
    let file = CaptureConfig::from_toml_str(
        r#"
        [connection]
        uri = "mongodb://db"
        [capture]
        collections = ["orders"]
        "#,
    )
    .unwrap();

    let config = AuditConfiguration::from_config(&file).unwrap();
    let manager = AuditManager::initialize(config, conn.clone()).await.unwrap();
    let handle = manager.start().unwrap();
    tokio::time::timeout(WAIT, conn.wait_for_watchers("orders", 1))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.shutdown()).await.unwrap();

    conn.emit("orders", insert(json!(1), json!({ "_id": 1 })));

    let config = AuditConfiguration::from_config(&file).unwrap();
    let manager = AuditManager::initialize(config, conn.clone()).await.unwrap();
    let handle = manager.start().unwrap();
    tokio::time::timeout(WAIT, conn.wait_for_watchers("orders", 2))
        .await
        .unwrap();
    assert_eq!(conn.settle(AUDIT, std::time::Duration::from_millis(50)).await, 0);
    assert!(conn.watch_requests("orders")[1].resume_after.is_none());
    tokio::time::timeout(WAIT, handle.shutdown()).await.unwrap();
}

#[test]
fn test_missing_connection_target_is_rejected_by_the_loader() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[capture]\ncollections = [\"orders\"]\n");
    let err = CaptureConfig::load_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError { .. }));
    assert_eq!(err.field(), Some("connection.uri"));
}

#[test]
fn test_audited_destination_is_rejected_by_the_loader() {
    let err = CaptureConfig::from_toml_str(
        r#"
        [connection]
        uri = "mongodb://db"
        [capture]
        collections = ["orders", "audit_logs"]
        "#,
    )
    .unwrap_err();
    assert_eq!(err.field(), Some("capture.destination"));
}
