//! Shared harness for pipeline integration tests.

use std::sync::{Arc, Once};
use std::time::Duration;

use changewatch_capture::prelude::*;
use changewatch_capture::{AuditConfigurationBuilder, ObserverRegistry};
use changewatch_telemetry::{LogConfig, LogTarget, setup_logging};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// The audit destination used by every harness.
#[allow(dead_code)]
pub const AUDIT: &str = "audit_logs";

static LOGGING: Once = Once::new();

/// Route pipeline logs to stderr once per test binary.
///
/// Set `RUST_LOG`-style levels with `CHANGEWATCH_TEST_LOG` (default `warn`).
pub fn init_logging() {
    LOGGING.call_once(|| {
        let level = std::env::var("CHANGEWATCH_TEST_LOG").unwrap_or_else(|_| "warn".into());
        let config = LogConfig::new(level)
            .with_target(LogTarget::Stderr)
            .without_ansi();
        // Another harness in the same binary may already own the global subscriber.
        let _ = setup_logging(&config);
    });
}

/// A started pipeline over an in-memory connection.
#[allow(dead_code)]
pub struct Pipeline {
    /// The fake upstream collaborator.
    pub conn: Arc<MemoryConnection>,
    /// The manager that owns the pipeline.
    pub manager: AuditManager,
    /// Running workers.
    pub handle: CaptureHandle,
    /// Records seen by a channel observer, in notification order.
    pub records: UnboundedReceiver<AuditRecord>,
}

#[allow(dead_code)]
impl Pipeline {
    /// Initialize and start `config` over `conn`, waiting for every feed to open.
    pub async fn start(conn: Arc<MemoryConnection>, config: AuditConfiguration) -> Self {
        init_logging();
        let collections: Vec<String> = config.collections().to_vec();
        let manager = AuditManager::initialize(config, conn.clone())
            .await
            .unwrap();
        let (observer, records) = ChannelObserver::channel();
        manager.register_observer(Arc::new(observer));
        let handle = manager.start().unwrap();
        for collection in &collections {
            tokio::time::timeout(WAIT, conn.wait_for_watchers(collection, 1))
                .await
                .unwrap();
        }
        Self {
            conn,
            manager,
            handle,
            records,
        }
    }

    /// The observer registry of the running pipeline.
    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        self.manager.observers()
    }

    /// Wait for the next observed record.
    pub async fn next_record(&mut self) -> AuditRecord {
        tokio::time::timeout(WAIT, self.records.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Wait until `count` records have been written to the destination.
    pub async fn wait_for_audit(&self, count: usize) -> Vec<Document> {
        tokio::time::timeout(WAIT, self.conn.wait_for_inserts(AUDIT, count))
            .await
            .unwrap();
        self.conn.inserted(AUDIT)
    }

    /// Stop the pipeline.
    pub async fn stop(self) {
        tokio::time::timeout(WAIT, self.handle.shutdown())
            .await
            .unwrap();
    }
}

/// A configuration auditing `collections` with fast test backoffs.
#[allow(dead_code)]
pub fn config(collections: &[&str]) -> AuditConfigurationBuilder {
    AuditConfiguration::builder("memory://test")
        .collections(collections.iter().copied())
        .resubscribe_backoff(Duration::from_millis(5), Duration::from_millis(40))
        .write_retry(3, Duration::from_millis(1))
}

/// Raw insert notification.
#[allow(dead_code)]
pub fn insert(id: Value, after: Value) -> Value {
    json!({
        "operationType": "insert",
        "documentKey": { "_id": id },
        "fullDocument": after,
    })
}

/// Raw update notification with both images.
#[allow(dead_code)]
pub fn update(id: Value, before: Value, after: Value) -> Value {
    json!({
        "operationType": "update",
        "documentKey": { "_id": id },
        "fullDocumentBeforeChange": before,
        "fullDocument": after,
    })
}

/// Raw delete notification with the prior state.
#[allow(dead_code)]
pub fn delete(id: Value, before: Value) -> Value {
    json!({
        "operationType": "delete",
        "documentKey": { "_id": id },
        "fullDocumentBeforeChange": before,
    })
}
