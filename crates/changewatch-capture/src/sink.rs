//! Persists audit records, then notifies observers.

use std::sync::Arc;
use std::time::Duration;

use changewatch_core::AuditRecord;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::error::DriverResult;
use crate::observer::ObserverRegistry;

/// Writes audit records to the destination collection.
///
/// Each record is an independent insert. Observers are notified only
/// after the insert succeeded.
pub struct AuditSink {
    connection: Arc<dyn Connection>,
    destination: String,
    observers: Arc<ObserverRegistry>,
    write_attempts: u32,
    retry_backoff: Duration,
}

impl AuditSink {
    /// Create a sink writing to `destination` with a single write attempt.
    #[must_use]
    pub fn new(
        connection: Arc<dyn Connection>,
        destination: impl Into<String>,
        observers: Arc<ObserverRegistry>,
    ) -> Self {
        Self {
            connection,
            destination: destination.into(),
            observers,
            write_attempts: 1,
            retry_backoff: Duration::ZERO,
        }
    }

    /// Retry failed writes up to `attempts` times in total, waiting
    /// `backoff` between attempts.
    #[must_use]
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.write_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// The destination collection.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Persist `record` with a single insert.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`](crate::DriverError) if the insert fails.
    pub async fn commit(&self, record: &AuditRecord) -> DriverResult<()> {
        self.connection
            .insert_one(&self.destination, record.to_document())
            .await
    }

    /// Deliver `record` to every registered observer.
    pub fn notify(&self, record: &AuditRecord) {
        self.observers.notify(record);
    }

    /// Persist `record` with retries, then notify observers.
    ///
    /// Observers only see records that were persisted.
    ///
    /// # Errors
    ///
    /// Returns the last [`DriverError`](crate::DriverError) once every
    /// attempt has failed. The record is not skipped: the caller still owns
    /// it and decides when to deliver it again.
    pub async fn deliver(&self, record: &AuditRecord) -> DriverResult<()> {
        let mut attempt: u32 = 1;
        loop {
            match self.commit(record).await {
                Ok(()) => break,
                Err(e) if attempt < self.write_attempts => {
                    warn!(
                        collection = %record.collection,
                        destination = %self.destination,
                        attempt,
                        error = %e,
                        "Audit write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                    attempt = attempt.saturating_add(1);
                },
                Err(e) => {
                    error!(
                        collection = %record.collection,
                        destination = %self.destination,
                        document_id = %record.document_id,
                        operation = %record.operation,
                        attempts = attempt,
                        error = %e,
                        "Audit write failed on every attempt"
                    );
                    return Err(e);
                },
            }
        }

        debug!(
            collection = %record.collection,
            document_id = %record.document_id,
            operation = %record.operation,
            "Audit record committed"
        );
        self.notify(record);
        Ok(())
    }
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("destination", &self.destination)
            .field("write_attempts", &self.write_attempts)
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use crate::observer::ChannelObserver;
    use changewatch_core::{Document, OperationKind, into_document};
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn delete_record() -> AuditRecord {
        AuditRecord {
            collection: "orders".into(),
            document_id: json!(7),
            operation: OperationKind::Delete,
            timestamp: Utc::now(),
            before: into_document(json!({ "_id": 7, "status": "paid" })),
            after: None,
            transform_error: None,
        }
    }

    fn sink(conn: &Arc<MemoryConnection>) -> (AuditSink, UnboundedReceiver<AuditRecord>) {
        let observers = Arc::new(ObserverRegistry::new());
        let (observer, rx) = ChannelObserver::channel();
        observers.register(Arc::new(observer));
        let sink = AuditSink::new(conn.clone(), "audit_logs", observers)
            .with_retry(3, Duration::from_millis(1));
        (sink, rx)
    }

    #[tokio::test]
    async fn test_deliver_persists_then_notifies() {
        let conn = Arc::new(MemoryConnection::new());
        let (sink, mut rx) = sink(&conn);

        sink.deliver(&delete_record()).await.unwrap();

        let stored: Vec<Document> = conn.inserted("audit_logs");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["documentId"], json!(7));
        assert_eq!(stored[0]["operation"], json!("delete"));
        assert_eq!(stored[0]["after"], json!(null));
        assert_eq!(rx.try_recv().unwrap().document_id, json!(7));
    }

    #[tokio::test]
    async fn test_deliver_retries_transient_failures() {
        let conn = Arc::new(MemoryConnection::new());
        conn.fail_next_inserts(2);
        let (sink, mut rx) = sink(&conn);

        sink.deliver(&delete_record()).await.unwrap();
        assert_eq!(conn.inserted("audit_logs").len(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_deliver_reports_exhausted_attempts_without_notifying() {
        let conn = Arc::new(MemoryConnection::new());
        conn.fail_next_inserts(3);
        let (sink, mut rx) = sink(&conn);

        assert!(sink.deliver(&delete_record()).await.is_err());
        assert!(conn.inserted("audit_logs").is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_commit_does_not_notify() {
        let conn = Arc::new(MemoryConnection::new());
        let (sink, mut rx) = sink(&conn);
        sink.commit(&delete_record()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
