//! Per-collection feed supervision.
//!
//! One [`FeedWorker`] runs per audited collection. It is the only reader
//! of that collection's feed and the only writer of that collection's
//! records, so records are committed in the order their mutations were
//! observed. Faults reopen the feed after an exponential backoff and never
//! affect other collections.
//!
//! A record whose writes keep failing holds the feed: the worker retries it
//! with the same backoff and reads nothing further until it is committed.
//! The resume position and checkpoint never move past an uncommitted
//! record.

use std::sync::Arc;
use std::time::Duration;

use changewatch_core::{ChangeEvent, OperationKind, ResumeToken};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::AuditRecordBuilder;
use crate::checkpoint::CheckpointStore;
use crate::error::{DriverError, FeedError};
use crate::sink::AuditSink;
use crate::subscriber::{ChangeSubscriber, EventStream};

/// Why a feed stopped being read.
#[derive(Debug)]
enum FeedEnd {
    Cancelled,
    Closed,
    Faulted(DriverError),
    Invalidated,
}

/// Reads one collection's feed and delivers its audit records.
pub struct FeedWorker {
    collection: String,
    subscriber: ChangeSubscriber,
    builder: AuditRecordBuilder,
    sink: Arc<AuditSink>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    backoff_initial: Duration,
    backoff_max: Duration,
    cancel: CancellationToken,
}

impl FeedWorker {
    /// Create a worker for `collection`.
    #[must_use]
    pub fn new(
        collection: impl Into<String>,
        subscriber: ChangeSubscriber,
        builder: AuditRecordBuilder,
        sink: Arc<AuditSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            collection: collection.into(),
            subscriber,
            builder,
            sink,
            checkpoints: None,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            cancel,
        }
    }

    /// Delay before reopening a faulted feed, doubling up to `max`.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max.max(initial);
        self
    }

    /// Resume from and save positions to `store`.
    #[must_use]
    pub fn with_checkpoints(mut self, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        self.checkpoints = store;
        self
    }

    /// The collection this worker reads.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Run the worker on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Read and deliver until cancelled.
    pub async fn run(self) {
        let mut token = self.load_checkpoint().await;
        let mut delay = self.backoff_initial;

        loop {
            let opened = tokio::select! {
                () = self.cancel.cancelled() => break,
                opened = self.subscriber.subscribe(&self.collection, token.clone()) => opened,
            };

            match opened {
                Ok(stream) => {
                    let (end, received) = self.consume(stream, &mut token).await;
                    if received {
                        delay = self.backoff_initial;
                    }
                    match end {
                        FeedEnd::Cancelled => break,
                        FeedEnd::Closed => {
                            warn!(collection = %self.collection, "Change feed closed, reopening");
                        },
                        FeedEnd::Faulted(e) => {
                            warn!(
                                collection = %self.collection,
                                error = %e,
                                "Change feed faulted, reopening"
                            );
                        },
                        FeedEnd::Invalidated => {
                            warn!(
                                collection = %self.collection,
                                "Change feed invalidated, reopening from now"
                            );
                            token = None;
                        },
                    }
                },
                Err(e) => {
                    warn!(
                        collection = %self.collection,
                        error = %e,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Failed to open change feed"
                    );
                },
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {},
            }
            delay = delay.saturating_mul(2).min(self.backoff_max);
        }

        info!(collection = %self.collection, "Change feed stopped");
    }

    async fn load_checkpoint(&self) -> Option<ResumeToken> {
        let store = self.checkpoints.as_ref()?;
        match store.load(&self.collection).await {
            Ok(token) => {
                debug!(
                    collection = %self.collection,
                    resuming = token.is_some(),
                    "Checkpoint loaded"
                );
                token
            },
            Err(e) => {
                warn!(
                    collection = %self.collection,
                    error = %e,
                    "Failed to load checkpoint, starting from now"
                );
                None
            },
        }
    }

    /// Read `stream` until it ends. Also reports whether any item arrived,
    /// so a feed that keeps closing right after opening still backs off.
    async fn consume(
        &self,
        mut stream: EventStream,
        token: &mut Option<ResumeToken>,
    ) -> (FeedEnd, bool) {
        let mut received = false;
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return (FeedEnd::Cancelled, received),
                next = stream.next() => next,
            };
            if next.is_some() {
                received = true;
            }

            match next {
                None => return (FeedEnd::Closed, received),
                Some(Err(FeedError::Driver(e))) => return (FeedEnd::Faulted(e), received),
                Some(Err(FeedError::Malformed(e))) => {
                    warn!(
                        collection = %self.collection,
                        error = %e,
                        "Skipping malformed change notification"
                    );
                },
                Some(Ok(event)) => {
                    if *event.operation() == OperationKind::Invalidate {
                        return (FeedEnd::Invalidated, received);
                    }
                    if !self.handle(&event).await {
                        return (FeedEnd::Cancelled, received);
                    }
                    if let Some(position) = event.resume_token() {
                        *token = Some(position.clone());
                    }
                },
            }
        }
    }

    /// Build and deliver the record for `event`, retrying until it is
    /// committed. Returns `false` if cancelled first.
    async fn handle(&self, event: &ChangeEvent) -> bool {
        let Some(record) = self.builder.build_or_recover(event) else {
            return true;
        };

        let mut delay = self.backoff_initial;
        while let Err(e) = self.sink.deliver(&record).await {
            warn!(
                collection = %self.collection,
                document_id = %record.document_id,
                error = %e,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Audit record not persisted, holding feed"
            );
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = tokio::time::sleep(delay) => {},
            }
            delay = delay.saturating_mul(2).min(self.backoff_max);
        }

        if let (Some(store), Some(position)) = (&self.checkpoints, event.resume_token()) {
            if let Err(e) = store.save(&self.collection, position).await {
                warn!(collection = %self.collection, error = %e, "Failed to save checkpoint");
            }
        }
        true
    }
}

impl std::fmt::Debug for FeedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedWorker")
            .field("collection", &self.collection)
            .field("backoff_initial", &self.backoff_initial)
            .field("backoff_max", &self.backoff_max)
            .field("checkpointing", &self.checkpoints.is_some())
            .finish_non_exhaustive()
    }
}
