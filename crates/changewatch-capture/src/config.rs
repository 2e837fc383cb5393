//! Runtime configuration of one audit pipeline.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use changewatch_config::CaptureConfig;
use changewatch_config::validate::check_collection_name;

use crate::builder::{AuditRecordBuilder, Transform, TransformFailurePolicy};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::error::{CaptureError, CaptureResult};

/// Default audit destination collection.
pub const DEFAULT_DESTINATION: &str = changewatch_config::DEFAULT_DESTINATION;

const DEFAULT_RESUBSCRIBE_INITIAL: Duration = Duration::from_millis(500);
const DEFAULT_RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);
const DEFAULT_WRITE_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);
const MIN_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(1);

/// Validated, immutable pipeline configuration.
///
/// Constructed once with [`AuditConfiguration::builder`] or
/// [`AuditConfiguration::from_config`] and shared by every component of
/// the pipeline it configures.
#[derive(Clone)]
pub struct AuditConfiguration {
    uri: String,
    collections: Vec<String>,
    destination: String,
    transform: Option<Transform>,
    transform_failure: TransformFailurePolicy,
    resubscribe_initial: Duration,
    resubscribe_max: Duration,
    write_attempts: u32,
    retry_backoff: Duration,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl AuditConfiguration {
    /// Start building a configuration for the given connection target.
    #[must_use]
    pub fn builder(uri: impl Into<String>) -> AuditConfigurationBuilder {
        AuditConfigurationBuilder::new(uri)
    }

    /// Convert a loaded file configuration.
    ///
    /// A transform can only be supplied programmatically; use
    /// [`AuditConfiguration::builder`] for that.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`CaptureError`] if the values are unusable.
    pub fn from_config(config: &CaptureConfig) -> CaptureResult<Self> {
        Self::builder_from_config(config).build()
    }

    /// A builder pre-filled from a loaded file configuration.
    #[must_use]
    pub fn builder_from_config(config: &CaptureConfig) -> AuditConfigurationBuilder {
        let mut builder = Self::builder(config.connection.uri.clone())
            .collections(config.capture.collections.iter().cloned())
            .destination(config.capture.destination.clone())
            .transform_failure(config.capture.transform_failure.into())
            .resubscribe_backoff(
                Duration::from_millis(config.feed.resubscribe_initial_ms),
                Duration::from_millis(config.feed.resubscribe_max_ms),
            )
            .write_retry(
                config.sink.write_attempts,
                Duration::from_millis(config.sink.retry_backoff_ms),
            );
        if config.checkpoint.enabled {
            builder = builder.checkpoint_store(Arc::new(FileCheckpointStore::new(
                &config.checkpoint.path,
            )));
        }
        builder
    }

    /// The connection target, kept verbatim.
    ///
    /// The pipeline never dials it: [`AuditManager::initialize`] receives an
    /// established [`Connection`]. The caller uses this value to build that
    /// connection with its driver.
    ///
    /// [`AuditManager::initialize`]: crate::AuditManager::initialize
    /// [`Connection`]: crate::Connection
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Audited collections, in configuration order.
    #[must_use]
    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    /// The audit destination collection.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The image transform, if any.
    #[must_use]
    pub fn transform(&self) -> Option<&Transform> {
        self.transform.as_ref()
    }

    /// What happens to events whose transform fails.
    #[must_use]
    pub fn transform_failure(&self) -> TransformFailurePolicy {
        self.transform_failure
    }

    /// First delay before reopening a faulted feed.
    #[must_use]
    pub fn resubscribe_initial(&self) -> Duration {
        self.resubscribe_initial
    }

    /// Upper bound on the reopen delay.
    #[must_use]
    pub fn resubscribe_max(&self) -> Duration {
        self.resubscribe_max
    }

    /// Write attempts per record.
    #[must_use]
    pub fn write_attempts(&self) -> u32 {
        self.write_attempts
    }

    /// Delay between write attempts.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// The checkpoint store, when checkpointing is enabled.
    #[must_use]
    pub fn checkpoint_store(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.checkpoints.as_ref()
    }

    /// A record builder for this configuration.
    #[must_use]
    pub fn record_builder(&self) -> AuditRecordBuilder {
        AuditRecordBuilder::new(self.transform.clone(), self.transform_failure)
    }
}

impl fmt::Debug for AuditConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditConfiguration")
            .field("uri", &"[REDACTED]")
            .field("collections", &self.collections)
            .field("destination", &self.destination)
            .field("has_transform", &self.transform.is_some())
            .field("transform_failure", &self.transform_failure)
            .field("resubscribe_initial", &self.resubscribe_initial)
            .field("resubscribe_max", &self.resubscribe_max)
            .field("write_attempts", &self.write_attempts)
            .field("retry_backoff", &self.retry_backoff)
            .field("checkpointing", &self.checkpoints.is_some())
            .finish()
    }
}

/// Builder for [`AuditConfiguration`].
#[must_use]
pub struct AuditConfigurationBuilder {
    uri: String,
    collections: Vec<String>,
    destination: String,
    transform: Option<Transform>,
    transform_failure: TransformFailurePolicy,
    resubscribe_initial: Duration,
    resubscribe_max: Duration,
    write_attempts: u32,
    retry_backoff: Duration,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl AuditConfigurationBuilder {
    fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            collections: Vec::new(),
            destination: DEFAULT_DESTINATION.to_owned(),
            transform: None,
            transform_failure: TransformFailurePolicy::default(),
            resubscribe_initial: DEFAULT_RESUBSCRIBE_INITIAL,
            resubscribe_max: DEFAULT_RESUBSCRIBE_MAX,
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            checkpoints: None,
        }
    }

    /// Audit one more collection.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collections.push(name.into());
        self
    }

    /// Audit several more collections.
    pub fn collections<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections.extend(names.into_iter().map(Into::into));
        self
    }

    /// Write audit records to `name` instead of `audit_logs`.
    pub fn destination(mut self, name: impl Into<String>) -> Self {
        self.destination = name.into();
        self
    }

    /// Apply `transform` to every present image.
    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Choose what happens to events whose transform fails.
    pub fn transform_failure(mut self, policy: TransformFailurePolicy) -> Self {
        self.transform_failure = policy;
        self
    }

    /// Delay before reopening a faulted feed, doubling up to `max`.
    pub fn resubscribe_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.resubscribe_initial = initial;
        self.resubscribe_max = max;
        self
    }

    /// Attempts per record write and the delay between them.
    pub fn write_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.write_attempts = attempts;
        self.retry_backoff = backoff;
        self
    }

    /// Persist feed positions in `store` and resume from them on start.
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// - [`CaptureError::MissingConnectionTarget`] if the target is blank
    /// - [`CaptureError::NoCollections`] if no collection was added
    /// - [`CaptureError::InvalidCollectionName`] for an unusable name
    /// - [`CaptureError::DuplicateCollection`] for a repeated name
    /// - [`CaptureError::DestinationIsAudited`] if the destination is audited
    pub fn build(self) -> CaptureResult<AuditConfiguration> {
        if self.uri.trim().is_empty() {
            return Err(CaptureError::MissingConnectionTarget);
        }
        if self.collections.is_empty() {
            return Err(CaptureError::NoCollections);
        }

        let mut seen = HashSet::new();
        for name in &self.collections {
            check_collection_name(name).map_err(CaptureError::InvalidCollectionName)?;
            if !seen.insert(name.as_str()) {
                return Err(CaptureError::DuplicateCollection(name.clone()));
            }
        }
        check_collection_name(&self.destination).map_err(CaptureError::InvalidCollectionName)?;
        if seen.contains(self.destination.as_str()) {
            return Err(CaptureError::DestinationIsAudited(self.destination));
        }

        let resubscribe_initial = self.resubscribe_initial.max(MIN_RESUBSCRIBE_DELAY);
        Ok(AuditConfiguration {
            uri: self.uri,
            collections: self.collections,
            destination: self.destination,
            transform: self.transform,
            transform_failure: self.transform_failure,
            resubscribe_initial,
            resubscribe_max: self.resubscribe_max.max(resubscribe_initial),
            write_attempts: self.write_attempts.max(1),
            retry_backoff: self.retry_backoff,
            checkpoints: self.checkpoints,
        })
    }
}
