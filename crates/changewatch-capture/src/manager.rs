//! Audit manager: orchestrates the capture pipeline.
//!
//! The [`AuditManager`] is the only component callers interact with. It
//! wires together:
//! - The [`PreImageProvisioner`] (image retention per collection)
//! - One [`FeedWorker`] per collection (subscribe, build, deliver)
//! - The shared [`AuditSink`] and its [`ObserverRegistry`]
//!
//! # Lifecycle
//!
//! 1. [`AuditManager::initialize`] provisions every collection. Provisioning
//!    outcomes are recorded and never fail initialization.
//! 2. [`AuditManager::start`] checks the connection and spawns the workers.
//! 3. [`CaptureHandle::shutdown`] stops every worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AuditConfiguration;
use crate::connection::Connection;
use crate::error::{CaptureError, CaptureResult};
use crate::feed::FeedWorker;
use crate::observer::{AuditObserver, ObserverId, ObserverRegistry};
use crate::provision::{PreImageProvisioner, ProvisionOutcome};
use crate::sink::AuditSink;
use crate::subscriber::ChangeSubscriber;

/// Owns one audit pipeline.
pub struct AuditManager {
    config: Arc<AuditConfiguration>,
    connection: Arc<dyn Connection>,
    observers: Arc<ObserverRegistry>,
    provisioning: Vec<(String, ProvisionOutcome)>,
    started: AtomicBool,
}

impl AuditManager {
    /// Provision image retention for every configured collection.
    ///
    /// Each collection gets its own fresh principal lookup. Degraded
    /// outcomes are logged and available from [`Self::provisioning`].
    ///
    /// # Errors
    ///
    /// Fatal configuration errors are raised when `config` is built, so a
    /// built configuration always initializes. Provisioning problems are
    /// degraded outcomes, not errors.
    pub async fn initialize(
        config: AuditConfiguration,
        connection: Arc<dyn Connection>,
    ) -> CaptureResult<Self> {
        let provisioner = PreImageProvisioner::new(Arc::clone(&connection));

        let mut provisioning = Vec::with_capacity(config.collections().len());
        for collection in config.collections() {
            let outcome = provisioner.provision(collection).await;
            provisioning.push((collection.clone(), outcome));
        }

        let degraded = provisioning.iter().filter(|(_, o)| !o.is_enabled()).count();
        info!(
            collections = config.collections().len(),
            degraded,
            destination = %config.destination(),
            "Audit pipeline initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            connection,
            observers: Arc::new(ObserverRegistry::new()),
            provisioning,
            started: AtomicBool::new(false),
        })
    }

    /// The pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &AuditConfiguration {
        &self.config
    }

    /// Provisioning outcome per collection, in configuration order.
    #[must_use]
    pub fn provisioning(&self) -> &[(String, ProvisionOutcome)] {
        &self.provisioning
    }

    /// The observer registry shared with the sink.
    #[must_use]
    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    /// Register an observer for committed records.
    pub fn register_observer(&self, observer: Arc<dyn AuditObserver>) -> ObserverId {
        self.observers.register(observer)
    }

    /// Whether [`Self::start`] has succeeded.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Open one feed per collection and start delivering records.
    ///
    /// # Errors
    ///
    /// - [`CaptureError::NotConnected`] if the connection is not established
    /// - [`CaptureError::AlreadyStarted`] if the pipeline is already running
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the feed workers are
    /// spawned onto the current one.
    pub fn start(&self) -> CaptureResult<CaptureHandle> {
        if !self.connection.is_connected() {
            return Err(CaptureError::NotConnected);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(CaptureError::AlreadyStarted);
        }

        let cancel = CancellationToken::new();
        let sink = Arc::new(
            AuditSink::new(
                Arc::clone(&self.connection),
                self.config.destination(),
                Arc::clone(&self.observers),
            )
            .with_retry(self.config.write_attempts(), self.config.retry_backoff()),
        );
        let subscriber = ChangeSubscriber::new(Arc::clone(&self.connection));

        let tasks = self
            .config
            .collections()
            .iter()
            .map(|collection| {
                let worker = FeedWorker::new(
                    collection.clone(),
                    subscriber.clone(),
                    self.config.record_builder(),
                    Arc::clone(&sink),
                    cancel.child_token(),
                )
                .with_backoff(
                    self.config.resubscribe_initial(),
                    self.config.resubscribe_max(),
                )
                .with_checkpoints(self.config.checkpoint_store().cloned());
                (collection.clone(), worker.spawn())
            })
            .collect();

        info!(
            collections = self.config.collections().len(),
            "Audit pipeline started"
        );
        Ok(CaptureHandle { cancel, tasks })
    }
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager")
            .field("config", &self.config)
            .field("observers", &self.observers)
            .field("provisioning", &self.provisioning)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

/// Running feed workers of a started pipeline.
#[derive(Debug)]
pub struct CaptureHandle {
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl CaptureHandle {
    /// Collections with a running worker.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|(name, _)| name.as_str())
    }

    /// A token that stops every worker when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether every worker has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|(_, task)| task.is_finished())
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// A record being written when shutdown is requested is finished
    /// first. A record whose writes keep failing is abandoned uncommitted;
    /// with checkpoints enabled it is read again on the next start.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (collection, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(collection = %collection, error = %e, "Feed worker panicked");
            }
        }
        info!("Audit pipeline stopped");
    }
}
