//! Changewatch Capture - The change-capture audit pipeline.
//!
//! This crate provides:
//! - The upstream [`Connection`] seam and an in-memory [`MemoryConnection`]
//! - Permission-aware image retention ([`PermissionResolver`], [`PreImageProvisioner`])
//! - Per-collection change subscriptions ([`ChangeSubscriber`], [`FeedWorker`])
//! - Record building with an optional user [`Transform`] ([`AuditRecordBuilder`])
//! - Persistence and observer fan-out ([`AuditSink`], [`ObserverRegistry`])
//! - Optional resume-token checkpoints ([`CheckpointStore`])
//! - The [`AuditManager`] orchestrator
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use changewatch_capture::prelude::*;
//!
//! # async fn run(connection: Arc<dyn Connection>) -> CaptureResult<()> {
//! let config = AuditConfiguration::builder("mongodb://db:27017")
//!     .collections(["orders", "users"])
//!     .transform(Transform::infallible(|doc| {
//!         let mut doc = doc.clone();
//!         doc.remove("password");
//!         doc
//!     }))
//!     .build()?;
//!
//! let manager = AuditManager::initialize(config, connection).await?;
//! let (observer, mut records) = ChannelObserver::channel();
//! manager.register_observer(Arc::new(observer));
//!
//! let handle = manager.start()?;
//! while let Some(record) = records.recv().await {
//!     println!("{} {} {}", record.collection, record.operation, record.document_id);
//! }
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod memory;
pub mod prelude;

mod builder;
mod checkpoint;
mod config;
mod connection;
mod error;
mod feed;
mod manager;
mod observer;
mod permission;
mod provision;
mod sink;
mod subscriber;

pub use builder::{AuditRecordBuilder, Transform, TransformFailurePolicy};
pub use checkpoint::{
    CHECKPOINT_FILE, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use config::{AuditConfiguration, AuditConfigurationBuilder, DEFAULT_DESTINATION};
pub use connection::{
    ChangeStream, Connection, FullDocument, FullDocumentBeforeChange, WatchOptions,
};
pub use error::{
    CaptureError, CaptureResult, DriverError, DriverResult, FeedError, TransformError,
};
pub use feed::FeedWorker;
pub use manager::{AuditManager, CaptureHandle};
pub use memory::MemoryConnection;
pub use observer::{AuditObserver, ChannelObserver, FnObserver, ObserverId, ObserverRegistry};
pub use permission::{ADMIN_ROLES, ELEVATING_ACTIONS, ElevationGrant, PermissionResolver};
pub use provision::{PreImageProvisioner, ProvisionOutcome};
pub use sink::AuditSink;
pub use subscriber::{ChangeSubscriber, EventStream};
