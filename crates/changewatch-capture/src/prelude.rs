//! Prelude module - commonly used types for convenient import.
//!
//! Use `use changewatch_capture::prelude::*;` to import all essential types.

// Errors
pub use crate::{CaptureError, CaptureResult, DriverError, TransformError};

// Configuration
pub use crate::{AuditConfiguration, TransformFailurePolicy};

// Orchestration
pub use crate::{AuditManager, CaptureHandle, ProvisionOutcome};

// Upstream collaborator
pub use crate::{Connection, MemoryConnection};

// Records and observers
pub use crate::{AuditObserver, ChannelObserver, FnObserver, Transform};

// Checkpoints
pub use crate::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

// Domain types
pub use changewatch_core::{AuditRecord, ChangeEvent, Document, OperationKind, ResumeToken};
