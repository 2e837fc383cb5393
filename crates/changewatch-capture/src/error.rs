//! Capture pipeline error types.

use changewatch_core::NormalizeError;
use thiserror::Error;

/// Errors surfaced by the upstream database collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// An administrative command failed.
    #[error("command '{command}' failed: {message}")]
    Command {
        /// Name of the command.
        command: String,
        /// Server or driver message.
        message: String,
    },

    /// A change feed could not be opened or faulted while open.
    #[error("change feed on '{collection}' failed: {message}")]
    Stream {
        /// The watched collection.
        collection: String,
        /// Server or driver message.
        message: String,
    },

    /// An insert into a collection failed.
    #[error("write to '{collection}' failed: {message}")]
    Write {
        /// The target collection.
        collection: String,
        /// Server or driver message.
        message: String,
    },

    /// The session is not connected.
    #[error("not connected")]
    Disconnected,
}

/// Result type for upstream collaborator calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// An item on a normalized change feed that is not an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// The feed faulted. The subscription must be reopened.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// One notification could not be normalized. The feed is still usable.
    #[error("malformed notification: {0}")]
    Malformed(#[from] NormalizeError),
}

impl FeedError {
    /// Whether the feed must be reopened.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Driver(_))
    }
}

/// A user transform failed for one image.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    /// The transform returned an error.
    #[error("transform failed: {0}")]
    Failed(String),

    /// The transform panicked.
    #[error("transform panicked: {0}")]
    Panicked(String),
}

/// Errors from the capture pipeline.
///
/// The configuration and connection variants are fatal: they abort
/// `initialize` or `start`. Everything else is reported per feed or per
/// event and never stops other collections.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No connection target was configured.
    #[error("a connection target is required")]
    MissingConnectionTarget,

    /// The collection list is empty.
    #[error("at least one collection must be audited")]
    NoCollections,

    /// A collection is listed twice.
    #[error("collection '{0}' is listed more than once")]
    DuplicateCollection(String),

    /// A collection or destination name is unusable.
    #[error("invalid collection name: {0}")]
    InvalidCollectionName(String),

    /// The destination is also an audited collection.
    #[error("destination '{0}' is also an audited collection")]
    DestinationIsAudited(String),

    /// `start` was called without an established connection.
    #[error("no established connection")]
    NotConnected,

    /// `start` was called on a pipeline that is already running.
    #[error("pipeline already started")]
    AlreadyStarted,

    /// Upstream collaborator error.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File configuration error.
    #[error(transparent)]
    Config(#[from] changewatch_config::ConfigError),
}

impl CaptureError {
    /// Whether this error aborts initialization or start.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingConnectionTarget
                | Self::NoCollections
                | Self::DuplicateCollection(_)
                | Self::InvalidCollectionName(_)
                | Self::DestinationIsAudited(_)
                | Self::NotConnected
                | Self::AlreadyStarted
                | Self::Config(_)
        )
    }
}

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;
