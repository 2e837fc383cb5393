//! Configuration types for the changewatch pipeline.
//!
//! Every struct implements [`Default`] matching `defaults.toml`, so a bare
//! `[section]` header in TOML produces a working section.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration for the change-capture pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Connection target of the audited database.
    pub connection: ConnectionSection,
    /// Audited collections and the audit destination.
    pub capture: CaptureSection,
    /// Change feed supervision.
    pub feed: FeedSection,
    /// Audit record persistence.
    pub sink: SinkSection,
    /// Resume-token checkpointing.
    pub checkpoint: CheckpointSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// ConnectionSection
// ---------------------------------------------------------------------------

/// Where the audited database lives.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Connection URI. May embed credentials, so it is never printed or
    /// serialized.
    #[serde(skip_serializing)]
    pub uri: String,
}

impl std::fmt::Debug for ConnectionSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSection")
            .field("has_uri", &!self.uri.trim().is_empty())
            .finish()
    }
}

impl Serialize for ConnectionSection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ConnectionSection", 1)?;
        state.serialize_field("has_uri", &!self.uri.trim().is_empty())?;
        state.end()
    }
}

// ---------------------------------------------------------------------------
// CaptureSection
// ---------------------------------------------------------------------------

/// Default destination collection for audit records.
pub const DEFAULT_DESTINATION: &str = "audit_logs";

/// What the pipeline does with an event whose transform fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformFailureMode {
    /// Skip the event; no record is written.
    #[default]
    Drop,
    /// Write the record with the untransformed images.
    Untransformed,
    /// Write the record without images, flagged with the failure message.
    MarkErrored,
}

/// Audited collections and the audit destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Collections to audit, in order.
    pub collections: Vec<String>,
    /// Collection that receives audit records.
    pub destination: String,
    /// Recovery policy for transform failures.
    pub transform_failure: TransformFailureMode,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            destination: DEFAULT_DESTINATION.to_owned(),
            transform_failure: TransformFailureMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// FeedSection
// ---------------------------------------------------------------------------

/// Backoff between attempts to reopen a faulted change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    /// First delay after a fault, in milliseconds.
    pub resubscribe_initial_ms: u64,
    /// Upper bound on the doubling delay, in milliseconds.
    pub resubscribe_max_ms: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            resubscribe_initial_ms: 500,
            resubscribe_max_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// SinkSection
// ---------------------------------------------------------------------------

/// Audit record persistence retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    /// Attempts per record before it is given up on (at least 1).
    pub write_attempts: u32,
    /// Delay between attempts, in milliseconds.
    pub retry_backoff_ms: u64,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointSection
// ---------------------------------------------------------------------------

/// Resume-token checkpointing across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// Whether feeds persist and resume from their last position.
    pub enabled: bool,
    /// Directory holding the checkpoint file. Required when enabled.
    pub path: String,
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["changewatch_capture=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
        }
    }
}
