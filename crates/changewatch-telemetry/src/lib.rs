//! Changewatch Telemetry - Logging for the change-capture pipeline.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats
//! - Stdout, stderr and rolling-file targets
//! - A bridge from the `[logging]` config section (feature `config`)
//!
//! # Example
//!
//! ```rust,no_run
//! use changewatch_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), changewatch_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Json)
//!     .with_directive("changewatch_capture=debug");
//!
//! setup_logging(&config)?;
//! tracing::info!(collection = "orders", "feed opened");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_logging};
