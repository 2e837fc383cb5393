#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Layered configuration for the changewatch audit pipeline.
//!
//! This crate provides a single [`CaptureConfig`] type describing the
//! connection target, the audited collections, feed and sink tuning,
//! checkpointing and logging.
//!
//! # Usage
//!
//! ```rust,no_run
//! use changewatch_config::CaptureConfig;
//!
//! // defaults → ~/.changewatch/config.toml → ./changewatch.toml → env
//! let config = CaptureConfig::load(Some(std::path::Path::new("changewatch.toml"))).unwrap();
//! println!("auditing {:?}", config.capture.collections);
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Explicit file** passed to [`CaptureConfig::load`]
//! 2. **User** (`~/.changewatch/config.toml`)
//! 3. **Environment variables** (`CHANGEWATCH_*`), fallback only
//! 4. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! # Design
//!
//! This crate has no dependencies on other changewatch crates. The
//! capture crate converts a [`CaptureConfig`] into its runtime
//! configuration at the boundary.

/// Environment variable fallback resolution.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Layered configuration merging.
pub mod merge;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::*;

impl CaptureConfig {
    /// Load configuration with the full precedence chain.
    ///
    /// See [`loader::load`] for the algorithm.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(explicit: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(explicit, None)
    }

    /// Load configuration from a single file (defaults still apply, no env).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }

    /// Parse configuration from a TOML string layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the string is not valid TOML or the
    /// result fails validation.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        loader::load_str(content)
    }
}
