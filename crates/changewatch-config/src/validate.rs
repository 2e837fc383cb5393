//! Post-merge configuration validation.
//!
//! Validates that deserialized [`CaptureConfig`] values are within
//! acceptable ranges and that cross-field invariants hold.

use std::collections::HashSet;

use crate::error::{ConfigError, ConfigResult};
use crate::types::CaptureConfig;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &CaptureConfig) -> ConfigResult<()> {
    validate_connection(config)?;
    validate_capture(config)?;
    validate_feed(config)?;
    validate_sink(config)?;
    validate_checkpoint(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

/// Check that `name` is usable as a collection name.
///
/// # Errors
///
/// Returns a description of the problem.
pub fn check_collection_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("collection name must not be empty".to_owned());
    }
    if name.contains('$') {
        return Err(format!("collection name '{name}' must not contain '$'"));
    }
    if name.contains('\0') {
        return Err(format!(
            "collection name '{}' must not contain null bytes",
            name.escape_default()
        ));
    }
    Ok(())
}

fn validate_connection(config: &CaptureConfig) -> ConfigResult<()> {
    if config.connection.uri.trim().is_empty() {
        return Err(invalid(
            "connection.uri",
            "a connection target is required (set it in a config file or CHANGEWATCH_URI)",
        ));
    }
    Ok(())
}

fn validate_capture(config: &CaptureConfig) -> ConfigResult<()> {
    let capture = &config.capture;

    if capture.collections.is_empty() {
        return Err(invalid(
            "capture.collections",
            "at least one collection must be audited",
        ));
    }

    let mut seen = HashSet::new();
    for name in &capture.collections {
        check_collection_name(name).map_err(|m| invalid("capture.collections", m))?;
        if !seen.insert(name.as_str()) {
            return Err(invalid(
                "capture.collections",
                format!("collection '{name}' is listed more than once"),
            ));
        }
    }

    check_collection_name(&capture.destination)
        .map_err(|m| invalid("capture.destination", m))?;
    if seen.contains(capture.destination.as_str()) {
        return Err(invalid(
            "capture.destination",
            format!(
                "destination '{}' is also audited; its own writes would be audited forever",
                capture.destination
            ),
        ));
    }

    Ok(())
}

fn validate_feed(config: &CaptureConfig) -> ConfigResult<()> {
    let feed = &config.feed;
    if feed.resubscribe_initial_ms == 0 {
        return Err(invalid(
            "feed.resubscribe_initial_ms",
            "must be greater than 0",
        ));
    }
    if feed.resubscribe_max_ms < feed.resubscribe_initial_ms {
        return Err(invalid(
            "feed.resubscribe_max_ms",
            format!(
                "{} is below resubscribe_initial_ms ({})",
                feed.resubscribe_max_ms, feed.resubscribe_initial_ms
            ),
        ));
    }
    Ok(())
}

fn validate_sink(config: &CaptureConfig) -> ConfigResult<()> {
    if config.sink.write_attempts == 0 {
        return Err(invalid("sink.write_attempts", "must be at least 1"));
    }
    Ok(())
}

fn validate_checkpoint(config: &CaptureConfig) -> ConfigResult<()> {
    if config.checkpoint.enabled && config.checkpoint.path.trim().is_empty() {
        return Err(invalid(
            "checkpoint.path",
            "a directory is required when checkpointing is enabled",
        ));
    }
    Ok(())
}

fn validate_logging(config: &CaptureConfig) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ),
        ));
    }

    let valid_formats = ["pretty", "compact", "json", "full"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                valid_formats.join(", ")
            ),
        ));
    }

    Ok(())
}
