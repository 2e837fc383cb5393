//! Config file discovery and layered loading.
//!
//! Implements the `CaptureConfig::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `~/.changewatch/config.toml` (user)
//! 3. Merge the explicit config file, if any
//! 4. Apply env var fallbacks for fields no file set
//! 5. Deserialize merged tree → `CaptureConfig`
//! 6. Validate
//!
//! String values are taken literally; `${...}` inside a connection URI is
//! not expanded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, deep_merge_tracking, record_leaves};
use crate::types::CaptureConfig;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Load the configuration with layered file precedence.
///
/// `explicit` is a config file named by the caller; it must exist.
/// `home_override` replaces the user's home directory for discovery of
/// `~/.changewatch/config.toml` (used by tests).
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is missing (explicit
/// file only), malformed, or if the merged configuration fails
/// validation.
pub fn load(explicit: Option<&Path>, home_override: Option<&Path>) -> ConfigResult<CaptureConfig> {
    let home_dir = match home_override {
        Some(h) => h.to_path_buf(),
        None => home_directory()?,
    };
    load_layers(explicit, Some(&home_dir), &collect_env_vars())
}

/// Load from an explicit set of layers and environment.
///
/// # Errors
///
/// See [`load`].
pub fn load_layers<S: ::std::hash::BuildHasher>(
    explicit: Option<&Path>,
    home_dir: Option<&Path>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<CaptureConfig> {
    let (mut merged, mut field_sources) = defaults()?;

    // User config.
    if let Some(home) = home_dir {
        let user_path = home.join(".changewatch").join("config.toml");
        if let Some(overlay) = try_load_file(&user_path)? {
            deep_merge_tracking(
                &mut merged,
                &overlay,
                "",
                &ConfigLayer::User,
                &mut field_sources,
            );
            info!(path = %user_path.display(), "loaded user config");
        }
    }

    // Explicit config file.
    if let Some(path) = explicit {
        let overlay = read_file(path)?;
        deep_merge_tracking(
            &mut merged,
            &overlay,
            "",
            &ConfigLayer::File,
            &mut field_sources,
        );
        info!(path = %path.display(), "loaded config file");
    }

    let env_count = apply_env_fallbacks(&mut merged, &mut field_sources, env_vars);
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    finish(merged, "<merged config>")
}

/// Load a config from a single file layered over the defaults only.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed, or the
/// result fails validation.
pub fn load_file(path: &Path) -> ConfigResult<CaptureConfig> {
    let (mut merged, mut sources) = defaults()?;
    let overlay = read_file(path)?;
    deep_merge_tracking(&mut merged, &overlay, "", &ConfigLayer::File, &mut sources);
    finish(merged, &path.display().to_string())
}

/// Load a config from a TOML string layered over the defaults only.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the string cannot be parsed or the result
/// fails validation.
pub fn load_str(content: &str) -> ConfigResult<CaptureConfig> {
    let (mut merged, mut sources) = defaults()?;
    let overlay = parse(content, "<string>")?;
    deep_merge_tracking(&mut merged, &overlay, "", &ConfigLayer::File, &mut sources);
    finish(merged, "<string>")
}

fn defaults() -> ConfigResult<(toml::Value, FieldSources)> {
    let merged = parse(DEFAULTS_TOML, "<embedded defaults>")?;
    let mut sources = FieldSources::new();
    record_leaves(&merged, "", &ConfigLayer::Defaults, &mut sources);
    Ok((merged, sources))
}

fn finish(merged: toml::Value, origin: &str) -> ConfigResult<CaptureConfig> {
    let config: CaptureConfig =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: origin.to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;
    Ok(config)
}

fn parse(content: &str, origin: &str) -> ConfigResult<toml::Value> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: origin.to_owned(),
        source: e,
    })
}

/// Read a file that must exist.
fn read_file(path: &Path) -> ConfigResult<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    check_size(path, &content)?;
    parse(&content, &path.display().to_string())
}

/// Try to load a file, returning `None` if the file doesn't exist.
///
/// Uses a single read operation to avoid TOCTOU races.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    check_size(path, &content)?;
    parse(&content, &path.display().to_string()).map(Some)
}

fn check_size(path: &Path, content: &str) -> ConfigResult<()> {
    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }
    Ok(())
}

/// Determine the user's home directory.
fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}
