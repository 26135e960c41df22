//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        "Configuration loaded: {} tunnels, unmatched_direct={}",
        config.tunnels.len(),
        config.policy.unmatched_direct
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUNNEL_ROUTER_IDLE_TIMEOUT_SECS`: Override the idle teardown period
/// - `TUNNEL_ROUTER_ESTABLISH_TIMEOUT_SECS`: Override the establishment timeout
/// - `TUNNEL_ROUTER_GLOBAL_BUFFER_BYTES`: Override the global JIT byte budget
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(secs) = std::env::var("TUNNEL_ROUTER_IDLE_TIMEOUT_SECS") {
        config.jit.idle_timeout_secs = secs.parse().map_err(|_| ConfigError::EnvError {
            name: "TUNNEL_ROUTER_IDLE_TIMEOUT_SECS".into(),
            reason: format!("Invalid number: {secs}"),
        })?;
        debug!(
            "Idle timeout overridden to {}s",
            config.jit.idle_timeout_secs
        );
    }

    if let Ok(secs) = std::env::var("TUNNEL_ROUTER_ESTABLISH_TIMEOUT_SECS") {
        config.jit.establish_timeout_secs = secs.parse().map_err(|_| ConfigError::EnvError {
            name: "TUNNEL_ROUTER_ESTABLISH_TIMEOUT_SECS".into(),
            reason: format!("Invalid number: {secs}"),
        })?;
        debug!(
            "Establishment timeout overridden to {}s",
            config.jit.establish_timeout_secs
        );
    }

    if let Ok(bytes) = std::env::var("TUNNEL_ROUTER_GLOBAL_BUFFER_BYTES") {
        config.jit.global_max_bytes = bytes.parse().map_err(|_| ConfigError::EnvError {
            name: "TUNNEL_ROUTER_GLOBAL_BUFFER_BYTES".into(),
            reason: format!("Invalid number: {bytes}"),
        })?;
        debug!(
            "Global buffer budget overridden to {} bytes",
            config.jit.global_max_bytes
        );
    }

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
