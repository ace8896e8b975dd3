//! Configuration loading for the HTTP poller connector

use danube_poller_core::{ConnectorResult, PollerConfig};
use std::env;

/// Config file used when `CONFIG_FILE` is not set
pub const DEFAULT_CONFIG_FILE: &str = "config/connector.toml";

/// Load the connector configuration.
///
/// Priority: TOML file (`CONFIG_FILE`, default `config/connector.toml`) →
/// environment variable overrides. The result is validated.
///
/// # Example
///
/// ```toml
/// connector_name = "http-poller"
///
/// [broker]
/// brokers = ["http://localhost:6650"]
///
/// [[sources]]
/// name = "contacts"
/// type = "rest"
/// base_url = "https://api.example.com"
/// interval_ms = 60000
/// ```
pub fn load() -> ConnectorResult<PollerConfig> {
    let path = env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    load_from(&path)
}

pub fn load_from(path: &str) -> ConnectorResult<PollerConfig> {
    let mut config = PollerConfig::from_file(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
