//! Configuration module for the tinyproxy check.
//!
//! Per-instance settings come from a JSON file of instance mappings; agent-level
//! settings are loaded from environment variables with sensible defaults.

use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_STAT_HOST: &str = "tinyproxy.stats";
/// Request timeout in seconds.
pub const DEFAULT_TIMEOUT: f64 = 1.0;
/// Seconds between two invocations of the same instance.
pub const DEFAULT_INTERVAL: f64 = 15.0;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Resolved parameters for one check invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckConfig {
    pub host: String,
    pub port: u16,
    /// Sent as the `Host` header to select the stats vhost.
    pub stat_host: String,
    /// Request timeout in seconds.
    pub timeout: f64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            stat_host: DEFAULT_STAT_HOST.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl CheckConfig {
    pub fn target_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout_duration(&self) -> Duration {
        timeout_duration(self.timeout)
    }
}

/// Request timeout for `secs` seconds.
///
/// Values that are not a valid duration fall back to the default timeout when
/// non-positive or NaN, and saturate when too large.
pub fn timeout_duration(secs: f64) -> Duration {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => d,
        Ok(_) if secs > 0.0 => Duration::from_nanos(1),
        Err(_) if secs > 0.0 => Duration::MAX,
        _ => Duration::from_secs_f64(DEFAULT_TIMEOUT),
    }
}

/// A numeric setting that may be written either as a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(serde_json::Number),
    Text(String),
}

impl NumberOrString {
    fn raw(&self) -> String {
        match self {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::Text(s) => s.clone(),
        }
    }
}

/// Raw instance mapping as written by the operator. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InstanceConfig {
    pub host: Option<String>,
    pub port: Option<NumberOrString>,
    pub stathost: Option<String>,
    pub timeout: Option<NumberOrString>,
}

impl InstanceConfig {
    /// Apply defaults and validate the typed values.
    pub fn resolve(&self) -> Result<CheckConfig, ConfigError> {
        let port = match &self.port {
            None => DEFAULT_PORT,
            Some(value) => parse_port(value)?,
        };

        let timeout = match &self.timeout {
            None => DEFAULT_TIMEOUT,
            Some(value) => parse_timeout(value)?,
        };

        Ok(CheckConfig {
            host: self.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            stat_host: self
                .stathost
                .clone()
                .unwrap_or_else(|| DEFAULT_STAT_HOST.to_string()),
            timeout,
        })
    }
}

fn parse_port(value: &NumberOrString) -> Result<u16, ConfigError> {
    let port = match value {
        NumberOrString::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        NumberOrString::Text(s) => s.trim().parse::<u16>().ok(),
    };

    match port {
        Some(p) if p > 0 => Ok(p),
        _ => Err(ConfigError::InvalidPort(value.raw())),
    }
}

fn parse_timeout(value: &NumberOrString) -> Result<f64, ConfigError> {
    let timeout = match value {
        NumberOrString::Number(n) => n.as_f64(),
        NumberOrString::Text(s) => s.trim().parse::<f64>().ok(),
    };

    match timeout {
        Some(t) if Duration::try_from_secs_f64(t).is_ok_and(|d| !d.is_zero()) => Ok(t),
        _ => Err(ConfigError::InvalidTimeout(value.raw())),
    }
}

/// On-disk layout of the instances file.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    min_collection_interval: Option<f64>,
    #[serde(default)]
    instances: Vec<InstanceConfig>,
}

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Time between invocations of each instance (default: 15s)
    pub interval: Duration,
    /// Run every instance once and exit
    pub run_once: bool,
    pub instances: Vec<CheckConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs_f64(DEFAULT_INTERVAL),
            run_once: false,
            instances: vec![CheckConfig::default()],
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TINYPROXY_CHECK_CONFIG`: path to the instances JSON file (default: one default instance)
    /// - `TINYPROXY_CHECK_INTERVAL`: seconds between invocations (default: 15)
    /// - `TINYPROXY_CHECK_ONCE`: run each instance a single time when `1` or `true`
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let mut interval = None;

        if let Some(path) = lookup("TINYPROXY_CHECK_CONFIG") {
            let file = read_config_file(Path::new(&path))?;
            interval = file.min_collection_interval;

            let instances = file
                .instances
                .iter()
                .map(InstanceConfig::resolve)
                .collect::<Result<Vec<_>, _>>()?;
            if instances.is_empty() {
                tracing::warn!("No instances in {}, using the default instance", path);
            } else {
                cfg.instances = instances;
            }
        }

        if let Some(secs) = lookup("TINYPROXY_CHECK_INTERVAL").and_then(|s| s.trim().parse().ok()) {
            interval = Some(secs);
        }

        if let Some(d) = interval.and_then(|s: f64| Duration::try_from_secs_f64(s).ok()) {
            if !d.is_zero() {
                cfg.interval = d;
            }
        }

        if let Some(once) = lookup("TINYPROXY_CHECK_ONCE") {
            cfg.run_once = matches!(once.trim().to_ascii_lowercase().as_str(), "1" | "true");
        }

        Ok(cfg)
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let display = path.display().to_string();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;

    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}
