// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Structs used to configure a replay run.
//!
//! Tuning knobs live in an optional YAML file (typically instantiated using `serde_yaml`); the
//! per-run settings (target, input, output, timeouts) come from the command line. Both are folded
//! into a [`ReplayOptions`] before anything is read or sent.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::constants::{
    DEFAULT_INPUT_BATCH_SIZE, DEFAULT_LOG_LEVEL, DEFAULT_MAX_CONCURRENT_REQUESTS,
    DEFAULT_MAX_LIVE_CONNECTIONS, DEFAULT_REQUEST_TIMEOUT,
};
use crate::errors::{Error, Result};
use crate::replay::tls::TlsMode;

const DEFAULT_CONFIG_STR: &str = include_str!("../etc/example-config.yml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub accumulator: AccumulatorSettings,
    #[serde(default)]
    pub replay: ReplaySettings,
    #[serde(default)]
    pub input: InputSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulatorSettings {
    /// 0 disables the limit.
    #[serde(default = "default_max_live_connections")]
    pub max_live_connections: usize,
}

impl Default for AccumulatorSettings {
    fn default() -> Self {
        Self {
            max_live_connections: default_max_live_connections(),
        }
    }
}

fn default_max_live_connections() -> usize {
    DEFAULT_MAX_LIVE_CONNECTIONS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySettings {
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

fn default_request_timeout() -> String {
    DEFAULT_REQUEST_TIMEOUT.to_string()
}

fn default_max_concurrent_requests() -> usize {
    DEFAULT_MAX_CONCURRENT_REQUESTS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Recompute per-connection progress metadata for captures recorded without it.
    #[serde(default)]
    pub annotate_progress: bool,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            annotate_progress: false,
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_INPUT_BATCH_SIZE
}

impl Config {
    pub fn from_yaml_str(s: &str) -> std::result::Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml_str(&contents),
            Err(e) => {
                warn!("could not open config ({e}), using default config");
                Self::from_yaml_str(DEFAULT_CONFIG_STR)
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if let Err(e) = parse_duration(&self.replay.request_timeout) {
            return Err(ConfigError::Invalid(format!("Invalid request timeout: {e}")));
        }
        if self.replay.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.input.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn get_request_timeout(&self) -> std::result::Result<Duration, ConfigError> {
        parse_duration(&self.replay.request_timeout)
            .map_err(|e| ConfigError::Invalid(format!("Failed to parse request timeout: {e}")))
    }
}

/// Parses durations such as `250ms`, `30s`, `2h` or `1d`.
pub fn parse_duration(duration_str: &str) -> std::result::Result<Duration, ConfigError> {
    // "ms" must be tried before "s"
    const UNITS: [(&str, &str, u64); 4] = [
        ("ms", "milliseconds", 1),
        ("s", "seconds", 1_000),
        ("h", "hours", 3_600_000),
        ("d", "days", 86_400_000),
    ];
    let s = duration_str.trim();
    let Some((value, unit, millis_per_unit)) = UNITS
        .iter()
        .find_map(|(suffix, unit, scale)| s.strip_suffix(*suffix).map(|v| (v, *unit, *scale)))
    else {
        return Err(ConfigError::Invalid(format!(
            "invalid suffix in duration: {duration_str}"
        )));
    };
    let count = value
        .parse::<u64>()
        .map_err(|e| ConfigError::Invalid(format!("Invalid {unit} value: {e}")))?;
    let millis = count.checked_mul(millis_per_unit).ok_or_else(|| {
        ConfigError::Invalid(format!("duration out of range: {duration_str}"))
    })?;
    Ok(Duration::from_millis(millis))
}

/// Parses and checks the replay target. Only `http` and `https` with a resolvable port are accepted.
pub fn parse_target(target: &str) -> Result<Url> {
    let url = Url::parse(target)?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::InvalidTarget(format!(
                "scheme must be http or https, got {other}: {target}"
            )))
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidTarget(format!("hostname not present: {target}")));
    }
    if url.port_or_known_default().is_none() {
        return Err(Error::InvalidTarget(format!("port not present: {target}")));
    }
    Ok(url)
}

/// Everything a replay run needs, resolved from the command line and the config file.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub target: Url,
    pub tls_mode: TlsMode,
    pub authorization: Option<String>,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub inactivity_timeout: Duration,
    pub max_live_connections: usize,
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub batch_size: usize,
    pub annotate_progress: bool,
}

impl ReplayOptions {
    pub fn new(target: &str, config: &Config) -> Result<Self> {
        Ok(Self {
            target: parse_target(target)?,
            tls_mode: TlsMode::Verify,
            authorization: None,
            input: None,
            output: None,
            inactivity_timeout: Duration::from_secs(crate::constants::DEFAULT_PACKET_TIMEOUT_SECS),
            max_live_connections: config.accumulator.max_live_connections,
            request_timeout: config.get_request_timeout()?,
            max_concurrent_requests: config.replay.max_concurrent_requests,
            batch_size: config.input.batch_size,
            annotate_progress: config.input.annotate_progress,
        })
    }
}
