//! Service configuration
//!
//! Layers, lowest first:
//! 1. Built-in defaults
//! 2. TOML file named by `HISTORY_CONFIG` (optional)
//! 3. Environment variables
//!
//! ## Environment variables
//! - `BOOTSTRAP_SERVER`: `host:port` of an existing member (static discovery)
//! - `KUBERNETES_DNS_NAME`: headless-service name (DNS discovery)
//! - `PORT`, `PORT_AUTO_INCREMENT`, `CLUSTER_NAME_PREFIX`
//! - `WINDOW_SIZE_IN_SECONDS` (default 50), `HOPPING_SIZE_IN_SECONDS` (default 1)
//! - `ALLOWED_LATENESS_MS`, `NUM_SHARDS`, `KEY_STRATEGY`
//! - `INPUT_PATH`, `OUTPUT_PATH` (stdin/stdout when unset)
//! - `LOG_LEVEL`, `LOG_FORMAT`

use crate::aggregation::{ClosurePolicy, EngineOptions, HoppingWindowAssigner, KeyStrategy};
use crate::cluster::ClusterConfig;
use crate::error::{Error, Result};
use crate::observability::{LogConfig, LogFormat};
use crate::pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "HISTORY_CONFIG";
pub const WINDOW_SIZE_SECONDS_DEFAULT: u64 = 50;
pub const HOPPING_SIZE_SECONDS_DEFAULT: u64 = 1;

/// Serde helper for Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub window_size_seconds: u64,
    pub hopping_size_seconds: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            window_size_seconds: WINDOW_SIZE_SECONDS_DEFAULT,
            hopping_size_seconds: HOPPING_SIZE_SECONDS_DEFAULT,
        }
    }
}

impl WindowConfig {
    pub fn assigner(&self) -> Result<HoppingWindowAssigner> {
        HoppingWindowAssigner::new(
            Duration::from_secs(self.window_size_seconds),
            Duration::from_secs(self.hopping_size_seconds),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub num_shards: usize,
    pub allowed_lateness_ms: i64,
    pub closure_policy: ClosurePolicy,
    pub key_strategy: KeyStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let options = EngineOptions::default();
        EngineConfig {
            num_shards: options.num_shards,
            allowed_lateness_ms: options.allowed_lateness_ms,
            closure_policy: options.closure_policy,
            key_strategy: KeyStrategy::default(),
        }
    }
}

impl EngineConfig {
    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            num_shards: self.num_shards,
            allowed_lateness_ms: self.allowed_lateness_ms,
            closure_policy: self.closure_policy,
        }
    }
}

/// Where readings come from and results go; `None` means stdin/stdout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cluster: ClusterConfig,
    pub window: WindowConfig,
    pub engine: EngineConfig,
    pub pipeline: PipelineConfig,
    pub io: IoConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Defaults, then `HISTORY_CONFIG` file, then process environment
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::invalid_config(format!("bad config file: {}", e)))
    }

    /// Apply overrides from `lookup` (the environment in production)
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("BOOTSTRAP_SERVER") {
            self.cluster.bootstrap_address = Some(v.trim().to_string());
        }
        if let Some(v) = var("KUBERNETES_DNS_NAME") {
            self.cluster.dns_name = Some(v.trim().to_string());
        }
        if let Some(v) = var("PORT") {
            self.cluster.port = parse_value("PORT", &v)?;
        }
        if let Some(v) = var("PORT_AUTO_INCREMENT") {
            self.cluster.port_auto_increment = parse_bool("PORT_AUTO_INCREMENT", &v)?;
        }
        if let Some(v) = var("CLUSTER_NAME_PREFIX") {
            self.cluster.cluster_name_prefix = v.trim().to_string();
        }
        if let Some(v) = var("WINDOW_SIZE_IN_SECONDS") {
            self.window.window_size_seconds = parse_value("WINDOW_SIZE_IN_SECONDS", &v)?;
        }
        if let Some(v) = var("HOPPING_SIZE_IN_SECONDS") {
            self.window.hopping_size_seconds = parse_value("HOPPING_SIZE_IN_SECONDS", &v)?;
        }
        if let Some(v) = var("ALLOWED_LATENESS_MS") {
            self.engine.allowed_lateness_ms = parse_value("ALLOWED_LATENESS_MS", &v)?;
        }
        if let Some(v) = var("NUM_SHARDS") {
            self.engine.num_shards = parse_value("NUM_SHARDS", &v)?;
        }
        if let Some(v) = var("KEY_STRATEGY") {
            self.engine.key_strategy = KeyStrategy::parse(&v)?;
        }
        if let Some(v) = var("INPUT_PATH") {
            self.io.input_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = var("OUTPUT_PATH") {
            self.io.output_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log.level = v.trim().to_string();
        }
        if let Some(v) = var("LOG_FORMAT") {
            self.log.format = LogFormat::parse(&v)
                .ok_or_else(|| Error::invalid_config(format!("LOG_FORMAT: unknown format '{}'", v)))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.window.assigner()?;
        if self.engine.num_shards == 0 {
            return Err(Error::invalid_config("num_shards must be positive"));
        }
        if self.engine.allowed_lateness_ms < 0 {
            return Err(Error::invalid_config(format!(
                "allowed lateness must be non-negative, got {}",
                self.engine.allowed_lateness_ms
            )));
        }
        self.engine.key_strategy.build()?;
        self.pipeline.validate()?;
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::invalid_config(format!("{}: cannot parse '{}': {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::invalid_config(format!("{}: expected a boolean, got '{}'", key, other))),
    }
}
