use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

fn default_socket_path() -> PathBuf { PathBuf::from(common::DEFAULT_SOCKET_PATH) }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default = "default_list_path")]
    pub list_path: String,
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String { "http://127.0.0.1:54321/functions/v1".to_string() }
fn default_status_path() -> String { "get-job-status".to_string() }
fn default_list_path() -> String { "list-jobs".to_string() }
fn default_request_timeout() -> u64 { 10 }

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            status_path: default_status_path(),
            list_path: default_list_path(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_first_check")]
    pub first_check_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_first_check() -> u64 { 1 }
fn default_poll_interval() -> u64 { 10 }
fn default_stale_after() -> u64 { 15 }
fn default_event_buffer() -> usize { 64 }

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            first_check_secs: default_first_check(),
            poll_interval_secs: default_poll_interval(),
            stale_after_secs: default_stale_after(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_max_queued")]
    pub max_queued_min: i64,
    #[serde(default = "default_max_processing")]
    pub max_processing_min: i64,
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

fn default_max_queued() -> i64 { crate::audit::DEFAULT_MAX_QUEUED_MIN }
fn default_max_processing() -> i64 { crate::audit::DEFAULT_MAX_PROCESSING_MIN }
fn default_list_limit() -> usize { crate::audit::DEFAULT_LIST_LIMIT }

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_queued_min: default_max_queued(),
            max_processing_min: default_max_processing(),
            list_limit: default_list_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        }
    }

    /// Resolve the config to use at startup.
    ///
    /// An explicit path must load. The default path is optional: when it
    /// does not exist, defaults apply. `JOBWATCH_API_KEY` and `JOBWATCH_LOG`
    /// override the file.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = std::env::var("JOBWATCH_CONFIG")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(common::DEFAULT_CONFIG_PATH));
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Config::default()
                }
            }
        };

        if let Ok(key) = std::env::var("JOBWATCH_API_KEY") {
            config.upstream.api_key = Some(key);
        }
        if let Ok(log_file) = std::env::var("JOBWATCH_LOG") {
            config.logging.output = Some(PathBuf::from(log_file));
        }

        Ok(config)
    }
}
