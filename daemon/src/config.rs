use crate::restart::{BackoffStrategy, RestartPolicy, DEFAULT_RESTART_DELAY};
use crate::runner::UnitSpec;
use crate::service::{ServiceKind, ServiceSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

fn default_store_path() -> PathBuf { PathBuf::from(common::DEFAULT_STORE_PATH) }
fn default_lock_timeout() -> u64 { common::DEFAULT_LOCK_TIMEOUT_SECS }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_restart_delay")]
    pub delay_secs: u64,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Absent means restart forever.
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_restart_delay() -> u64 { DEFAULT_RESTART_DELAY.as_secs() }
fn default_max_delay() -> u64 { 3600 }
fn default_stop_timeout() -> u64 { 10 }

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_restart_delay(),
            backoff: BackoffStrategy::default(),
            max_delay_secs: default_max_delay(),
            max_restarts: None,
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
    /// Captured stdout/stderr of the services; mixed into the main log when unset.
    pub service_output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
            service_output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_threads")]
    pub threads: u32,
}

fn default_threads() -> u32 { 1 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(flatten)]
    pub command: CommandConfig,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub app: Option<String>,
}

fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 5000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(flatten)]
    pub command: CommandConfig,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,
    #[serde(default)]
    pub cluster_dispatch: bool,
}

fn default_memory_gb() -> u32 { 4 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(flatten)]
    pub command: CommandConfig,
    #[serde(default)]
    pub cluster_dispatch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub web: WebConfig,
    pub search: SearchConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Extra files that must exist before anything is launched.
    #[serde(default)]
    pub prerequisites: Vec<PathBuf>,
    pub services: ServicesConfig,
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

    /// Detect file type by extension, load and validate
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        let config = match ext {
            "yaml" | "yml" => Self::from_yaml_file(path)?,
            "toml" => Self::from_toml_file(path)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format. Use .yaml, .yml, or .toml")),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for spec in self.service_specs() {
            spec.validate()?;
        }
        if self.restart.stop_timeout_secs == 0 {
            return Err(anyhow::anyhow!("restart.stop_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.store.lock_timeout_secs)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            backoff: self.restart.backoff,
            max_delay: Duration::from_secs(self.restart.max_delay_secs),
            max_restarts: self.restart.max_restarts,
            ..RestartPolicy::forever_fixed(Duration::from_secs(self.restart.delay_secs))
        }
    }

    /// The three supervised services in launch order.
    pub fn service_specs(&self) -> Vec<ServiceSpec> {
        let services = &self.services;
        vec![
            spec(
                "web",
                &services.web.command,
                ServiceKind::Web {
                    bind: services.web.bind.clone(),
                    port: services.web.port,
                    app: services.web.app.clone(),
                },
            ),
            spec(
                "search",
                &services.search.command,
                ServiceKind::SearchWorkers {
                    memory_gb: services.search.memory_gb,
                    cluster_dispatch: services.search.cluster_dispatch,
                },
            ),
            spec(
                "download",
                &services.download.command,
                ServiceKind::DownloadWorkers {
                    cluster_dispatch: services.download.cluster_dispatch,
                },
            ),
        ]
    }

    /// Everything a runner process needs, one entry per service.
    pub fn units(&self) -> Vec<UnitSpec> {
        self.service_specs()
            .into_iter()
            .map(|service| UnitSpec {
                service,
                restart: self.restart_policy(),
                stop_timeout: Duration::from_secs(self.restart.stop_timeout_secs),
                logging: self.logging.clone(),
            })
            .collect()
    }
}

fn spec(name: &str, command: &CommandConfig, kind: ServiceKind) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        program: command.program.clone(),
        args: command.args.clone(),
        working_dir: command.working_dir.clone(),
        env: command.env.clone(),
        threads: command.threads,
        kind,
    }
}
