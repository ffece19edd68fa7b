//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - constellation.toml (default configuration)
//! - constellation.local.toml (git-ignored local overrides)
//! - Environment variables (CONSTELLATION_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # constellation.toml
//! [optimizer]
//! max_iterations = 3
//!
//! [executor]
//! worker_threads = 8
//!
//! [compile_cache]
//! max_entries = 100
//! max_age_secs = 3600
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! CONSTELLATION_EXECUTOR__WORKER_THREADS=16
//! CONSTELLATION_LOGGING__LEVEL=debug
//! ```

use crate::executor::ExecutorConfig;
use crate::optimizer::OptimizerConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub optimizer: OptimizerSettings,

    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub compile_cache: CompileCacheSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Optimizer pass toggles and fixpoint iteration limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    #[serde(default = "default_true")]
    pub enable_folding: bool,

    #[serde(default = "default_true")]
    pub enable_cse: bool,

    #[serde(default = "default_true")]
    pub enable_dce: bool,

    /// Full-sequence repetitions before giving up on a fixpoint
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        OptimizerSettings {
            enable_folding: true,
            enable_cse: true,
            enable_dce: true,
            max_iterations: default_max_iterations(),
        }
    }
}

impl From<&OptimizerSettings> for OptimizerConfig {
    fn from(settings: &OptimizerSettings) -> Self {
        OptimizerConfig {
            enable_folding: settings.enable_folding,
            enable_cse: settings.enable_cse,
            enable_dce: settings.enable_dce,
            max_iterations: settings.max_iterations,
        }
    }
}

/// Executor worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Max concurrently firing module nodes (0 = one per CPU)
    #[serde(default)]
    pub worker_threads: usize,

    #[serde(default = "default_priority")]
    pub default_priority: u8,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        ExecutorSettings {
            worker_threads: 0,
            default_priority: default_priority(),
        }
    }
}

impl From<&ExecutorSettings> for ExecutorConfig {
    fn from(settings: &ExecutorSettings) -> Self {
        ExecutorConfig {
            worker_threads: if settings.worker_threads == 0 {
                num_cpus::get().max(2)
            } else {
                settings.worker_threads
            },
            default_priority: settings.default_priority,
        }
    }
}

/// Compilation cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileCacheSettings {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    #[serde(default = "default_cache_age")]
    pub max_age_secs: u64,
}

impl Default for CompileCacheSettings {
    fn default() -> Self {
        CompileCacheSettings {
            max_entries: default_cache_entries(),
            max_age_secs: default_cache_age(),
        }
    }
}

impl CompileCacheSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Env-filter directive, e.g. "info" or "constellation_engine=debug"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON-structured lines instead of human-readable ones
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_iterations() -> usize {
    3
}
fn default_priority() -> u8 {
    50
}
fn default_cache_entries() -> usize {
    100
}
fn default_cache_age() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load with file and environment overrides
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("constellation.toml"))
            .merge(Toml::file("constellation.local.toml"))
            .merge(Env::prefixed("CONSTELLATION_").split("__"))
            .extract()
    }
}

/// Install the global tracing subscriber per the logging config
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let result = if config.json {
        fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt().with_env_filter(filter).try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
