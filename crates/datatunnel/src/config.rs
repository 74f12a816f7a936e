//! Engine configuration
//!
//! Loaded from YAML. `${VAR}` and `${VAR:-default}` references are expanded
//! from the environment before parsing, and every field has a default, so an
//! empty file is a valid configuration.
//!
//! ```yaml
//! executor:
//!   channel_capacity: 8
//!   write_timeout_secs: 120
//! retry:
//!   max_retries: ${TUNNEL_RETRIES:-5}
//! options:
//!   unknown: warn
//! ```

use crate::error::{Result, TunnelError};
use crate::executor::ExecutorConfig;
use crate::options::UnknownOptionPolicy;
use crate::traits::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Validate)]
pub struct TunnelConfig {
    #[serde(default)]
    #[validate(nested)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub options: OptionsSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate)]
pub struct ExecutorSettings {
    /// Batches buffered between the source reader and the sink writer
    #[serde(default = "default_channel_capacity")]
    #[validate(range(min = 1, max = 4096))]
    pub channel_capacity: usize,

    #[serde(default = "default_open_timeout_secs")]
    #[validate(range(min = 1))]
    pub open_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    #[validate(range(min = 1))]
    pub write_timeout_secs: u64,

    #[serde(default = "default_commit_timeout_secs")]
    #[validate(range(min = 1))]
    pub commit_timeout_secs: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            open_timeout_secs: default_open_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            commit_timeout_secs: default_commit_timeout_secs(),
        }
    }
}

fn default_channel_capacity() -> usize {
    4
}

fn default_open_timeout_secs() -> u64 {
    30
}

fn default_write_timeout_secs() -> u64 {
    300
}

fn default_commit_timeout_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 100))]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub backoff_multiplier: f64,

    #[serde(default = "default_jitter")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct OptionsSettings {
    /// `reject` (default) or `warn`
    #[serde(default)]
    pub unknown: UnknownOptionPolicy,
}

impl TunnelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: TunnelConfig = if expanded.trim().is_empty() {
            TunnelConfig::default()
        } else {
            serde_yaml::from_str(&expanded)
                .map_err(|e| TunnelError::Config(format!("invalid config: {e}")))?
        };
        config
            .validate()
            .map_err(|e| TunnelError::Config(e.to_string()))?;
        if config.retry.max_backoff_ms < config.retry.initial_backoff_ms {
            return Err(TunnelError::Config(
                "retry.max_backoff_ms must not be smaller than retry.initial_backoff_ms".into(),
            ));
        }
        Ok(config)
    }

    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());
                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: self.retry.to_retry_config(),
            channel_capacity: self.executor.channel_capacity,
            open_timeout: Duration::from_secs(self.executor.open_timeout_secs),
            write_timeout: Duration::from_secs(self.executor.write_timeout_secs),
            commit_timeout: Duration::from_secs(self.executor.commit_timeout_secs),
        }
    }
}
