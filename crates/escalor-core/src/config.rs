use crate::tier::{TierCatalog, TierSpec};
use crate::{EscalorError, EscalorResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration, normally loaded from `escalor.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Directory holding all durable state (queue, cache, quota, events,
    /// workflow runs).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Tier used for `run` when no classifier is configured and no explicit
    /// override is given.
    #[serde(default)]
    pub default_tier: Option<String>,
    /// External classifier command. When set, `run` routes through it unless
    /// overridden.
    #[serde(default)]
    pub classifier: Option<ClassifierConfig>,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Lifetime of cached results in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// The executor tiers, cheapest first by convention.
    pub tiers: Vec<TierSpec>,
}

/// External classification command configuration.
///
/// The command is spawned with the request appended as the final argument
/// and must print a JSON decision (`{"tier", "confidence", "rationale"}`)
/// on stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    pub command: Vec<String>,
}

/// Quota window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Window length in seconds. Windows are aligned to wall-clock
    /// multiples of this value, so 86400 means daily windows at midnight
    /// UTC.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
        }
    }
}

/// Configures retry behaviour for failed execution attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries on the admitted tier before escalating.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_window_secs() -> u64 {
    86_400
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> EscalorResult<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| EscalorError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> EscalorResult<()> {
        let catalog = self.catalog()?;
        if let Some(default) = &self.default_tier {
            if catalog.get(default).is_none() {
                return Err(EscalorError::Config(format!(
                    "default_tier '{default}' is not a configured tier"
                )));
            }
        }
        if let Some(classifier) = &self.classifier {
            if classifier.command.is_empty() {
                return Err(EscalorError::Config(
                    "classifier command is empty".to_string(),
                ));
            }
        }
        if self.quota.window_secs == 0 {
            return Err(EscalorError::Config(
                "quota window_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the validated tier catalog from this configuration.
    pub fn catalog(&self) -> EscalorResult<TierCatalog> {
        TierCatalog::new(self.tiers.clone())
    }
}
