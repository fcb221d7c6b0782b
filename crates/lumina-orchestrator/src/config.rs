//! Configuration file support.
//!
//! A single TOML file describes the generation provider, the credential list
//! with their quota tiers, upload behaviour, job retention and logging.

use std::path::Path;
use std::time::Duration;

use lumina_models::gemini::{DEFAULT_BASE_URL, DEFAULT_IMAGE_MODEL};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Quota class of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaTier {
    /// Paid tier.
    High,
    /// Free tier.
    Low,
}

impl QuotaTier {
    /// Requests per window granted by this tier when not overridden.
    #[must_use]
    pub const fn default_ceiling(self) -> u32 {
        match self {
            Self::High => 10,
            Self::Low => 2,
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for QuotaTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One credential entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Identifier used in logs and results (never the secret itself)
    pub id: String,

    /// Quota tier
    pub tier: QuotaTier,

    /// Inline API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Ceiling override; defaults to the tier's ceiling
    #[serde(default)]
    pub requests_per_window: Option<u32>,
}

impl CredentialConfig {
    /// Creates an entry with an inline key.
    pub fn inline(id: impl Into<String>, tier: QuotaTier, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier,
            api_key: Some(api_key.into()),
            api_key_env: None,
            requests_per_window: None,
        }
    }

    /// Overrides the ceiling.
    #[must_use]
    pub fn with_ceiling(mut self, requests_per_window: u32) -> Self {
        self.requests_per_window = Some(requests_per_window);
        self
    }

    /// Effective requests-per-window ceiling.
    pub fn ceiling(&self) -> u32 {
        self.requests_per_window.unwrap_or_else(|| self.tier.default_ceiling())
    }

    /// Resolves the secret from `api_key` or the `api_key_env` variable.
    pub fn resolve(&self) -> ConfigResult<String> {
        let key = match (&self.api_key, &self.api_key_env) {
            (Some(key), _) => key.clone(),
            (None, Some(var)) => std::env::var(var).map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "credential '{}': environment variable {} is not set",
                    self.id, var
                ))
            })?,
            (None, None) => {
                return Err(ConfigError::InvalidValue(format!(
                    "credential '{}': neither api_key nor api_key_env given",
                    self.id
                )));
            }
        };

        if key.trim().is_empty() {
            return Err(ConfigError::InvalidValue(format!("credential '{}': key is blank", self.id)));
        }
        Ok(key)
    }
}

/// Generation provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Model identifier
    pub model: String,
    /// API base URL
    pub base_url: String,
    /// Variants generated per catalog item
    pub images_per_item: usize,
    /// Per-request client timeout in seconds
    pub request_timeout_secs: u64,
    /// Reference download timeout in seconds
    pub download_timeout_secs: u64,
    /// Extra sleep after a quota-exceeded signal, in seconds
    pub quota_backoff_secs: u64,
    /// Sampling temperature
    pub temperature: f32,
    /// Scheduler-level retries for transient failures
    pub max_retries: u32,
    /// First retry delay in milliseconds
    pub retry_base_delay_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_IMAGE_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            images_per_item: 2,
            request_timeout_secs: 120,
            download_timeout_secs: 30,
            quota_backoff_secs: 10,
            temperature: 0.7,
            max_retries: 0,
            retry_base_delay_ms: 1000,
        }
    }
}

impl GenerationConfig {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reference download timeout.
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Quota backoff.
    pub fn quota_backoff(&self) -> Duration {
        Duration::from_secs(self.quota_backoff_secs)
    }
}

/// Rate-limit window settings shared by all credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Quota window in seconds
    pub window_secs: u64,
    /// Margin added to every minimum interval, in milliseconds
    pub safety_margin_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { window_secs: 60, safety_margin_ms: 1000 }
    }
}

impl LimitsConfig {
    /// Quota window.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Safety margin.
    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }
}

/// Upload pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Concurrent uploads
    pub max_concurrent: usize,
    /// Retries per upload after the first attempt
    pub max_retries: u32,
    /// Backoff base in milliseconds
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds
    pub backoff_max_ms: u64,
    /// Tag added to items once enhanced
    pub enhanced_tag: String,
    /// Delete an item's previous images after a successful upload
    pub delete_existing_images: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            enhanced_tag: "ai-enhanced".to_string(),
            delete_existing_images: true,
        }
    }
}

/// Job registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Seconds a finished job is retained
    pub ttl_secs: u64,
    /// Finished jobs retained at most
    pub max_retained: usize,
    /// Stop-flag poll interval in milliseconds
    pub stop_poll_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600, max_retained: 64, stop_poll_interval_ms: 500 }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LuminaConfig {
    /// Generation provider
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Rate-limit window
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Credentials, one worker each
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,

    /// Upload pipeline
    #[serde(default)]
    pub upload: UploadConfig,

    /// Job registry
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LuminaConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        Self::from_toml_str(&content)
            .map_err(|e| match e {
                ConfigError::ParseError(msg) => {
                    ConfigError::ParseError(format!("{}: {}", path.display(), msg))
                }
                other => other,
            })
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the pipeline meaningless.
    ///
    /// Individual credentials are not validated here; a bad credential is
    /// dropped when the pool is built.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.generation.images_per_item == 0 {
            return Err(ConfigError::InvalidValue(
                "generation.images_per_item must be at least 1".to_string(),
            ));
        }
        if self.limits.window_secs == 0 {
            return Err(ConfigError::InvalidValue("limits.window_secs must be positive".to_string()));
        }
        if self.upload.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue(
                "upload.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.jobs.stop_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "jobs.stop_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
