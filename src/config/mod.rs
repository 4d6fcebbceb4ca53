use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::services::gemini::DEFAULT_API_BASE;
use crate::services::processor::RetryPolicy;
use crate::services::rate_governor::RateLimit;
use crate::services::scheduler::SchedulerConfig;

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the batch binary.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// Gemini API key
    #[garde(length(min = 1))]
    pub gemini_api_key: String,

    /// Model used for background replacement, retouch and hero renders
    #[serde(default = "default_image_model")]
    #[garde(length(min = 1))]
    pub gemini_model: String,

    /// Model used for descriptive naming
    #[serde(default = "default_text_model")]
    #[garde(length(min = 1))]
    pub gemini_text_model: String,

    #[serde(default = "default_api_base")]
    #[garde(length(min = 1))]
    pub gemini_api_base: String,

    /// Generation calls allowed per sliding minute
    #[serde(default = "default_max_requests_per_minute")]
    #[garde(range(min = 1, max = 600))]
    pub max_requests_per_minute: u32,

    /// Items processed at once
    #[serde(default = "default_max_concurrency")]
    #[garde(range(min = 1, max = 32))]
    pub max_concurrency: usize,

    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1, max = 50))]
    pub max_attempts: u32,

    /// Label new items with a short description on submission
    #[serde(default = "default_describe_items")]
    #[garde(skip)]
    pub describe_items: bool,

    /// Seconds an idle or cancelled batch stays queryable before eviction
    #[serde(default = "default_batch_retention_secs")]
    #[garde(range(min = 1, max = 604_800))]
    pub batch_retention_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

fn default_text_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_max_requests_per_minute() -> u32 {
    15
}

fn default_max_concurrency() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    10
}

fn default_describe_items() -> bool {
    true
}

fn default_batch_retention_secs() -> u64 {
    3600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit key/value pairs (upper-case env names).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    /// Core tunables; timing constants not exposed here keep their defaults.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.max_concurrency,
            rate_limit: RateLimit::per_minute(self.max_requests_per_minute),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            describe_items: self.describe_items,
            ..SchedulerConfig::default()
        }
    }

    pub fn batch_retention(&self) -> Duration {
        Duration::from_secs(self.batch_retention_secs)
    }

    /// Spacing between generation calls implied by the per-minute limit.
    pub fn min_spacing(&self) -> Duration {
        RateLimit::per_minute(self.max_requests_per_minute).min_spacing
    }
}
