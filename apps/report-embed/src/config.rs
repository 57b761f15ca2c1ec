use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::adapter::{DisplayOptions, Permissions};
use crate::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use crate::token::DEFAULT_SAFETY_MARGIN;
use crate::token::provider::DEFAULT_FETCH_TIMEOUT;
use crate::url_check::DEFAULT_HOST_SUFFIX;

pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a whole number of milliseconds (got {value:?})")]
    InvalidDuration { name: &'static str, value: String },
    #[error("{name} must be a non-negative integer (got {value:?})")]
    InvalidNumber { name: &'static str, value: String },
}

/// Every tunable the coordinator and the token client read.
#[derive(Debug, Clone)]
pub struct EmbedSettings {
    pub token_base_url: Option<String>,
    pub token_bearer: Option<String>,
    pub fetch_timeout: Duration,
    pub render_timeout: Duration,
    pub retry: RetryPolicy,
    pub settle_delay: Duration,
    pub safety_margin: Duration,
    pub expected_host_suffix: String,
    pub permissions: Permissions,
    pub display_options: DisplayOptions,
}

impl Default for EmbedSettings {
    fn default() -> Self {
        Self {
            token_base_url: None,
            token_bearer: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            render_timeout: DEFAULT_RENDER_TIMEOUT,
            retry: RetryPolicy::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS),
            settle_delay: DEFAULT_SETTLE_DELAY,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            expected_host_suffix: DEFAULT_HOST_SUFFIX.to_string(),
            permissions: Permissions::default(),
            display_options: DisplayOptions::default(),
        }
    }
}

impl EmbedSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`EmbedSettings::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut settings = Self::default();

        settings.token_base_url = read("REPORT_EMBED_TOKEN_BASE");
        settings.token_bearer = read("REPORT_EMBED_TOKEN_BEARER");
        if let Some(value) = read("REPORT_EMBED_FETCH_TIMEOUT_MS") {
            settings.fetch_timeout = parse_millis("REPORT_EMBED_FETCH_TIMEOUT_MS", value)?;
        }
        if let Some(value) = read("REPORT_EMBED_RENDER_TIMEOUT_MS") {
            settings.render_timeout = parse_millis("REPORT_EMBED_RENDER_TIMEOUT_MS", value)?;
        }
        if let Some(value) = read("REPORT_EMBED_RETRY_BASE_MS") {
            settings.retry.base_delay = parse_millis("REPORT_EMBED_RETRY_BASE_MS", value)?;
        }
        if let Some(value) = read("REPORT_EMBED_MAX_ATTEMPTS") {
            settings.retry.max_attempts = value
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidNumber {
                    name: "REPORT_EMBED_MAX_ATTEMPTS",
                    value,
                })?;
        }
        if let Some(value) = read("REPORT_EMBED_SETTLE_MS") {
            settings.settle_delay = parse_millis("REPORT_EMBED_SETTLE_MS", value)?;
        }
        if let Some(value) = read("REPORT_EMBED_SAFETY_MARGIN_MS") {
            settings.safety_margin = parse_millis("REPORT_EMBED_SAFETY_MARGIN_MS", value)?;
        }
        if let Some(value) = read("REPORT_EMBED_HOST_SUFFIX") {
            settings.expected_host_suffix = value;
        }
        Ok(settings)
    }
}

fn parse_millis(name: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidDuration { name, value })
}
