//! Client configuration

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use url::Url;

use ragdesk_core::{Error, Result};

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for the backend client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ClientConfig {
    /// Create configuration from environment variables; an explicit API URL
    /// replaces `RAGDESK_API_URL` before anything is validated
    pub fn from_env(api_url: Option<String>) -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok(), api_url)
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        api_url: Option<String>,
    ) -> Result<Self> {
        let api_url = api_url
            .or_else(|| lookup("RAGDESK_API_URL"))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let token = lookup("RAGDESK_TOKEN").filter(|t| !t.trim().is_empty());

        let timeout = match lookup("RAGDESK_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_number("RAGDESK_TIMEOUT_SECS", &raw)?),
            None => DEFAULT_TIMEOUT,
        };

        let poll_interval = match lookup("RAGDESK_POLL_INTERVAL_MS") {
            Some(raw) => Duration::from_millis(parse_number("RAGDESK_POLL_INTERVAL_MS", &raw)?),
            None => DEFAULT_POLL_INTERVAL,
        };

        let config = Self {
            api_url,
            token,
            timeout,
            poll_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create configuration with explicit values
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: None,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_url).map_err(|e| {
            Error::Configuration(format!("invalid RAGDESK_API_URL '{}': {}", self.api_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Configuration(format!(
                "RAGDESK_API_URL must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Configuration(
                "RAGDESK_POLL_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Join an API path onto the base URL
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{} must be a whole number, got '{}'", key, raw)))
}
