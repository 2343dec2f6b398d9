use std::env;
use std::str::FromStr;
use std::time::Duration;
use reqwest::Url;
use tracing::debug;
use crate::error::ConfigError;
use crate::generator::poller::PollConfig;

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_API_PREFIX: &str = "/api";
const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 200;
const DEFAULT_HISTORY_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Service base address; relative result locators resolve against it.
    pub base_url: Url,
    pub api_prefix: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// `None` polls until a terminal status or a transport failure.
    pub max_poll_attempts: Option<u32>,
    pub history_limit: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_API_URL).expect("default API url is valid"),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_poll_attempts: Some(DEFAULT_MAX_POLL_ATTEMPTS),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl BackendConfig {
    /// Read `.env` (if present) and then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let base_url = match lookup("API_URL") {
            Some(raw) => Url::parse(raw.trim()).map_err(|_| ConfigError::Invalid {
                key: "API_URL",
                value: raw,
            })?,
            None => defaults.base_url,
        };

        let api_prefix = lookup("API_PREFIX").unwrap_or(defaults.api_prefix);

        let poll_interval_ms: u64 = parse_or(&lookup, "POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::Invalid { key: "POLL_INTERVAL_MS", value: "0".into() });
        }

        let timeout_secs: u64 = parse_or(&lookup, "REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?;
        let max_attempts: u32 = parse_or(&lookup, "MAX_POLL_ATTEMPTS", DEFAULT_MAX_POLL_ATTEMPTS)?;
        let history_limit: u32 = parse_or(&lookup, "HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?;

        Ok(Self {
            base_url,
            api_prefix,
            poll_interval: Duration::from_millis(poll_interval_ms),
            request_timeout: Duration::from_secs(timeout_secs),
            max_poll_attempts: (max_attempts > 0).then_some(max_attempts),
            history_limit,
        })
    }

    /// Full URL for a REST endpoint, e.g. `endpoint("/generate")`.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let prefix = self.api_prefix.trim_matches('/');
        let path = path.trim_start_matches('/');

        if prefix.is_empty() {
            format!("{base}/{path}")
        } else {
            format!("{base}/{prefix}/{path}")
        }
    }

    /// Absolute locators are returned as-is; relative ones are joined onto
    /// the base address.
    pub fn resolve_result(&self, reference: &str) -> Option<Url> {
        if let Ok(absolute) = Url::parse(reference) {
            return Some(absolute);
        }

        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(reference.trim_start_matches('/')).ok()
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: self.poll_interval,
            request_timeout: self.request_timeout,
            max_attempts: self.max_poll_attempts,
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}
