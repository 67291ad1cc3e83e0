use std::env;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_API_URL: &str = "https://api.beblocky.com";
pub const DEFAULT_DB_URL: &str = "sqlite://ide-local.sqlite3";

const API_URL_VAR: &str = "IDE_API_URL";
const DB_URL_VAR: &str = "IDE_DB_URL";
const TICK_SECS_VAR: &str = "IDE_TICK_SECS";
const FLUSH_TICKS_VAR: &str = "IDE_FLUSH_TICKS";

/// Tick and flush cadence of the time tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    pub tick: Duration,
    pub flush_every: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            flush_every: 60,
        }
    }
}

/// Runtime configuration for a synchronizer process.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub api_url: Url,
    pub db_url: String,
    pub tracker: TrackerConfig,
}

impl SyncConfig {
    /// Read configuration from `IDE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_url = parse_api_url(read(API_URL_VAR).as_deref().unwrap_or(DEFAULT_API_URL))?;
        let db_url = read(DB_URL_VAR).unwrap_or_else(|| DEFAULT_DB_URL.to_owned());

        let defaults = TrackerConfig::default();
        let tick = match read(TICK_SECS_VAR) {
            Some(value) => Duration::from_secs(u64::from(parse_positive(TICK_SECS_VAR, &value)?)),
            None => defaults.tick,
        };
        let flush_every = match read(FLUSH_TICKS_VAR) {
            Some(value) => parse_positive(FLUSH_TICKS_VAR, &value)?,
            None => defaults.flush_every,
        };

        Ok(Self {
            api_url,
            db_url,
            tracker: TrackerConfig { tick, flush_every },
        })
    }

    /// Replace the API base URL.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidApiUrl` if `url` is not an absolute
    /// http(s) URL.
    pub fn with_api_url(mut self, url: &str) -> Result<Self, ConfigError> {
        self.api_url = parse_api_url(url)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_db_url(mut self, db_url: impl Into<String>) -> Self {
        self.db_url = db_url.into();
        self
    }
}

fn parse_api_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|_| ConfigError::InvalidApiUrl(trimmed.to_owned()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::InvalidApiUrl(trimmed.to_owned()));
    }
    Ok(url)
}

fn parse_positive(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    match value.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            key,
            value: value.to_owned(),
        }),
    }
}
