// Runtime configuration for the timeline-sync binary, read from the environment.

use chrono::Duration;
use std::env;
use std::str::FromStr;
use thiserror::Error;

use crate::models::{AccountKey, FeedKind};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone)]
pub struct TimelineConfig {
    pub instance_url: String,
    pub access_token: String,
    pub account: AccountKey,
    pub database_path: String,
    pub feed: FeedKind,
    pub page_limit: usize,
    pub retention: Duration,
    pub fetch_timeout: std::time::Duration,
    pub bottom_pages: usize,
}

impl TimelineConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::Missing(key.to_string()))
        };
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let feed_key = or_default("FEED", "home");
        let feed = FeedKind::parse(&feed_key).ok_or_else(|| ConfigError::Invalid {
            key: "FEED".to_string(),
            value: feed_key.clone(),
        })?;

        let page_limit: usize = parse("PAGE_LIMIT", or_default("PAGE_LIMIT", "30"))?;
        if page_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "PAGE_LIMIT".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(Self {
            instance_url: required("INSTANCE_URL")?,
            access_token: required("ACCESS_TOKEN")?,
            account: AccountKey::new(or_default("ACCOUNT_ID", "default")),
            database_path: or_default("DATABASE_PATH", "timeline.db"),
            feed,
            page_limit,
            retention: Duration::days(parse(
                "CACHE_RETENTION_DAYS",
                or_default("CACHE_RETENTION_DAYS", "14"),
            )?),
            fetch_timeout: std::time::Duration::from_secs(parse(
                "FETCH_TIMEOUT_SECS",
                or_default("FETCH_TIMEOUT_SECS", "10"),
            )?),
            bottom_pages: parse("BOTTOM_PAGES", or_default("BOTTOM_PAGES", "0"))?,
        })
    }
}

fn parse<V: FromStr>(key: &str, value: String) -> ConfigResult<V> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value,
    })
}
