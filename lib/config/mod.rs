use std::env;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_WAREHOUSE_MARKER: &str = "warehouse.";
pub const DEFAULT_CHUNK_SIZE: usize = 5_000;
pub const DEFAULT_CHUNK_CONCURRENCY: usize = 5;
pub const DEFAULT_MARKETING_BATCH_SIZE: usize = 1_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

/// Credentials and endpoints for the marketing-automation platform.
///
/// The App API (segment listing/creation, customer lookup) uses bearer auth; the Track API
/// (segment membership writes) uses basic auth with the site id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketingPlatformConfig {
    pub app_api_url: String,
    pub app_api_key: String,
    pub track_api_url: String,
    pub site_id: String,
    pub track_api_key: String,
    pub batch_size: usize,
    pub requests_per_second: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_url: String,
    /// `None` means warehouse-routed queries fail instead of silently hitting the store.
    pub warehouse_url: Option<String>,
    pub warehouse_marker: String,
    pub chunk_size: usize,
    pub chunk_concurrency: usize,
    pub db_pool_size: usize,
    pub marketing: Option<MarketingPlatformConfig>,
    pub sync_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_url = lookup("DATABASE_URL")
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        let warehouse_url = lookup("WAREHOUSE_URL").filter(|value| !value.trim().is_empty());
        let warehouse_marker = lookup("WAREHOUSE_QUERY_MARKER")
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_WAREHOUSE_MARKER.to_string());

        let chunk_size = parse_positive(&lookup, "SYNC_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let chunk_concurrency =
            parse_positive(&lookup, "SYNC_CHUNK_CONCURRENCY", DEFAULT_CHUNK_CONCURRENCY)?;
        let db_pool_size = parse_positive(&lookup, "DB_POOL_SIZE", 16usize)?;
        let sync_interval_secs = parse_positive(&lookup, "SYNC_INTERVAL_SECS", 60u64)?;

        let marketing = match (
            lookup("MARKETING_APP_API_URL"),
            lookup("MARKETING_APP_API_KEY"),
            lookup("MARKETING_TRACK_API_URL"),
            lookup("MARKETING_SITE_ID"),
            lookup("MARKETING_TRACK_API_KEY"),
        ) {
            (
                Some(app_api_url),
                Some(app_api_key),
                Some(track_api_url),
                Some(site_id),
                Some(track_api_key),
            ) => Some(MarketingPlatformConfig {
                app_api_url: app_api_url.trim_end_matches('/').to_string(),
                app_api_key,
                track_api_url: track_api_url.trim_end_matches('/').to_string(),
                site_id,
                track_api_key,
                batch_size: parse_positive(
                    &lookup,
                    "MARKETING_BATCH_SIZE",
                    DEFAULT_MARKETING_BATCH_SIZE,
                )?,
                requests_per_second: parse_positive(&lookup, "MARKETING_RPS", 10u32)?,
            }),
            _ => None,
        };

        Ok(Self {
            db_url,
            warehouse_url,
            warehouse_marker,
            chunk_size,
            chunk_concurrency,
            db_pool_size,
            marketing,
            sync_interval_secs,
        })
    }
}

fn parse_positive<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value > T::default() => Ok(value),
            _ => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw,
            }),
        },
    }
}
