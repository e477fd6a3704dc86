// src/config.rs
use std::{env, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::info;

use crate::rate_limit::RatePolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Knobs of the voting core, independent of where the stores live.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on any single ledger, counter or cache call.
    pub store_timeout: Duration,
    pub results_cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub vote_policy: RatePolicy,
    pub poll_policy: RatePolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            results_cache_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(300),
            vote_policy: RatePolicy::new(10, Duration::from_secs(60)),
            poll_policy: RatePolicy::new(5, Duration::from_secs(60 * 60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub redis_url: String,
    pub cors_origin: Option<String>,
    pub engine: EngineSettings,
}

impl EngineSettings {
    /// Zero durations are rejected: a zero sweep period panics the ticker and
    /// a zero TTL or timeout makes every store call fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("STORE_TIMEOUT_MS", self.store_timeout),
            ("RESULTS_CACHE_TTL_SECS", self.results_cache_ttl),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval),
        ];

        for (key, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: try_load("PORT", "3030")?,
            database_url: env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            db_max_connections: try_load("DB_MAX_CONNECTIONS", "5")?,
            redis_url: try_load("REDIS_URL", "redis://127.0.0.1:6379")?,
            cors_origin: env::var("CORS_ORIGIN").ok(),
            engine: EngineSettings {
                store_timeout: Duration::from_millis(try_load("STORE_TIMEOUT_MS", "2000")?),
                results_cache_ttl: Duration::from_secs(try_load("RESULTS_CACHE_TTL_SECS", "30")?),
                sweep_interval: Duration::from_secs(try_load("SWEEP_INTERVAL_SECS", "300")?),
                vote_policy: try_load("VOTE_RATE_LIMIT", "10/m")?,
                poll_policy: try_load("POLL_RATE_LIMIT", "5/h")?,
            },
        };

        config.engine.validate()?;
        Ok(config)
    }
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let value = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}
