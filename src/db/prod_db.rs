use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::db::sedlabanki::{
    lending_archive::LendingArchive,
    schema::{LedgerSchema, SchemaError},
};
use crate::utils::{
    lib_http::{FetchError, HttpClient},
    retry::RetryPolicy,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Http(#[from] FetchError),
}

/// Settings read from the environment, usually loaded from `.env/<env>.env`.
#[derive(Debug, Clone, PartialEq)]
pub struct LendingConfig {
    pub duckdb_path: String,
    /// `credit`, `mortgages` or a path to a JSON5 schema file.
    pub schema: String,
    pub max_lookback_months: u32,
    pub http_retry: RetryPolicy,
    pub http_timeout: Duration,
    pub run_deadline: Option<Duration>,
}

impl LendingConfig {
    pub fn from_env() -> Result<LendingConfig, ConfigError> {
        LendingConfig::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<LendingConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
            match value {
                None => Ok(default),
                Some(v) => v.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value: v,
                }),
            }
        }

        let deadline = match lookup("RUN_DEADLINE_SECS") {
            Some(v) => Some(Duration::from_secs(parse("RUN_DEADLINE_SECS", Some(v), 0u64)?)),
            None => None,
        };
        Ok(LendingConfig {
            duckdb_path: lookup("LEDGER_DUCKDB_PATH").unwrap_or_else(|| "credit.duckdb".to_string()),
            schema: lookup("LEDGER_SCHEMA").unwrap_or_else(|| "credit".to_string()),
            max_lookback_months: parse(
                "LEDGER_MAX_LOOKBACK_MONTHS",
                lookup("LEDGER_MAX_LOOKBACK_MONTHS"),
                24,
            )?,
            http_retry: RetryPolicy {
                max_attempts: parse("HTTP_MAX_ATTEMPTS", lookup("HTTP_MAX_ATTEMPTS"), 4u32)?.max(1),
                initial_wait: Duration::from_millis(parse(
                    "HTTP_INITIAL_WAIT_MS",
                    lookup("HTTP_INITIAL_WAIT_MS"),
                    500,
                )?),
            },
            http_timeout: Duration::from_secs(parse(
                "HTTP_TIMEOUT_SECS",
                lookup("HTTP_TIMEOUT_SECS"),
                60,
            )?),
            run_deadline: deadline,
        })
    }
}

pub struct ProdDb {}

impl ProdDb {
    pub fn sedlabanki_lending(config: &LendingConfig) -> Result<LendingArchive, ConfigError> {
        Ok(LendingArchive {
            duckdb_path: config.duckdb_path.clone(),
            schema: LedgerSchema::load(&config.schema)?,
            max_lookback: config.max_lookback_months,
            retry: RetryPolicy {
                max_attempts: 8,
                initial_wait: Duration::from_millis(25),
            },
        })
    }

    pub fn http_client(config: &LendingConfig) -> Result<HttpClient, ConfigError> {
        Ok(HttpClient::new(config.http_timeout, config.http_retry)?)
    }
}
