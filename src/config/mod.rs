//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The store URL is wrapped in secrecy::SecretString because it
//! usually carries credentials.

use std::time::Duration;

use crate::communicator::CommunicatorConfig;
use crate::error::{Error, Result};
use secrecy::SecretString;

/// Default heartbeat and reaper period, in seconds.
pub const DEFAULT_REFRESH_PERIOD_SECS: u64 = 30;

#[derive(Debug)]
pub struct Config {
    /// Store connection (host, port, credentials, database).
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Heartbeat and reaper interval.
    pub refresh_period: Duration,
    /// Spin up the stale-lease reaper alongside the communicator.
    pub enable_reaper: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let refresh_secs = match std::env::var("LEASEQ_REFRESH_PERIOD_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                Error::Config(format!("LEASEQ_REFRESH_PERIOD_SECS must be an integer, got {raw:?}"))
            })?,
            Err(_) => DEFAULT_REFRESH_PERIOD_SECS,
        };
        if refresh_secs == 0 {
            return Err(Error::Config(
                "LEASEQ_REFRESH_PERIOD_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            refresh_period: Duration::from_secs(refresh_secs),
            enable_reaper: parse_flag("LEASEQ_ENABLE_REAPER")?,
        })
    }

    /// Communicator settings derived from this configuration.
    pub fn communicator_config(&self) -> CommunicatorConfig {
        CommunicatorConfig::default()
            .with_refresh_period(self.refresh_period)
            .with_reaper(self.enable_reaper)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parse_flag(name: &str) -> Result<bool> {
    match std::env::var(name) {
        Err(_) => Ok(false),
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(Error::Config(format!("{name} must be a boolean, got {raw:?}"))),
        },
    }
}
