//! Environment-variable configuration, grounded on `packages/server/src/config.rs`'s
//! `dotenvy` + `anyhow::Context` idiom.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::error::SchedulerError;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// `0` means unlimited.
    pub max_jobs: u32,
    pub db_type: String,
    pub db_connection_string: String,
    pub db_name: String,
    pub messagebus_type: String,
    pub messagebus_connection_string: String,
    pub cleanup_interval: Duration,
    pub cache_refresh_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Advisory; consumed only by the out-of-scope HTTP control plane.
    pub api_url: Option<String>,
    pub hostname: String,
}

const SUPPORTED_DB_TYPES: &[&str] = &["postgres"];
const SUPPORTED_MESSAGEBUS_TYPES: &[&str] = &["nats"];

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let db_type = env::var("DB_TYPE").context("DB_TYPE must be set")?;
        if !SUPPORTED_DB_TYPES.contains(&db_type.as_str()) {
            return Err(SchedulerError::Unsupported {
                field: "DB_TYPE",
                value: db_type,
            }
            .into());
        }

        let messagebus_type = env::var("MESSAGEBUS_TYPE").context("MESSAGEBUS_TYPE must be set")?;
        if !SUPPORTED_MESSAGEBUS_TYPES.contains(&messagebus_type.as_str()) {
            return Err(SchedulerError::Unsupported {
                field: "MESSAGEBUS_TYPE",
                value: messagebus_type,
            }
            .into());
        }

        let hostname = match env::var("HOSTNAME") {
            Ok(h) if !h.is_empty() => h,
            _ => hostname::get()
                .context("failed to resolve OS hostname")?
                .to_string_lossy()
                .into_owned(),
        };

        Ok(Self {
            max_jobs: env::var("MAX_JOBS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("MAX_JOBS must be a non-negative integer")?,
            db_type,
            db_connection_string: env::var("DB_CONNECTION_STRING")
                .context("DB_CONNECTION_STRING must be set")?,
            db_name: env::var("DB_NAME").context("DB_NAME must be set")?,
            messagebus_type,
            messagebus_connection_string: env::var("MESSAGEBUS_CONNECTION_STRING")
                .context("MESSAGEBUS_CONNECTION_STRING must be set")?,
            cleanup_interval: parse_millis_duration("CLEANUP_INTERVAL")?,
            cache_refresh_interval: parse_millis_duration("CACHE_REFRESH_INTERVAL")?,
            heartbeat_timeout: parse_millis_duration("HEARTBEAT_TIMEOUT")?,
            heartbeat_interval: parse_millis_duration("HEARTBEAT_INTERVAL")?,
            api_url: env::var("API_URL").ok(),
            hostname,
        })
    }
}

fn parse_millis_duration(key: &str) -> Result<Duration> {
    let raw = env::var(key).with_context(|| format!("{key} must be set"))?;
    let millis: u64 = raw
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer of milliseconds"))?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // mutate them so they don't race each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "MAX_JOBS",
            "DB_TYPE",
            "DB_CONNECTION_STRING",
            "DB_NAME",
            "MESSAGEBUS_TYPE",
            "MESSAGEBUS_CONNECTION_STRING",
            "CLEANUP_INTERVAL",
            "CACHE_REFRESH_INTERVAL",
            "HEARTBEAT_TIMEOUT",
            "HEARTBEAT_INTERVAL",
            "API_URL",
            "HOSTNAME",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn rejects_unsupported_db_type() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("DB_TYPE", "mongo");
        env::set_var("MESSAGEBUS_TYPE", "nats");
        let err = SchedulerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DB_TYPE"));
        clear_all();
    }

    #[test]
    fn loads_complete_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        env::set_var("DB_TYPE", "postgres");
        env::set_var("DB_CONNECTION_STRING", "postgres://localhost/test");
        env::set_var("DB_NAME", "scheduler");
        env::set_var("MESSAGEBUS_TYPE", "nats");
        env::set_var("MESSAGEBUS_CONNECTION_STRING", "nats://localhost:4222");
        env::set_var("CLEANUP_INTERVAL", "1000");
        env::set_var("CACHE_REFRESH_INTERVAL", "2000");
        env::set_var("HEARTBEAT_TIMEOUT", "30000");
        env::set_var("HEARTBEAT_INTERVAL", "5000");
        env::set_var("HOSTNAME", "manager-1");

        let cfg = SchedulerConfig::from_env().expect("valid config");
        assert_eq!(cfg.max_jobs, 0);
        assert_eq!(cfg.hostname, "manager-1");
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(5000));
        clear_all();
    }
}
