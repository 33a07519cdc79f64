//! Process configuration from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use retrier_observability::tracing::LogFormat;
use retrier_infra::runs::sweeper::{DEFAULT_RETENTION_HOURS, DEFAULT_SWEEP_BATCH_SIZE};
use retrier_infra::runs::{DailySchedule, RetryOptions};
use retrier_infra::scheduler::in_memory::DEFAULT_JOB_RETENTION_HOURS;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Postgres run store when set; in-memory otherwise
    pub database_url: Option<String>,
    /// How long completed runs are kept before the sweeper deletes them
    pub retention: chrono::Duration,
    pub sweep_schedule: DailySchedule,
    pub sweep_batch_size: usize,
    pub worker_poll_interval: Duration,
    /// How long finished scheduler jobs stay queryable
    pub job_retention: chrono::Duration,
    /// Fallback `tracing` filter when `RUST_LOG` is unset
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Options applied to runs that do not set them
    pub defaults: RetryOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            retention: chrono::Duration::hours(DEFAULT_RETENTION_HOURS),
            sweep_schedule: DailySchedule::default(),
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            worker_poll_interval: Duration::from_millis(50),
            job_retention: chrono::Duration::hours(DEFAULT_JOB_RETENTION_HOURS),
            log_filter: "info".to_string(),
            log_format: LogFormat::Json,
            defaults: RetryOptions::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();

        let retention_hours: i64 = parse(&lookup, "RETRIER_RETENTION_HOURS", DEFAULT_RETENTION_HOURS)?;
        let job_retention_hours: i64 =
            parse(&lookup, "RETRIER_JOB_RETENTION_HOURS", DEFAULT_JOB_RETENTION_HOURS)?;
        let sweep_hour: u32 = parse(&lookup, "RETRIER_SWEEP_HOUR_UTC", 0)?;
        let sweep_minute: u32 = parse(&lookup, "RETRIER_SWEEP_MINUTE_UTC", 0)?;
        let poll_ms: u64 = parse(&lookup, "RETRIER_WORKER_POLL_MS", 50)?;

        let defaults = RetryOptions::default()
            .with_initial_backoff_ms(parse(
                &lookup,
                "RETRIER_DEFAULT_INITIAL_BACKOFF_MS",
                base.defaults.initial_backoff_ms,
            )?)
            .with_wait_backoff_ms(parse(
                &lookup,
                "RETRIER_DEFAULT_WAIT_BACKOFF_MS",
                base.defaults.wait_backoff_ms,
            )?)
            .with_base(parse(&lookup, "RETRIER_DEFAULT_BASE", base.defaults.base)?)
            .with_max_failures(parse(
                &lookup,
                "RETRIER_DEFAULT_MAX_FAILURES",
                base.defaults.max_failures,
            )?);
        defaults
            .validate()
            .context("invalid RETRIER_DEFAULT_* retry options")?;

        if retention_hours < 0 || job_retention_hours < 0 {
            anyhow::bail!("retention hours must not be negative");
        }

        let log_format = match lookup("RETRIER_LOG_FORMAT") {
            Some(raw) => LogFormat::parse(&raw)
                .ok_or_else(|| anyhow::anyhow!("invalid RETRIER_LOG_FORMAT={raw:?}"))?,
            None => base.log_format,
        };

        Ok(Self {
            bind_addr: parse(&lookup, "RETRIER_BIND_ADDR", base.bind_addr)?,
            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
            retention: chrono::Duration::hours(retention_hours),
            sweep_schedule: DailySchedule::at(sweep_hour, sweep_minute)
                .context("invalid RETRIER_SWEEP_HOUR_UTC / RETRIER_SWEEP_MINUTE_UTC")?,
            sweep_batch_size: parse(&lookup, "RETRIER_SWEEP_BATCH_SIZE", base.sweep_batch_size)?,
            worker_poll_interval: Duration::from_millis(poll_ms),
            job_retention: chrono::Duration::hours(job_retention_hours),
            log_filter: lookup("RETRIER_LOG").unwrap_or(base.log_filter),
            log_format,
            defaults,
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.retention, chrono::Duration::days(7));
        assert_eq!(cfg.sweep_schedule, DailySchedule::default());
        assert_eq!(cfg.defaults, RetryOptions::default());
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("RETRIER_BIND_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/retrier"),
            ("RETRIER_RETENTION_HOURS", "24"),
            ("RETRIER_SWEEP_HOUR_UTC", "3"),
            ("RETRIER_SWEEP_MINUTE_UTC", "30"),
            ("RETRIER_DEFAULT_MAX_FAILURES", "4"),
            ("RETRIER_DEFAULT_INITIAL_BACKOFF_MS", "250"),
        ])
        .unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/retrier"));
        assert_eq!(cfg.retention, chrono::Duration::hours(24));
        assert_eq!(cfg.sweep_schedule, DailySchedule::at(3, 30).unwrap());
        assert_eq!(cfg.defaults.max_failures, 4);
        assert_eq!(cfg.defaults.initial_backoff_ms, 250.0);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(config(&[("RETRIER_WORKER_POLL_MS", "soon")]).is_err());
        assert!(config(&[("RETRIER_SWEEP_HOUR_UTC", "25")]).is_err());
        assert!(config(&[("RETRIER_DEFAULT_BASE", "-2")]).is_err());
        assert!(config(&[("RETRIER_RETENTION_HOURS", "-1")]).is_err());
        assert!(config(&[("RETRIER_LOG_FORMAT", "xml")]).is_err());
    }
}
