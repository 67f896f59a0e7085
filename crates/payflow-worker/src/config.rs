//! Worker configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Settings of one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// `PostgreSQL` connection string.
    pub database_url: String,
    /// Pool size.
    pub database_max_connections: u32,
    /// Pending outbox records loaded per round trip.
    pub outbox_batch_size: usize,
    /// Interval between outbox publisher runs.
    pub outbox_poll_interval: Duration,
    /// How long a publisher run waits for the previous one.
    pub outbox_lock_timeout: Duration,
    /// Snapshot cadence in versions; `0` disables snapshots.
    pub snapshot_frequency: i16,
    /// Command jobs executing at once.
    pub job_workers: usize,
    /// How long shutdown waits for accepted jobs.
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    /// Read the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is missing or a variable
    /// does not parse.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`WorkerConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                AppError::Config("DATABASE_URL environment variable must be set".into())
            })?;

        Ok(Self {
            database_url,
            database_max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            outbox_batch_size: positive(&lookup, "OUTBOX_BATCH_SIZE", 100)?,
            outbox_poll_interval: Duration::from_millis(positive(
                &lookup,
                "OUTBOX_POLL_INTERVAL_MS",
                1000,
            )?),
            outbox_lock_timeout: Duration::from_secs(positive(
                &lookup,
                "OUTBOX_LOCK_TIMEOUT_SECS",
                300,
            )?),
            snapshot_frequency: parse(&lookup, "SNAPSHOT_FREQUENCY", 10)?,
            job_workers: positive(&lookup, "JOB_WORKERS", 4)?,
            shutdown_grace: Duration::from_secs(parse(&lookup, "SHUTDOWN_GRACE_SECS", 30)?),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{name} is invalid ({raw:?}): {e}"))),
    }
}

fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, AppError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = parse(lookup, name, default)?;
    if value <= T::default() {
        return Err(AppError::Config(format!("{name} must be greater than zero")));
    }
    Ok(value)
}
