use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Dispatch, retry and batching knobs shared by the notifier and scheduler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatchConfig {
    /// Persisted retry budget per notification (default: 5)
    pub max_retries: u32,

    /// Backoff table indexed by retry count (default: 5, 15, 30, 60, 120 minutes)
    pub backoff_schedule: Vec<Duration>,

    /// Dispatcher polling interval (default: 60s)
    pub dispatch_tick_interval: Duration,

    /// Reminder scheduler polling interval (default: 60s)
    pub scheduler_tick_interval: Duration,

    /// Items sent concurrently per batch (default: 5)
    pub batch_size: usize,

    /// Pause between batches to stay under provider rate limits (default: 1s)
    pub batch_delay: Duration,

    /// Flat delay between in-memory retries of a single send (default: 5s)
    pub inmem_retry_delay: Duration,

    /// In-memory retries of a single send before giving up (default: 3)
    pub inmem_max_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_schedule: [5u64, 15, 30, 60, 120]
                .iter()
                .map(|m| Duration::from_secs(m * 60))
                .collect(),
            dispatch_tick_interval: Duration::from_secs(60),
            scheduler_tick_interval: Duration::from_secs(60),
            batch_size: 5,
            batch_delay: Duration::from_secs(1),
            inmem_retry_delay: Duration::from_secs(5),
            inmem_max_retries: 3,
        }
    }
}

impl DispatchConfig {
    /// Load dispatch knobs from environment variables, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let backoff_schedule = match std::env::var("BACKOFF_SCHEDULE_MINUTES") {
            Ok(raw) => parse_backoff_minutes(&raw)?,
            Err(_) => defaults.backoff_schedule,
        };

        let batch_size: usize = env_or("DISPATCH_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            anyhow::bail!("DISPATCH_BATCH_SIZE must be at least 1");
        }

        Ok(Self {
            max_retries: env_or("MAX_RETRIES", defaults.max_retries)?,
            backoff_schedule,
            dispatch_tick_interval: tick_interval(
                "DISPATCH_TICK_INTERVAL_SECS",
                env_or("DISPATCH_TICK_INTERVAL_SECS", defaults.dispatch_tick_interval.as_secs())?,
            )?,
            scheduler_tick_interval: tick_interval(
                "SCHEDULER_TICK_INTERVAL_SECS",
                env_or("SCHEDULER_TICK_INTERVAL_SECS", defaults.scheduler_tick_interval.as_secs())?,
            )?,
            batch_size,
            batch_delay: Duration::from_millis(env_or(
                "DISPATCH_BATCH_DELAY_MS",
                defaults.batch_delay.as_millis() as u64,
            )?),
            inmem_retry_delay: Duration::from_millis(env_or(
                "INMEM_RETRY_DELAY_MS",
                defaults.inmem_retry_delay.as_millis() as u64,
            )?),
            inmem_max_retries: env_or("INMEM_MAX_RETRIES", defaults.inmem_max_retries)?,
        })
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string; the notification cache is disabled when unset
    pub redis_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Operator API listen address (default: 0.0.0.0:3000)
    pub api_bind_addr: String,

    /// JWT secret for operator API authentication
    pub jwt_secret: String,

    /// JWT token expiry in hours
    pub jwt_expiry_hours: u64,

    /// Static key operators exchange for a JWT
    pub operator_api_key: Option<String>,

    /// IANA timezone used for calendar-day reminder arithmetic (default: UTC)
    pub scheduler_timezone: String,

    /// Discord webhook reminders go to when a server has no route of its own
    pub reminder_default_recipient: Option<String>,

    /// Per-server reminder webhook, parsed from `server=url,server=url`
    pub reminder_routes: HashMap<String, String>,

    /// Terminal notifications older than this are purged (default: 30)
    pub retention_days: i64,

    /// TTL for cached notification lookups in Redis (default: 300)
    pub cache_ttl_secs: u64,

    pub dispatch: DispatchConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            jwt_expiry_hours: env_or("JWT_EXPIRY_HOURS", 24)?,
            operator_api_key: std::env::var("OPERATOR_API_KEY").ok(),
            scheduler_timezone: std::env::var("SCHEDULER_TIMEZONE")
                .unwrap_or_else(|_| "UTC".to_string()),
            reminder_default_recipient: std::env::var("REMINDER_DEFAULT_RECIPIENT").ok(),
            reminder_routes: std::env::var("REMINDER_ROUTES")
                .map(|raw| parse_routes(&raw))
                .unwrap_or_default(),
            retention_days: env_or("NOTIFICATION_RETENTION_DAYS", 30)?,
            cache_ttl_secs: env_or("CACHE_TTL_SECS", 300)?,
            dispatch: DispatchConfig::from_env()?,
        })
    }
}

/// Read `key` and parse it, or return `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", key, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

/// Polling loops need a non-zero period.
fn tick_interval(key: &str, secs: u64) -> anyhow::Result<Duration> {
    if secs == 0 {
        anyhow::bail!("{} must be at least 1", key);
    }
    Ok(Duration::from_secs(secs))
}

/// Parse `5,15,30` into minute durations.
pub fn parse_backoff_minutes(raw: &str) -> anyhow::Result<Vec<Duration>> {
    let schedule = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| anyhow::anyhow!("BACKOFF_SCHEDULE_MINUTES entry '{}' is not a number", s))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if schedule.is_empty() {
        anyhow::bail!("BACKOFF_SCHEDULE_MINUTES must list at least one delay");
    }
    Ok(schedule)
}

/// Parse `guild-1=https://...,guild-2=https://...`; malformed pairs are skipped.
pub fn parse_routes(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (server, url) = pair.split_once('=')?;
            let (server, url) = (server.trim(), url.trim());
            if server.is_empty() || url.is_empty() {
                tracing::warn!(pair, "Ignoring malformed REMINDER_ROUTES entry");
                return None;
            }
            Some((server.to_string(), url.to_string()))
        })
        .collect()
}
