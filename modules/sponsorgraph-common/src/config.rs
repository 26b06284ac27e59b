use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // GitHub
    pub github_token: String,

    // Intake API
    pub api_host: String,
    pub api_port: u16,

    // Crawler tuning
    pub worker_count: usize,
    pub max_depth: i32,
    pub freshness_days: i64,
    pub retry_ceiling: i32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub idle_poll: Duration,
    pub stale_check_interval: Duration,
    pub abandoned_timeout: Duration,
    pub backfill_pages: u32,
}

impl Config {
    /// Load configuration for the crawler process.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self::load(required_env("GITHUB_TOKEN"))
    }

    /// Load a minimal config for the intake API (no GitHub token needed —
    /// the API only validates and enqueues).
    pub fn api_from_env() -> Self {
        Self::load(env::var("GITHUB_TOKEN").unwrap_or_default())
    }

    fn load(github_token: String) -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            github_token,
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: parsed_env("API_PORT", 3000),
            worker_count: parsed_env("CRAWL_WORKERS", 2),
            max_depth: parsed_env("CRAWL_MAX_DEPTH", 3),
            freshness_days: parsed_env("FRESHNESS_DAYS", 7),
            retry_ceiling: parsed_env("RETRY_CEILING", 3),
            backoff_base: Duration::from_secs(parsed_env("BACKOFF_BASE_SECS", 1)),
            backoff_cap: Duration::from_secs(parsed_env("BACKOFF_CAP_SECS", 900)),
            idle_poll: Duration::from_secs(parsed_env("IDLE_POLL_SECS", 5)),
            stale_check_interval: Duration::from_secs(parsed_env(
                "STALE_CHECK_INTERVAL_SECS",
                14400,
            )),
            abandoned_timeout: Duration::from_secs(parsed_env("ABANDONED_TIMEOUT_SECS", 3600)),
            backfill_pages: parsed_env("BACKFILL_PAGES", 10),
        }
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a number")),
        Err(_) => default,
    }
}
