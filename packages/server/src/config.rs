use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::kernel::git::GitWorkflowConfig;

/// Application configuration loaded from environment variables.
///
/// Every key has a default; a missing environment is a valid environment.
/// Numeric keys are parsed with [`env_parse`], which treats only a missing
/// or empty variable as "use the default"; an explicit `0` stays `0`
/// (`WORKER_MAX_CONCURRENT=0` pauses dispatch rather than silently
/// falling back).
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind port for the REST/WS gateway.
    pub port: u16,
    /// Path of the sqlite database file.
    pub db_path: PathBuf,
    /// Environment tag surfaced in logs and error metadata.
    pub environment: String,
    /// Default per-worker concurrency (0 = hold jobs queued).
    pub worker_max_concurrent: usize,
    /// Fire each registered schedule once at boot.
    pub run_on_startup: bool,
    /// Configured retry cap (the absolute cap is a constant, not config).
    pub retry_max_attempts: u32,
    /// Fallback base delay when the classifier suggests none.
    pub retry_base_delay: Duration,
    /// Activity feed ring capacity.
    pub activity_capacity: usize,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,
    /// Optional 5-field cron expression for the repository scan worker.
    pub scan_cron: Option<String>,
    /// Repository scanned by the cron/startup trigger.
    pub scan_repository_path: PathBuf,
    pub git: GitWorkflowConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            port: env_parse("JOBS_API_PORT", 8080)?,
            db_path: PathBuf::from(env_string("JOBS_DB_PATH", "data/jobs.db")),
            environment: env_string("APP_ENV", "development"),
            worker_max_concurrent: env_parse("WORKER_MAX_CONCURRENT", 3)?,
            run_on_startup: env_bool("RUN_ON_STARTUP", false)?,
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 2)?,
            retry_base_delay: Duration::from_millis(env_parse("RETRY_BASE_DELAY_MS", 5_000)?),
            activity_capacity: env_parse("ACTIVITY_CAPACITY", 50)?,
            shutdown_grace: Duration::from_millis(env_parse("SHUTDOWN_GRACE_MS", 10_000)?),
            scan_cron: env::var("SCAN_CRON").ok().filter(|v| !v.is_empty()),
            scan_repository_path: PathBuf::from(env_string("SCAN_REPOSITORY_PATH", ".")),
            git: GitWorkflowConfig {
                enabled: env_bool("ENABLE_GIT_WORKFLOW", false)?,
                base_branch: env_string("GIT_BASE_BRANCH", "main"),
                branch_prefix: env_string("GIT_BRANCH_PREFIX", "alephauto"),
                dry_run: env_bool("GIT_DRY_RUN", false)?,
            },
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// Parse a numeric environment variable, defaulting only when the variable
/// is missing or empty. `0` is a value, not an absence.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .with_context(|| format!("{key} must be a valid number, got {value:?}")),
        _ => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("{key} must be a boolean, got {other:?}"),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_missing_uses_default() {
        env::remove_var("ALEPH_TEST_MISSING");
        let value: usize = env_parse("ALEPH_TEST_MISSING", 3).unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn env_parse_zero_is_not_defaulted() {
        env::set_var("ALEPH_TEST_ZERO", "0");
        let value: usize = env_parse("ALEPH_TEST_ZERO", 3).unwrap();
        assert_eq!(value, 0);
        env::remove_var("ALEPH_TEST_ZERO");
    }

    #[test]
    fn env_parse_garbage_is_an_error() {
        env::set_var("ALEPH_TEST_GARBAGE", "three");
        let result: Result<usize> = env_parse("ALEPH_TEST_GARBAGE", 3);
        assert!(result.is_err());
        env::remove_var("ALEPH_TEST_GARBAGE");
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        env::set_var("ALEPH_TEST_BOOL", "true");
        assert!(env_bool("ALEPH_TEST_BOOL", false).unwrap());
        env::set_var("ALEPH_TEST_BOOL", "off");
        assert!(!env_bool("ALEPH_TEST_BOOL", true).unwrap());
        env::remove_var("ALEPH_TEST_BOOL");
    }
}
