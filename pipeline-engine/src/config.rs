// Engine Configuration
// Defaults, builder overrides and CIRUN_* environment variables

use crate::cache::CacheConfig;
use crate::error::{EngineError, EngineResult};
use crate::report::ReportFormat;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for a [`crate::PipelineEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum jobs running at once
    pub max_parallel_jobs: usize,
    /// Time budget for jobs without `timeout-minutes`
    pub job_timeout: Duration,
    /// Cache store location and eviction limits
    pub cache: CacheConfig,
    /// Where to persist the run report, if anywhere
    pub report_path: Option<PathBuf>,
    pub report_format: ReportFormat,
    /// Checkout to run in (default: repository containing the current directory)
    pub workspace: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            job_timeout: Duration::from_secs(60 * 60),
            cache: CacheConfig::default(),
            report_path: None,
            report_format: ReportFormat::default(),
            workspace: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CIRUN_*` variables of the current process
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for:
    ///
    /// - `CIRUN_MAX_PARALLEL_JOBS`
    /// - `CIRUN_JOB_TIMEOUT_MINUTES`
    /// - `CIRUN_CACHE_DIR`
    /// - `CIRUN_CACHE_CAPACITY`
    /// - `CIRUN_CACHE_TTL_HOURS` (`0` disables expiry)
    /// - `CIRUN_REPORT_PATH`
    /// - `CIRUN_REPORT_FORMAT`
    /// - `CIRUN_WORKSPACE`
    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("CIRUN_MAX_PARALLEL_JOBS") {
            config.max_parallel_jobs = parse("CIRUN_MAX_PARALLEL_JOBS", &value)?;
        }
        if let Some(value) = get("CIRUN_JOB_TIMEOUT_MINUTES") {
            let minutes: u64 = parse("CIRUN_JOB_TIMEOUT_MINUTES", &value)?;
            config.job_timeout = scaled("CIRUN_JOB_TIMEOUT_MINUTES", minutes, 60)?;
        }
        if let Some(value) = get("CIRUN_CACHE_DIR") {
            config.cache.root = PathBuf::from(value);
        }
        if let Some(value) = get("CIRUN_CACHE_CAPACITY") {
            config.cache.capacity = parse("CIRUN_CACHE_CAPACITY", &value)?;
        }
        if let Some(value) = get("CIRUN_CACHE_TTL_HOURS") {
            let hours: u64 = parse("CIRUN_CACHE_TTL_HOURS", &value)?;
            config.cache.ttl = match hours {
                0 => None,
                hours => Some(scaled("CIRUN_CACHE_TTL_HOURS", hours, 60 * 60)?),
            };
        }
        if let Some(value) = get("CIRUN_REPORT_PATH") {
            config.report_path = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CIRUN_REPORT_FORMAT") {
            config.report_format = value.parse().map_err(EngineError::Config)?;
        }
        if let Some(value) = get("CIRUN_WORKSPACE") {
            config.workspace = Some(PathBuf::from(value));
        }

        config.validate()?;
        Ok(config)
    }

    /// Job timeout given in minutes; fails if it does not fit a `Duration`
    pub fn with_job_timeout_minutes(self, minutes: u64) -> EngineResult<Self> {
        Ok(self.with_job_timeout(scaled("job timeout", minutes, 60)?))
    }

    pub fn with_max_parallel_jobs(mut self, jobs: usize) -> Self {
        self.max_parallel_jobs = jobs;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.root = dir.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_report(mut self, path: impl Into<PathBuf>, format: ReportFormat) -> Self {
        self.report_path = Some(path.into());
        self.report_format = format;
        self
    }

    pub fn with_workspace(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace = Some(dir.into());
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_parallel_jobs == 0 {
            return Err(EngineError::Config(
                "max parallel jobs must be at least 1".to_string(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(EngineError::Config(
                "job timeout must be greater than zero".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(EngineError::Config(
                "cache capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T>(name: &str, value: &str) -> EngineResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| EngineError::Config(format!("{}='{}': {}", name, value, e)))
}

/// `value` units of `unit_secs` seconds each, unless that overflows
fn scaled(name: &str, value: u64, unit_secs: u64) -> EngineResult<Duration> {
    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| EngineError::Config(format!("{} of {} is too large", name, value)))
}
