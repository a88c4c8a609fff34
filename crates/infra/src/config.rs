//! Process configuration from environment variables.
//!
//! Every variable is optional; unset means the default. A set but unparsable
//! value is an error rather than a silent fallback.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::{ReaperConfig, RetryPolicy, WorkerPoolConfig};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} is required: {reason}")]
    Missing { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerKind {
    Gemini,
    Offline,
}

impl FromStr for AnalyzerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(AnalyzerKind::Gemini),
            "offline" => Ok(AnalyzerKind::Offline),
            other => Err(format!("unknown analyzer '{other}', expected gemini or offline")),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub worker_count: usize,
    pub max_attempts: u32,
    pub lease_ttl: Duration,
    pub lease_renew: Duration,
    pub reaper_interval: Duration,
    pub stale_pending: Duration,
    pub execution_timeout: Duration,
    pub shutdown_grace: Duration,
    pub consume_wait: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub documents_dir: PathBuf,
    pub output_dir: PathBuf,
    pub default_document: String,
    pub analyzer: AnalyzerKind,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("worker_count", &self.worker_count)
            .field("max_attempts", &self.max_attempts)
            .field("lease_ttl", &self.lease_ttl)
            .field("lease_renew", &self.lease_renew)
            .field("reaper_interval", &self.reaper_interval)
            .field("stale_pending", &self.stale_pending)
            .field("execution_timeout", &self.execution_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("consume_wait", &self.consume_wait)
            .field("documents_dir", &self.documents_dir)
            .field("output_dir", &self.output_dir)
            .field("default_document", &self.default_document)
            .field("analyzer", &self.analyzer)
            .field("gemini_api_key", &self.gemini_api_key.as_ref().map(|_| "<redacted>"))
            .field("gemini_model", &self.gemini_model)
            .finish()
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn positive<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + Copy + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.positive(key, default).map(Duration::from_secs)
    }

    fn millis(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.positive(key, default).map(Duration::from_millis)
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let lease_ttl = env.secs("LEASE_TTL_SECS", 60)?;
        let lease_renew = match env.raw("LEASE_RENEW_SECS") {
            None => (lease_ttl / 3).max(Duration::from_secs(1)),
            Some(_) => env.secs("LEASE_RENEW_SECS", 20)?,
        };
        if lease_renew >= lease_ttl {
            return Err(ConfigError::Invalid {
                key: "LEASE_RENEW_SECS",
                value: lease_renew.as_secs().to_string(),
                reason: "must be shorter than LEASE_TTL_SECS".to_string(),
            });
        }

        let retry_base_delay = env.millis("RETRY_BASE_DELAY_MS", 1_000)?;
        let retry_max_delay = env.millis("RETRY_MAX_DELAY_MS", 60_000)?;
        if retry_max_delay < retry_base_delay {
            return Err(ConfigError::Invalid {
                key: "RETRY_MAX_DELAY_MS",
                value: retry_max_delay.as_millis().to_string(),
                reason: "must not be below RETRY_BASE_DELAY_MS".to_string(),
            });
        }

        let analyzer: AnalyzerKind = env.parse("ANALYZER", AnalyzerKind::Gemini)?;
        let gemini_api_key = env.raw("GEMINI_API_KEY");
        if analyzer == AnalyzerKind::Gemini && gemini_api_key.is_none() {
            return Err(ConfigError::Missing {
                key: "GEMINI_API_KEY",
                reason: "ANALYZER=gemini needs an API key (or set ANALYZER=offline)".to_string(),
            });
        }

        Ok(Self {
            bind_addr: env.parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            database_url: env.raw("DATABASE_URL"),
            redis_url: env.raw("REDIS_URL"),
            worker_count: env.positive("WORKER_COUNT", 4)?,
            max_attempts: env.positive("MAX_ATTEMPTS", 3)?,
            lease_ttl,
            lease_renew,
            reaper_interval: env.secs("REAPER_INTERVAL_SECS", 15)?,
            stale_pending: env.secs("STALE_PENDING_SECS", 120)?,
            execution_timeout: env.secs("EXECUTION_TIMEOUT_SECS", 30 * 60)?,
            shutdown_grace: env.secs("SHUTDOWN_GRACE_SECS", 30)?,
            consume_wait: env.millis("CONSUME_WAIT_MS", 1_000)?,
            retry_base_delay,
            retry_max_delay,
            documents_dir: PathBuf::from(env.raw("DOCUMENTS_DIR").unwrap_or_else(|| "data".to_string())),
            output_dir: PathBuf::from(env.raw("OUTPUT_DIR").unwrap_or_else(|| "output".to_string())),
            default_document: env.raw("DEFAULT_DOCUMENT").unwrap_or_else(|| "sample.pdf".to_string()),
            analyzer,
            gemini_api_key,
            gemini_model: env
                .raw("GEMINI_MODEL")
                .unwrap_or_else(|| docflow_analysis::gemini::DEFAULT_MODEL.to_string()),
        })
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.worker_count,
            lease_ttl: self.lease_ttl,
            renew_interval: self.lease_renew,
            execution_timeout: self.execution_timeout,
            consume_wait: self.consume_wait,
            drain_timeout: self.shutdown_grace,
            requeue_backoff: RetryPolicy::exponential(self.max_attempts, self.retry_base_delay, self.retry_max_delay),
            ..WorkerPoolConfig::default()
        }
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reaper_interval,
            stale_pending_after: self.stale_pending,
            ..ReaperConfig::default()
        }
    }
}
