//! Environment-driven configuration.
//!
//! Every variable has a default. Values that are present but unparseable are
//! collected as errors instead of falling back to the default, so a typo in a
//! deployment manifest stops the service at startup.

use redis_utils::BrokerConfig;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PipelineError, Result};

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";
pub const DEFAULT_NAMESPACE: &str = "pipeline";
pub const DEFAULT_DASHBOARD_URL: &str = "http://localhost:8050/api/update";

/// Which queue store and ledger implementation the service runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    /// Process-local store; single instance development only.
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(QueueBackend::Redis),
            "memory" | "mock" => Ok(QueueBackend::Memory),
            other => Err(format!("unknown queue backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    Fixed,
    Exponential,
}

impl FromStr for RetryBackoff {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(RetryBackoff::Fixed),
            "exponential" => Ok(RetryBackoff::Exponential),
            other => Err(format!("unknown retry backoff '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub backend: QueueBackend,
    pub http: HttpConfig,
    pub consumer: ConsumerConfig,
    pub dashboard: DashboardConfig,
    pub log_format: LogFormat,
    /// How long shutdown waits for the consumer to finish its batch
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

impl HttpConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Batch consumer tuning.
#[derive(Clone, PartialEq)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub visibility_timeout: Duration,
    /// Total attempts before an event is dead-lettered
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_backoff: RetryBackoff,
    pub max_retry_delay: Duration,
    pub idempotency_ttl: Duration,
    pub dry_run: bool,
    /// Consumer instances started by the supervisor
    pub consumers: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            retry_backoff: RetryBackoff::Fixed,
            max_retry_delay: Duration::from_secs(300),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            dry_run: false,
            consumers: 1,
        }
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("batch_size", &self.batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("retry_backoff", &self.retry_backoff)
            .field("idempotency_ttl_hours", &(self.idempotency_ttl.as_secs() / 3600))
            .field("dry_run", &self.dry_run)
            .field("consumers", &self.consumers)
            .finish()
    }
}

impl ConsumerConfig {
    /// Interval between claim attempts while a batch is filling up.
    pub fn poll_interval(&self) -> Duration {
        self.batch_timeout.min(Duration::from_millis(250))
    }

    /// Delay before the retry that follows failed attempt number `attempt`.
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        match self.retry_backoff {
            RetryBackoff::Fixed => self.retry_delay,
            RetryBackoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.retry_delay
                    .saturating_mul(1u32 << exponent)
                    .min(self.max_retry_delay)
            }
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.batch_size == 0 {
            errors.push("batch size must be at least 1".to_string());
        }
        if self.batch_timeout.is_zero() {
            errors.push("batch timeout must be positive".to_string());
        }
        if self.visibility_timeout.is_zero() {
            errors.push("visibility timeout must be positive".to_string());
        } else if self.visibility_timeout <= self.batch_timeout {
            errors.push(format!(
                "visibility timeout ({:?}) must exceed batch timeout ({:?})",
                self.visibility_timeout, self.batch_timeout
            ));
        }
        if self.max_retries == 0 {
            errors.push("max retries must be at least 1".to_string());
        }
        if self.idempotency_ttl.as_secs() == 0 {
            errors.push("idempotency ttl must be at least one second".to_string());
        }
        if self.consumers == 0 {
            errors.push("at least one consumer is required".to_string());
        }
        errors
    }
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub api_url: String,
}

/// Reads variables and remembers every value that failed to parse.
struct EnvReader {
    errors: Vec<String>,
}

impl EnvReader {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn string(&self, key: &str, default: &str) -> String {
        std::env::var(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&mut self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match std::env::var(key) {
            Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
                Ok(value) => value,
                Err(e) => {
                    self.errors.push(format!("{}='{}': {}", key, raw, e));
                    default
                }
            },
            _ => default,
        }
    }

    fn flag(&mut self, key: &str, default: bool) -> bool {
        match std::env::var(key) {
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "" => default,
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    self.errors
                        .push(format!("{}='{}': expected a boolean", key, raw));
                    default
                }
            },
            Err(_) => default,
        }
    }

    fn seconds(&mut self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.parse(key, default))
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut env = EnvReader::new();

        let broker = BrokerConfig::new(
            env.string("REDIS_URL", DEFAULT_REDIS_URL),
            env.string("PIPELINE_NAMESPACE", DEFAULT_NAMESPACE),
        );

        let config = Config {
            broker,
            backend: env.parse("PIPELINE_QUEUE_BACKEND", QueueBackend::Redis),
            http: HttpConfig {
                host: env.string("HTTP_HOST", "0.0.0.0"),
                port: env.parse("HTTP_PORT", 5000u16),
                max_body_bytes: env.parse("PIPELINE_MAX_BODY_BYTES", 256 * 1024usize),
            },
            consumer: ConsumerConfig {
                batch_size: env.parse("PIPELINE_BATCH_SIZE", 10usize),
                batch_timeout: env.seconds("PIPELINE_BATCH_TIMEOUT_SECONDS", 5),
                visibility_timeout: env.seconds("PIPELINE_VISIBILITY_TIMEOUT_SECONDS", 30),
                max_retries: env.parse("PIPELINE_MAX_RETRIES", 3u32),
                retry_delay: env.seconds("PIPELINE_RETRY_DELAY_SECONDS", 2),
                retry_backoff: env.parse("PIPELINE_RETRY_BACKOFF", RetryBackoff::Fixed),
                max_retry_delay: env.seconds("PIPELINE_MAX_RETRY_DELAY_SECONDS", 300),
                idempotency_ttl: Duration::from_secs(
                    env.parse("PIPELINE_IDEMPOTENCY_TTL_HOURS", 24u64)
                        .saturating_mul(3600),
                ),
                dry_run: env.flag("PIPELINE_DRY_RUN", false),
                consumers: env.parse("PIPELINE_CONSUMERS", 1usize),
            },
            dashboard: DashboardConfig {
                enabled: env.flag("DASHBOARD_UPDATE_ENABLED", false),
                api_url: env.string("DASHBOARD_API_URL", DEFAULT_DASHBOARD_URL),
            },
            log_format: env.parse("LOG_FORMAT", LogFormat::Text),
            shutdown_grace: env.seconds("PIPELINE_SHUTDOWN_GRACE_SECONDS", 10),
        };

        let mut errors = env.errors;
        errors.extend(config.validate());
        if !errors.is_empty() {
            return Err(PipelineError::Config(errors.join("; ")));
        }

        Ok(config)
    }

    /// Static checks; broker reachability is checked by the supervisor.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.consumer.validate();
        if self.http.max_body_bytes == 0 {
            errors.push("max body size must be positive".to_string());
        }
        if self.broker.namespace.trim().is_empty() {
            errors.push("namespace must not be empty".to_string());
        }
        if self.dashboard.enabled && self.dashboard.api_url.trim().is_empty() {
            errors.push("dashboard updates enabled without an API url".to_string());
        }
        errors
    }

    /// Configuration for tests and embedding: in-memory backend, ephemeral port.
    pub fn for_memory_backend() -> Self {
        Config {
            broker: BrokerConfig::new(DEFAULT_REDIS_URL, DEFAULT_NAMESPACE),
            backend: QueueBackend::Memory,
            http: HttpConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                max_body_bytes: 256 * 1024,
            },
            consumer: ConsumerConfig::default(),
            dashboard: DashboardConfig {
                enabled: false,
                api_url: DEFAULT_DASHBOARD_URL.to_string(),
            },
            log_format: LogFormat::Text,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}
