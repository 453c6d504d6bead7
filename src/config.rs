//! Bridge configuration.
//!
//! Configuration is layered:
//! 1. Built-in defaults
//! 2. TOML file (`taskbridge.toml` or an explicit path)
//! 3. Environment variables (`REDIS_URL`, `TASKBRIDGE_*`)
//!
//! Later layers override earlier ones. The binary also loads a `.env` file
//! through `dotenvy` before reading the environment.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [store]
//! backend = "redis"
//! redis_url = "redis://localhost:6379/0"
//! task_ttl_secs = 300
//!
//! [bus]
//! backend = "redis"
//! work_topic = "taskbridge.work"
//! consumer_group = "taskbridge-workers"
//!
//! [worker]
//! concurrency = 8
//! accepted_schema = "birth-date@v1"
//!
//! [compute]
//! kind = "http"
//! endpoint = "http://localhost:8080/reading"
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::correlator::CorrelatorConfig;
use crate::domain::PayloadSchema;
use crate::reaper::{ReaperConfig, DEFAULT_GRACE_PERIOD};
use crate::retry::{Backoff, RetryPolicy};
use crate::store::StoreConfig;
use crate::worker::{WorkerConfig, DEFAULT_COMPUTE_TIMEOUT};

/// File read when no explicit path is given and it exists.
pub const DEFAULT_CONFIG_FILE: &str = "taskbridge.toml";

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`BridgeConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A setting has an unusable value.
    #[error("invalid value for {key}: {message}")]
    Invalid {
        /// Setting name, as written in the TOML file.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Which implementation backs the store or the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process; only useful when every component shares one process.
    #[default]
    Memory,
    /// Redis, shared between processes.
    Redis,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::invalid(
                "backend",
                format!("unknown backend '{other}', expected 'memory' or 'redis'"),
            )),
        }
    }
}

/// Which compute collaborator a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeKind {
    /// Return the input unchanged.
    #[default]
    Echo,
    /// POST the payload to `compute.endpoint`.
    Http,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Store backend.
    pub backend: BackendKind,
    /// Redis connection URL for the `redis` backend.
    pub redis_url: String,
    /// Key namespace.
    pub namespace: String,
    /// TTL for live tasks in seconds. 0 disables expiry.
    pub task_ttl_secs: u64,
    /// TTL cap for terminal tasks in seconds. 0 keeps the task TTL.
    pub terminal_ttl_secs: u64,
    /// Compare-and-set rounds per mutation.
    pub cas_retries: u32,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            namespace: "task".to_string(),
            task_ttl_secs: 300,
            terminal_ttl_secs: 60,
            cas_retries: 8,
        }
    }
}

/// `[bus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Bus backend.
    pub backend: BackendKind,
    /// Redis connection URL for the `redis` backend.
    pub redis_url: String,
    /// Topic carrying work events.
    pub work_topic: String,
    /// Topic carrying completion events. Empty disables them.
    pub result_topic: String,
    /// Consumer group shared by workers.
    pub consumer_group: String,
    /// Visibility timeout for leased deliveries, in seconds.
    pub lease_secs: u64,
    /// Deliveries per read.
    pub batch_size: usize,
    /// How long one read may block, in milliseconds.
    pub block_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            work_topic: "taskbridge.work".to_string(),
            result_topic: "taskbridge.results".to_string(),
            consumer_group: "taskbridge-workers".to_string(),
            lease_secs: 30,
            batch_size: 16,
            block_ms: 2000,
        }
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Consumer name within the group. Generated when unset.
    pub consumer_name: Option<String>,
    /// Events handled at once.
    pub concurrency: Option<usize>,
    /// Upper bound for one compute call, in seconds.
    pub compute_timeout_secs: Option<u64>,
    /// Only accept payloads of this schema, written `name@vN`.
    pub accepted_schema: Option<String>,
}

/// `[correlator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorSection {
    /// First polling delay, in milliseconds.
    pub poll_initial_ms: u64,
    /// Polling delay cap, in milliseconds.
    pub poll_max_ms: u64,
    /// Default wait for `submit_and_wait`, in seconds.
    pub wait_timeout_secs: u64,
    /// Publish attempts before a submission fails.
    pub publish_attempts: u32,
    /// Delete records once a wait observes a terminal status. Only safe
    /// with one waiter per task; later waiters see `NotFound`.
    pub release_on_terminal: bool,
}

impl Default for CorrelatorSection {
    fn default() -> Self {
        Self {
            poll_initial_ms: 250,
            poll_max_ms: 2000,
            wait_timeout_secs: 300,
            publish_attempts: 5,
            release_on_terminal: false,
        }
    }
}

/// `[reaper]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSection {
    /// Age after which a claim counts as stale, in seconds. Must exceed
    /// `worker.compute_timeout_secs`.
    pub grace_secs: u64,
    /// Claims per task before it is failed as abandoned.
    pub max_attempts: u32,
    /// Pause between sweeps, in seconds.
    pub interval_secs: u64,
}

impl Default for ReaperSection {
    fn default() -> Self {
        Self {
            grace_secs: DEFAULT_GRACE_PERIOD.as_secs(),
            max_attempts: 5,
            interval_secs: 15,
        }
    }
}

/// `[compute]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeSection {
    /// Collaborator kind.
    pub kind: ComputeKind,
    /// Endpoint for the `http` collaborator.
    pub endpoint: Option<String>,
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Task store settings.
    pub store: StoreSection,
    /// Message bus settings.
    pub bus: BusSection,
    /// Worker loop settings.
    pub worker: WorkerSection,
    /// Correlator settings.
    pub correlator: CorrelatorSection,
    /// Reaper settings.
    pub reaper: ReaperSection,
    /// Compute collaborator settings.
    pub compute: ComputeSection,
}

impl BridgeConfig {
    /// Loads configuration from `path`, or from [`DEFAULT_CONFIG_FILE`] when
    /// it exists, then applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            },
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file without applying the environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parses TOML content.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.store.backend = BackendKind::Redis;
            self.store.redis_url.clone_from(&url);
            self.bus.backend = BackendKind::Redis;
            self.bus.redis_url = url;
        }
        if let Some(backend) = lookup("TASKBRIDGE_STORE_BACKEND") {
            self.store.backend = backend.parse()?;
        }
        if let Some(backend) = lookup("TASKBRIDGE_BUS_BACKEND") {
            self.bus.backend = backend.parse()?;
        }
        if let Some(topic) = lookup("TASKBRIDGE_WORK_TOPIC") {
            self.bus.work_topic = topic;
        }
        if let Some(topic) = lookup("TASKBRIDGE_RESULT_TOPIC") {
            self.bus.result_topic = topic;
        }
        if let Some(group) = lookup("TASKBRIDGE_CONSUMER_GROUP") {
            self.bus.consumer_group = group;
        }
        if let Some(endpoint) = lookup("TASKBRIDGE_COMPUTE_ENDPOINT") {
            self.compute.kind = ComputeKind::Http;
            self.compute.endpoint = Some(endpoint);
        }
        Ok(())
    }

    /// Checks values that would make a component misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.cas_retries == 0 {
            return Err(ConfigError::invalid("store.cas_retries", "must be at least 1"));
        }
        if self.bus.work_topic.trim().is_empty() {
            return Err(ConfigError::invalid("bus.work_topic", "must not be empty"));
        }
        if self.bus.consumer_group.trim().is_empty() {
            return Err(ConfigError::invalid("bus.consumer_group", "must not be empty"));
        }
        if self.bus.batch_size == 0 {
            return Err(ConfigError::invalid("bus.batch_size", "must be at least 1"));
        }
        if self.bus.lease_secs == 0 {
            return Err(ConfigError::invalid("bus.lease_secs", "must be at least 1"));
        }
        if self.worker.concurrency == Some(0) {
            return Err(ConfigError::invalid("worker.concurrency", "must be at least 1"));
        }
        if self.worker.compute_timeout_secs == Some(0) {
            return Err(ConfigError::invalid(
                "worker.compute_timeout_secs",
                "must be at least 1",
            ));
        }
        if let Some(schema) = &self.worker.accepted_schema {
            parse_schema(schema)?;
        }
        if self.correlator.poll_initial_ms == 0 {
            return Err(ConfigError::invalid(
                "correlator.poll_initial_ms",
                "must be at least 1",
            ));
        }
        if self.correlator.poll_initial_ms > self.correlator.poll_max_ms {
            return Err(ConfigError::invalid(
                "correlator.poll_max_ms",
                "must not be below poll_initial_ms",
            ));
        }
        if self.correlator.publish_attempts == 0 {
            return Err(ConfigError::invalid(
                "correlator.publish_attempts",
                "must be at least 1",
            ));
        }
        if self.reaper.max_attempts == 0 {
            return Err(ConfigError::invalid("reaper.max_attempts", "must be at least 1"));
        }
        if self.reaper.interval_secs == 0 {
            return Err(ConfigError::invalid("reaper.interval_secs", "must be at least 1"));
        }
        let compute_timeout_secs = self
            .worker
            .compute_timeout_secs
            .unwrap_or(DEFAULT_COMPUTE_TIMEOUT.as_secs());
        if self.reaper.grace_secs <= compute_timeout_secs {
            return Err(ConfigError::invalid(
                "reaper.grace_secs",
                format!(
                    "must exceed worker.compute_timeout_secs ({compute_timeout_secs}), \
                     or in-flight tasks get reclaimed"
                ),
            ));
        }
        if self.compute.kind == ComputeKind::Http
            && self.compute.endpoint.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::invalid(
                "compute.endpoint",
                "required when compute.kind is 'http'",
            ));
        }
        Ok(())
    }

    /// Settings for [`GenericTaskStore`](crate::store::GenericTaskStore).
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            namespace: self.store.namespace.clone(),
            task_ttl: non_zero_secs(self.store.task_ttl_secs),
            terminal_ttl: non_zero_secs(self.store.terminal_ttl_secs),
            cas_retries: self.store.cas_retries,
        }
    }

    /// Settings for the worker loop.
    pub fn worker_config(&self) -> Result<WorkerConfig, ConfigError> {
        let defaults = WorkerConfig::default();
        let accepted_schema = self
            .worker
            .accepted_schema
            .as_deref()
            .map(parse_schema)
            .transpose()?;
        Ok(WorkerConfig {
            work_topic: self.bus.work_topic.clone(),
            result_topic: Some(self.bus.result_topic.clone()).filter(|t| !t.is_empty()),
            group: self.bus.consumer_group.clone(),
            consumer: self
                .worker
                .consumer_name
                .clone()
                .unwrap_or(defaults.consumer),
            concurrency: self.worker.concurrency.unwrap_or(defaults.concurrency),
            compute_timeout: self
                .worker
                .compute_timeout_secs
                .map_or(defaults.compute_timeout, Duration::from_secs),
            accepted_schema,
            batch_size: self.bus.batch_size,
            receive_wait: Duration::from_millis(self.bus.block_ms),
            lease: Duration::from_secs(self.bus.lease_secs),
            ..defaults
        })
    }

    /// Settings for the correlator.
    pub fn correlator_config(&self) -> CorrelatorConfig {
        let defaults = CorrelatorConfig::default();
        CorrelatorConfig {
            work_topic: self.bus.work_topic.clone(),
            poll: Backoff::new(
                Duration::from_millis(self.correlator.poll_initial_ms),
                Duration::from_millis(self.correlator.poll_max_ms),
            ),
            publish_retry: RetryPolicy::new(
                self.correlator.publish_attempts,
                defaults.publish_retry.backoff,
            ),
            default_timeout: Duration::from_secs(self.correlator.wait_timeout_secs),
            release_on_terminal: self.correlator.release_on_terminal,
        }
    }

    /// Settings for the reaper.
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            work_topic: self.bus.work_topic.clone(),
            grace_period: Duration::from_secs(self.reaper.grace_secs),
            max_attempts: self.reaper.max_attempts,
            scan_interval: Duration::from_secs(self.reaper.interval_secs),
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Parses `name@vN` (or `name@N`) into a schema.
pub fn parse_schema(raw: &str) -> Result<PayloadSchema, ConfigError> {
    let invalid = || {
        ConfigError::invalid(
            "worker.accepted_schema",
            format!("'{raw}' is not of the form name@vN"),
        )
    };
    let (name, version) = raw.trim().rsplit_once('@').ok_or_else(invalid)?;
    let version = version.strip_prefix('v').unwrap_or(version);
    let version: u32 = version.parse().map_err(|_| invalid())?;
    if name.is_empty() {
        return Err(invalid());
    }
    Ok(PayloadSchema::new(name, version))
}
