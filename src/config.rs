//! Client, producer and consumer configuration.
//!
//! Every struct carries working defaults, can be read from `KAFKA_*`
//! environment variables with `from_env()`, and reports all of its problems at
//! once through `validate()`.
//!
//! # Environment Variables
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `KAFKA_HOSTS` | [`ClientConfig::hosts`] | `localhost:9092` |
//! | `KAFKA_CLIENT_ID` | [`ClientConfig::client_id`] | `kafkaesque-client` |
//! | `KAFKA_SOCKET_TIMEOUT_MS` | [`ClientConfig::timeout`] (`0` disables) | `120000` |
//! | `KAFKA_RANDOMIZE_HOSTS` | [`ClientConfig::randomize_hosts`] | `true` |
//! | `KAFKA_PRODUCER_ACKS` | [`ProducerConfig::req_acks`] | `1` |
//! | `KAFKA_PRODUCER_ACK_TIMEOUT_MS` | [`ProducerConfig::ack_timeout_ms`] | `1000` |
//! | `KAFKA_PRODUCER_CODEC` | [`ProducerConfig::codec`] | `none` |
//! | `KAFKA_PRODUCER_SNAPPY_XERIAL` | [`ProducerConfig::snappy_xerial`] | `false` |
//! | `KAFKA_PRODUCER_ASYNC` | [`ProducerConfig::async_send`] | `false` |
//! | `KAFKA_PRODUCER_BATCH_SEND` | [`ProducerConfig::batch_send`] | `false` |
//! | `KAFKA_PRODUCER_BATCH_N` | [`ProducerConfig::batch_send_every_n`] | `20` |
//! | `KAFKA_PRODUCER_BATCH_T_MS` | [`ProducerConfig::batch_send_every_t`] | `20000` |
//! | `KAFKA_PRODUCER_RANDOM_START` | [`ProducerConfig::random_start`] | `true` |
//! | `KAFKA_PRODUCER_STOP_TIMEOUT_MS` | [`ProducerConfig::stop_timeout`] | `1000` |
//! | `KAFKA_CONSUMER_AUTO_COMMIT` | [`ConsumerConfig::auto_commit`] | `true` |
//! | `KAFKA_CONSUMER_AUTO_COMMIT_N` | [`ConsumerConfig::auto_commit_every_n`] (`0` disables) | `100` |
//! | `KAFKA_CONSUMER_AUTO_COMMIT_T_MS` | [`ConsumerConfig::auto_commit_every_t`] (`0` disables) | `5000` |
//! | `KAFKA_CONSUMER_FETCH_MIN_BYTES` | [`ConsumerConfig::fetch_size_bytes`] | `4096` |
//! | `KAFKA_CONSUMER_FETCH_MAX_WAIT_MS` | [`ConsumerConfig::fetch_max_wait_time_ms`] | `100` |
//! | `KAFKA_CONSUMER_BUFFER_SIZE` | [`ConsumerConfig::buffer_size`] | `4096` |
//! | `KAFKA_CONSUMER_MAX_BUFFER_SIZE` | [`ConsumerConfig::max_buffer_size`] (`0` is unbounded) | `262144` |
//! | `KAFKA_CONSUMER_AUTO_OFFSET_RESET` | [`ConsumerConfig::auto_offset_reset`] | `largest` |
//! | `KAFKA_CONSUMER_PARTITIONS` | [`ConsumerConfig::partitions`] | all |
//! | `KAFKA_CONSUMER_WORKERS` | [`MultiProcessConfig::num_workers`] | `1` |
//! | `KAFKA_CONSUMER_PARTITIONS_PER_WORKER` | [`MultiProcessConfig::partitions_per_worker`] | `0` |
//! | `KAFKA_CONSUMER_QUEUE_CAPACITY` | [`MultiProcessConfig::queue_capacity`] | `1024` |

use std::error::Error as StdError;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::types::CodecKind;

type EnvResult<T> = std::result::Result<T, Box<dyn StdError>>;

fn env_parse<T>(name: &str, default: T) -> EnvResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| format!("Invalid {}: {}", name, e).into()),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v.to_lowercase() != "false" && v != "0")
        .unwrap_or(default)
}

/// Split `host[:port]` entries (each of which may itself be comma separated)
/// into `(host, port)` pairs, defaulting the port to 9092.
pub fn collect_hosts<S: AsRef<str>>(hosts: &[S], randomize: bool) -> Result<Vec<(String, u16)>> {
    let mut collected = Vec::new();

    for entry in hosts.iter().flat_map(|h| h.as_ref().split(',')) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid port in host '{}'", entry)))?;
                (host, port)
            }
            None => (entry, DEFAULT_KAFKA_PORT),
        };

        if host.is_empty() {
            return Err(Error::Config(format!("missing host name in '{}'", entry)));
        }
        collected.push((host.to_string(), port));
    }

    if randomize {
        fastrand::shuffle(&mut collected);
    }

    Ok(collected)
}

/// Connection settings shared by every front-end.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed brokers as `host[:port]`.
    pub hosts: Vec<String>,
    pub client_id: String,
    /// Applied to connect, send and receive; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Shuffle the seed list to spread metadata load across the fleet.
    pub randomize_hosts: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: vec![format!("localhost:{}", DEFAULT_KAFKA_PORT)],
            client_id: DEFAULT_CLIENT_ID.to_string(),
            timeout: Some(Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS)),
            randomize_hosts: true,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at a comma separated seed list.
    pub fn with_hosts(hosts: impl Into<String>) -> Self {
        Self {
            hosts: vec![hosts.into()],
            ..Self::default()
        }
    }

    pub fn from_env() -> EnvResult<Self> {
        let defaults = Self::default();

        let hosts = std::env::var("KAFKA_HOSTS")
            .map(|v| vec![v])
            .unwrap_or(defaults.hosts);
        let client_id = std::env::var("KAFKA_CLIENT_ID").unwrap_or(defaults.client_id);

        let timeout_ms: u64 = env_parse("KAFKA_SOCKET_TIMEOUT_MS", DEFAULT_SOCKET_TIMEOUT_MS)?;
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));

        Ok(Self {
            hosts,
            client_id,
            timeout,
            randomize_hosts: env_bool("KAFKA_RANDOMIZE_HOSTS", defaults.randomize_hosts),
        })
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match collect_hosts(&self.hosts, false) {
            Ok(hosts) if hosts.is_empty() => errors.push("hosts must not be empty".to_string()),
            Ok(_) => {}
            Err(e) => errors.push(e.to_string()),
        }

        if self.client_id.len() > i16::MAX as usize {
            errors.push(format!(
                "client_id ({} bytes) does not fit a protocol string",
                self.client_id.len()
            ));
        }

        if self.timeout == Some(Duration::ZERO) {
            errors.push("timeout must be positive; use None to disable it".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Producer behaviour.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// `0`, `1` or `-1`; see [`ACK_AFTER_LOCAL_WRITE`].
    pub req_acks: i16,
    pub ack_timeout_ms: i32,
    pub codec: CodecKind,
    /// Use xerial framing for snappy payloads.
    pub snappy_xerial: bool,
    pub async_send: bool,
    /// Batch in the background; implies `async_send`.
    pub batch_send: bool,
    pub batch_send_every_n: usize,
    pub batch_send_every_t: Duration,
    /// Start the unkeyed partition cycle at a random partition.
    pub random_start: bool,
    /// Raise per-partition broker errors from synchronous sends.
    pub sync_fail_on_error: bool,
    /// Grace given to the background worker on stop.
    pub stop_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            req_acks: ACK_AFTER_LOCAL_WRITE,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            codec: CodecKind::None,
            snappy_xerial: false,
            async_send: false,
            batch_send: false,
            batch_send_every_n: BATCH_SEND_MSG_COUNT,
            batch_send_every_t: Duration::from_secs(BATCH_SEND_DEFAULT_INTERVAL_SECS),
            random_start: true,
            sync_fail_on_error: true,
            stop_timeout: Duration::from_millis(DEFAULT_PRODUCER_STOP_TIMEOUT_MS),
        }
    }
}

impl ProducerConfig {
    /// Whether publishing goes through the background worker.
    pub fn is_async(&self) -> bool {
        self.async_send || self.batch_send
    }

    /// Count and time flush triggers of the background worker.
    pub fn batch_triggers(&self) -> (usize, Duration) {
        if self.batch_send {
            (self.batch_send_every_n, self.batch_send_every_t)
        } else {
            (1, Duration::from_secs(UNBATCHED_SEND_INTERVAL_SECS))
        }
    }

    pub fn from_env() -> EnvResult<Self> {
        let defaults = Self::default();

        let codec = match std::env::var("KAFKA_PRODUCER_CODEC") {
            Ok(v) => v.parse::<CodecKind>()?,
            Err(_) => defaults.codec,
        };

        let batch_t_ms: u64 = env_parse(
            "KAFKA_PRODUCER_BATCH_T_MS",
            defaults.batch_send_every_t.as_millis() as u64,
        )?;
        let stop_ms: u64 = env_parse(
            "KAFKA_PRODUCER_STOP_TIMEOUT_MS",
            defaults.stop_timeout.as_millis() as u64,
        )?;

        Ok(Self {
            req_acks: env_parse("KAFKA_PRODUCER_ACKS", defaults.req_acks)?,
            ack_timeout_ms: env_parse("KAFKA_PRODUCER_ACK_TIMEOUT_MS", defaults.ack_timeout_ms)?,
            codec,
            snappy_xerial: env_bool("KAFKA_PRODUCER_SNAPPY_XERIAL", defaults.snappy_xerial),
            async_send: env_bool("KAFKA_PRODUCER_ASYNC", defaults.async_send),
            batch_send: env_bool("KAFKA_PRODUCER_BATCH_SEND", defaults.batch_send),
            batch_send_every_n: env_parse("KAFKA_PRODUCER_BATCH_N", defaults.batch_send_every_n)?,
            batch_send_every_t: Duration::from_millis(batch_t_ms),
            random_start: env_bool("KAFKA_PRODUCER_RANDOM_START", defaults.random_start),
            sync_fail_on_error: defaults.sync_fail_on_error,
            stop_timeout: Duration::from_millis(stop_ms),
        })
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if ![ACK_NOT_REQUIRED, ACK_AFTER_LOCAL_WRITE, ACK_AFTER_CLUSTER_COMMIT].contains(&self.req_acks) {
            errors.push(format!("req_acks ({}) must be one of 0, 1, -1", self.req_acks));
        }

        if self.ack_timeout_ms < 0 {
            errors.push(format!(
                "ack_timeout_ms ({}) must not be negative",
                self.ack_timeout_ms
            ));
        }

        if !self.codec.is_available() {
            errors.push(format!("codec {:?} is not compiled into this build", self.codec));
        }

        if self.batch_send {
            if self.batch_send_every_n == 0 {
                errors.push("batch_send_every_n must be at least 1".to_string());
            }
            if self.batch_send_every_t.is_zero() {
                errors.push("batch_send_every_t must be positive".to_string());
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Where a consumer restarts when its offset is no longer retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Jump to the next offset to be written.
    #[default]
    Largest,
    /// Jump to the oldest retained offset.
    Smallest,
    /// Surface the out-of-range error.
    None,
}

impl FromStr for OffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "largest" | "latest" => Ok(OffsetReset::Largest),
            "smallest" | "earliest" => Ok(OffsetReset::Smallest),
            "none" => Ok(OffsetReset::None),
            other => Err(Error::Config(format!("unknown offset reset '{}'", other))),
        }
    }
}

/// Fetching and offset tracking of a consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub auto_commit: bool,
    /// Commit after this many consumed messages.
    pub auto_commit_every_n: Option<usize>,
    /// Commit after this much time without a commit.
    pub auto_commit_every_t: Option<Duration>,
    /// `min_bytes` of an explicit [`SimpleConsumer::fetch`](crate::consumer::SimpleConsumer::fetch).
    pub fetch_size_bytes: i32,
    /// Initial per-partition fetch budget.
    pub buffer_size: i32,
    /// Ceiling for budget growth; `None` grows without bound.
    pub max_buffer_size: Option<i32>,
    pub fetch_max_wait_time_ms: i32,
    pub auto_offset_reset: OffsetReset,
    /// Partitions to consume; `None` consumes every partition of the topic.
    pub partitions: Option<Vec<i32>>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            auto_commit: true,
            auto_commit_every_n: Some(AUTO_COMMIT_MSG_COUNT),
            auto_commit_every_t: Some(Duration::from_millis(AUTO_COMMIT_INTERVAL_MS)),
            fetch_size_bytes: FETCH_MIN_BYTES,
            buffer_size: FETCH_BUFFER_SIZE_BYTES,
            max_buffer_size: Some(MAX_FETCH_BUFFER_SIZE_BYTES),
            fetch_max_wait_time_ms: FETCH_MAX_WAIT_TIME_MS,
            auto_offset_reset: OffsetReset::Largest,
            partitions: None,
        }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> EnvResult<Self> {
        let defaults = Self::default();

        let every_n: usize = env_parse(
            "KAFKA_CONSUMER_AUTO_COMMIT_N",
            defaults.auto_commit_every_n.unwrap_or(0),
        )?;
        let every_t_ms: u64 = env_parse(
            "KAFKA_CONSUMER_AUTO_COMMIT_T_MS",
            defaults
                .auto_commit_every_t
                .map(|t| t.as_millis() as u64)
                .unwrap_or(0),
        )?;
        let max_buffer: i32 = env_parse(
            "KAFKA_CONSUMER_MAX_BUFFER_SIZE",
            defaults.max_buffer_size.unwrap_or(0),
        )?;

        let auto_offset_reset = match std::env::var("KAFKA_CONSUMER_AUTO_OFFSET_RESET") {
            Ok(v) => v.parse::<OffsetReset>()?,
            Err(_) => defaults.auto_offset_reset,
        };

        let partitions = match std::env::var("KAFKA_CONSUMER_PARTITIONS") {
            Ok(v) => Some(
                v.split(',')
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(|p| {
                        p.parse::<i32>()
                            .map_err(|e| format!("Invalid KAFKA_CONSUMER_PARTITIONS: {}", e))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            auto_commit: env_bool("KAFKA_CONSUMER_AUTO_COMMIT", defaults.auto_commit),
            auto_commit_every_n: (every_n > 0).then_some(every_n),
            auto_commit_every_t: (every_t_ms > 0).then(|| Duration::from_millis(every_t_ms)),
            fetch_size_bytes: env_parse("KAFKA_CONSUMER_FETCH_MIN_BYTES", defaults.fetch_size_bytes)?,
            buffer_size: env_parse("KAFKA_CONSUMER_BUFFER_SIZE", defaults.buffer_size)?,
            max_buffer_size: (max_buffer > 0).then_some(max_buffer),
            fetch_max_wait_time_ms: env_parse(
                "KAFKA_CONSUMER_FETCH_MAX_WAIT_MS",
                defaults.fetch_max_wait_time_ms,
            )?,
            auto_offset_reset,
            partitions,
        })
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.buffer_size <= 0 {
            errors.push(format!("buffer_size ({}) must be positive", self.buffer_size));
        }

        if let Some(max) = self.max_buffer_size {
            if self.buffer_size > max {
                errors.push(format!(
                    "buffer_size ({}) must not exceed max_buffer_size ({})",
                    self.buffer_size, max
                ));
            }
        }

        if self.fetch_size_bytes < 0 {
            errors.push(format!(
                "fetch_size_bytes ({}) must not be negative",
                self.fetch_size_bytes
            ));
        }

        if self.fetch_max_wait_time_ms < 0 {
            errors.push(format!(
                "fetch_max_wait_time_ms ({}) must not be negative",
                self.fetch_max_wait_time_ms
            ));
        }

        if self.auto_commit_every_n == Some(0) {
            errors.push("auto_commit_every_n must be at least 1; use None to disable it".to_string());
        }

        if self.auto_commit_every_t == Some(Duration::ZERO) {
            errors.push("auto_commit_every_t must be positive; use None to disable it".to_string());
        }

        if self
            .partitions
            .as_ref()
            .is_some_and(|partitions| partitions.iter().any(|p| *p < 0))
        {
            errors.push("partition ids must not be negative".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Worker layout of a [`MultiProcessConsumer`](crate::consumer::MultiProcessConsumer).
#[derive(Debug, Clone)]
pub struct MultiProcessConfig {
    pub num_workers: usize,
    /// When non-zero, overrides `num_workers` with `ceil(partitions / partitions_per_worker)`.
    pub partitions_per_worker: usize,
    pub queue_capacity: usize,
    /// Time each worker gets to exit on stop before it is aborted.
    pub worker_grace: Duration,
    /// Ceiling of a failing worker's restart backoff.
    pub max_backoff: Duration,
}

impl Default for MultiProcessConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            partitions_per_worker: 0,
            queue_capacity: MULTIPROCESS_QUEUE_CAPACITY,
            worker_grace: Duration::from_secs(1),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECS),
        }
    }
}

impl MultiProcessConfig {
    /// Number of workers needed for `partition_count` partitions.
    pub fn worker_count(&self, partition_count: usize) -> usize {
        if self.partitions_per_worker > 0 {
            partition_count.div_ceil(self.partitions_per_worker)
        } else {
            self.num_workers
        }
    }

    pub fn from_env() -> EnvResult<Self> {
        let defaults = Self::default();

        Ok(Self {
            num_workers: env_parse("KAFKA_CONSUMER_WORKERS", defaults.num_workers)?,
            partitions_per_worker: env_parse(
                "KAFKA_CONSUMER_PARTITIONS_PER_WORKER",
                defaults.partitions_per_worker,
            )?,
            queue_capacity: env_parse("KAFKA_CONSUMER_QUEUE_CAPACITY", defaults.queue_capacity)?,
            ..defaults
        })
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.num_workers == 0 && self.partitions_per_worker == 0 {
            errors.push("num_workers must be at least 1".to_string());
        }

        if self.queue_capacity == 0 {
            errors.push("queue_capacity must be at least 1".to_string());
        }

        if self.max_backoff.is_zero() {
            errors.push("max_backoff must be positive".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
