//! CLI config for a shard consumer run.

use std::{num::NonZeroUsize, time::Duration};

use chrono::{DateTime, Utc};

/// Default number of records buffered per shard before the delivering worker thread blocks.
pub const DEFAULT_MAX_SHARD_BUFFER_SIZE: NonZeroUsize = NonZeroUsize::new(1024).unwrap();

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("--initial-position at-timestamp requires --initial-position-timestamp")]
    MissingInitialTimestamp,

    #[error("--initial-position-timestamp is only valid with --initial-position at-timestamp")]
    UnexpectedInitialTimestamp,

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Where a worker starts reading a shard that has no checkpoint yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum InitialPositionArg {
    /// Start after the most recent record in the shard.
    #[default]
    Latest,

    /// Start at the oldest record still retained by the stream.
    TrimHorizon,

    /// Start at the first record at or after `--initial-position-timestamp`.
    AtTimestamp,
}

/// Resolved starting position handed to the client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialPosition {
    Latest,
    TrimHorizon,
    AtTimestamp(DateTime<Utc>),
}

/// What happens to the rest of the run when one shard's record stream fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ShardFailurePolicy {
    /// Only the failing shard's record stream ends with the error.
    #[default]
    IsolateShard,

    /// The failing shard also tears down the whole run.
    AbortRun,
}

/// CLI config for a shard consumer run.
#[derive(Debug, Clone, clap::Parser)]
pub struct ConsumerConfig {
    /// Name of the stream to consume.
    #[clap(long = "stream-name", env = "KINESIS_STREAM_NAME", action)]
    pub stream_name: String,

    /// Name of the consuming application.
    ///
    /// Workers sharing an application name share the stream's shards between them.
    #[clap(
        long = "application-name",
        env = "KINESIS_STREAM_APPLICATION_NAME",
        action
    )]
    pub application_name: String,

    /// Identity of this worker among the workers of the application.
    ///
    /// Defaults to a random UUID.
    #[clap(
        long = "worker-identifier",
        env = "KINESIS_STREAM_WORKER_IDENTIFIER",
        default_value_t = default_worker_identifier(),
        action
    )]
    pub worker_identifier: String,

    /// Where to start reading shards without a checkpoint.
    #[clap(
        long = "initial-position",
        env = "KINESIS_STREAM_INITIAL_POSITION",
        default_value_t = InitialPositionArg::default(),
        value_enum,
        action
    )]
    pub initial_position: InitialPositionArg,

    /// RFC 3339 timestamp used with `--initial-position at-timestamp`.
    #[clap(
        long = "initial-position-timestamp",
        env = "KINESIS_STREAM_INITIAL_POSITION_TIMESTAMP",
        value_parser = parse_timestamp,
        action
    )]
    pub initial_position_timestamp: Option<DateTime<Utc>>,

    /// Maximum number of records buffered per shard.
    ///
    /// Once a shard's buffer is full the worker thread delivering that shard blocks until the
    /// consumer catches up.
    #[clap(
        long = "max-shard-buffer-size",
        env = "KINESIS_STREAM_MAX_SHARD_BUFFER_SIZE",
        default_value_t = DEFAULT_MAX_SHARD_BUFFER_SIZE,
        action
    )]
    pub max_shard_buffer_size: NonZeroUsize,

    /// Name of the lease table.
    ///
    /// Defaults to the application name.
    #[clap(long = "lease-table-name", env = "KINESIS_STREAM_LEASE_TABLE_NAME", action)]
    pub lease_table_name: Option<String>,

    /// Namespace metrics are published under.
    ///
    /// Defaults to the application name inside the client library.
    #[clap(
        long = "metrics-namespace",
        env = "KINESIS_STREAM_METRICS_NAMESPACE",
        action
    )]
    pub metrics_namespace: Option<String>,

    /// How long to wait for the client library to release leases on shutdown.
    #[clap(
        long = "graceful-shutdown-timeout",
        env = "KINESIS_STREAM_GRACEFUL_SHUTDOWN_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    pub graceful_shutdown_timeout: Duration,

    /// What a failed shard record stream does to the rest of the run.
    #[clap(
        long = "shard-failure-policy",
        env = "KINESIS_STREAM_SHARD_FAILURE_POLICY",
        default_value_t = ShardFailurePolicy::default(),
        value_enum,
        action
    )]
    pub shard_failure_policy: ShardFailurePolicy,
}

impl ConsumerConfig {
    /// Config for consuming `stream_name` as `application_name` with every other setting at its
    /// default.
    pub fn new(stream_name: impl Into<String>, application_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            application_name: application_name.into(),
            worker_identifier: default_worker_identifier(),
            initial_position: InitialPositionArg::default(),
            initial_position_timestamp: None,
            max_shard_buffer_size: DEFAULT_MAX_SHARD_BUFFER_SIZE,
            lease_table_name: None,
            metrics_namespace: None,
            graceful_shutdown_timeout: Duration::from_secs(30),
            shard_failure_policy: ShardFailurePolicy::default(),
        }
    }

    /// Lease table name, falling back to the application name.
    pub fn lease_table_name(&self) -> &str {
        self.lease_table_name
            .as_deref()
            .unwrap_or(&self.application_name)
    }

    /// Combine `--initial-position` and `--initial-position-timestamp`.
    pub fn resolved_initial_position(&self) -> Result<InitialPosition, ConfigError> {
        match (self.initial_position, self.initial_position_timestamp) {
            (InitialPositionArg::AtTimestamp, Some(ts)) => Ok(InitialPosition::AtTimestamp(ts)),
            (InitialPositionArg::AtTimestamp, None) => Err(ConfigError::MissingInitialTimestamp),
            (_, Some(_)) => Err(ConfigError::UnexpectedInitialTimestamp),
            (InitialPositionArg::Latest, None) => Ok(InitialPosition::Latest),
            (InitialPositionArg::TrimHorizon, None) => Ok(InitialPosition::TrimHorizon),
        }
    }

    /// Check the settings that clap cannot check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_name.is_empty() {
            return Err(ConfigError::Empty("stream name"));
        }
        if self.application_name.is_empty() {
            return Err(ConfigError::Empty("application name"));
        }
        if self.worker_identifier.is_empty() {
            return Err(ConfigError::Empty("worker identifier"));
        }
        self.resolved_initial_position().map(|_| ())
    }
}

fn default_worker_identifier() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}
