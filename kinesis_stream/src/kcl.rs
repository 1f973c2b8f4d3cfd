//! The callback contract of the client library that owns leases, shard discovery and the
//! checkpoint store.
//!
//! The library drives one [`ShardRecordProcessor`] per leased shard from its own worker threads
//! and hands each of them a [`RecordProcessorCheckpointer`] for committing progress. Everything in
//! this module is implemented by the library (or by [`crate::mock`] in tests); the bridge only
//! consumes it.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use kinesis_stream_clap_blocks::consumer::{ConfigError, ConsumerConfig, InitialPosition};

/// Generic boxed error type used where the failure comes from the client library.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Position of a record within its shard.
///
/// Records unpacked from an aggregated record share a sequence number and are told apart by their
/// sub-sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtendedSequenceNumber {
    pub sequence_number: String,
    pub sub_sequence_number: Option<u64>,
}

impl ExtendedSequenceNumber {
    pub fn new(sequence_number: impl Into<String>, sub_sequence_number: Option<u64>) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            sub_sequence_number,
        }
    }
}

impl fmt::Display for ExtendedSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_sequence_number {
            Some(sub) => write!(f, "{}.{sub}", self.sequence_number),
            None => write!(f, "{}", self.sequence_number),
        }
    }
}

/// Server-side encryption applied to a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncryptionType {
    #[default]
    None,
    Kms,
}

/// A record as delivered by the client library, before its payload is deserialized.
#[derive(Debug, Clone, PartialEq)]
pub struct KinesisClientRecord {
    pub sequence_number: String,
    /// Zero unless the record was unpacked from an aggregated record.
    pub sub_sequence_number: u64,
    pub approximate_arrival_timestamp: DateTime<Utc>,
    pub data: Bytes,
    pub partition_key: String,
    pub encryption_type: EncryptionType,
    /// Empty when the producer did not set one.
    pub explicit_hash_key: String,
    pub aggregated: bool,
}

impl KinesisClientRecord {
    /// The checkpoint position of this record.
    pub fn extended_sequence_number(&self) -> ExtendedSequenceNumber {
        ExtendedSequenceNumber::new(
            self.sequence_number.clone(),
            (self.sub_sequence_number != 0).then_some(self.sub_sequence_number),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The lease was handed to another worker, or the worker is shutting down.
    ///
    /// Whoever holds the lease now owns the shard's progress, so there is nothing left to commit.
    #[error("lease lost or worker shutting down")]
    ShutdownOrLeaseLost,

    #[error("invalid checkpoint state: {0}")]
    InvalidState(String),

    #[error("checkpoint store error: {0}")]
    External(#[source] BoxError),
}

impl CheckpointError {
    /// Whether the failure only says the lease has already moved on.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::ShutdownOrLeaseLost)
    }
}

/// Handle for committing a shard's progress, provided by the client library.
///
/// Calls block the calling thread until the checkpoint store has acknowledged them.
pub trait RecordProcessorCheckpointer: fmt::Debug + Send + Sync + 'static {
    /// Commit `position` as the last processed record of the shard.
    fn checkpoint(&self, position: &ExtendedSequenceNumber) -> Result<(), CheckpointError>;

    /// Mark the shard as fully consumed so that its child shards can be leased.
    fn checkpoint_at_shard_end(&self) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone)]
pub struct InitializationInput {
    pub shard_id: String,
    /// Checkpoint the shard is resumed from, if there is one.
    pub extended_sequence_number: Option<ExtendedSequenceNumber>,
}

#[derive(Debug, Clone)]
pub struct ProcessRecordsInput {
    pub records: Vec<KinesisClientRecord>,
    pub checkpointer: Arc<dyn RecordProcessorCheckpointer>,
    pub millis_behind_latest: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LeaseLostInput;

#[derive(Debug, Clone)]
pub struct ShardEndedInput {
    pub checkpointer: Arc<dyn RecordProcessorCheckpointer>,
}

#[derive(Debug, Clone)]
pub struct ShutdownRequestedInput {
    pub checkpointer: Arc<dyn RecordProcessorCheckpointer>,
}

/// Callbacks the client library invokes for one leased shard.
///
/// The library calls these sequentially from one thread at a time for a given shard, and
/// concurrently across shards. None of them can report an error back: the library treats a
/// returned `process_records` call as delivered.
pub trait ShardRecordProcessor: Send + 'static {
    fn initialize(&mut self, input: InitializationInput);

    fn process_records(&mut self, input: ProcessRecordsInput);

    fn lease_lost(&mut self, input: LeaseLostInput);

    /// The shard has been closed and every record of it delivered.
    ///
    /// The library requires a checkpoint at shard end before this returns, otherwise the child
    /// shards are never leased.
    fn shard_ended(&mut self, input: ShardEndedInput);

    fn shutdown_requested(&mut self, input: ShutdownRequestedInput);
}

/// Creates a [`ShardRecordProcessor`] each time the worker takes a lease.
pub trait ShardRecordProcessorFactory: fmt::Debug + Send + Sync + 'static {
    fn shard_record_processor(&self) -> Box<dyn ShardRecordProcessor>;
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to build scheduler: {0}")]
    Build(#[source] BoxError),

    #[error("scheduler run loop failed: {0}")]
    Run(#[source] BoxError),

    #[error("graceful shutdown failed: {0}")]
    Shutdown(#[source] BoxError),
}

/// The worker of the client library.
#[async_trait]
pub trait Scheduler: fmt::Debug + Send + Sync + 'static {
    /// Run the worker until it is shut down.
    ///
    /// This blocks the calling thread for the whole lifetime of the worker.
    fn run(&self) -> Result<(), SchedulerError>;

    /// Ask the worker to release its leases and stop.
    ///
    /// Resolves once every shard processor has handled `shutdown_requested`. The returned flag is
    /// `false` if the worker stopped without completing the handshake.
    async fn start_graceful_shutdown(&self) -> Result<bool, SchedulerError>;
}

/// The part of [`ConsumerConfig`] a client library needs to build its own configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub stream_name: String,
    pub application_name: String,
    pub worker_identifier: String,
    pub initial_position: InitialPosition,
    pub lease_table_name: String,
    pub metrics_namespace: Option<String>,
}

impl TryFrom<&ConsumerConfig> for SchedulerSettings {
    type Error = ConfigError;

    fn try_from(config: &ConsumerConfig) -> Result<Self, Self::Error> {
        config.validate()?;
        Ok(Self {
            stream_name: config.stream_name.clone(),
            application_name: config.application_name.clone(),
            worker_identifier: config.worker_identifier.clone(),
            initial_position: config.resolved_initial_position()?,
            lease_table_name: config.lease_table_name().to_string(),
            metrics_namespace: config.metrics_namespace.clone(),
        })
    }
}

/// Entry point into a client library.
pub trait ClientLibrary: fmt::Debug + Send + Sync + 'static {
    /// The library's own configuration.
    ///
    /// Opaque to the bridge, callers can adjust it before the run starts.
    type Config: Send + 'static;

    /// Build the library's default configuration for `settings`.
    fn config(&self, settings: &SchedulerSettings) -> Self::Config;

    /// Build a worker that creates its shard processors with `factory`.
    fn scheduler(
        &self,
        config: Self::Config,
        factory: Arc<dyn ShardRecordProcessorFactory>,
    ) -> Result<Arc<dyn Scheduler>, SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_sequence_number_display() {
        assert_eq!(ExtendedSequenceNumber::new("49590", None).to_string(), "49590");
        assert_eq!(
            ExtendedSequenceNumber::new("49590", Some(3)).to_string(),
            "49590.3"
        );
    }

    #[test]
    fn test_sub_sequence_number_only_when_nonzero() {
        let mut record = KinesisClientRecord {
            sequence_number: "100".to_string(),
            sub_sequence_number: 0,
            approximate_arrival_timestamp: Utc::now(),
            data: Bytes::from_static(b"x"),
            partition_key: "pk".to_string(),
            encryption_type: EncryptionType::None,
            explicit_hash_key: String::new(),
            aggregated: false,
        };
        assert_eq!(
            record.extended_sequence_number(),
            ExtendedSequenceNumber::new("100", None)
        );

        record.sub_sequence_number = 7;
        assert_eq!(
            record.extended_sequence_number(),
            ExtendedSequenceNumber::new("100", Some(7))
        );
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = ConsumerConfig::new("clicks", "click-counter");
        config.worker_identifier = "worker-1".to_string();
        config.metrics_namespace = Some("ns".to_string());

        let settings = SchedulerSettings::try_from(&config).unwrap();
        assert_eq!(
            settings,
            SchedulerSettings {
                stream_name: "clicks".to_string(),
                application_name: "click-counter".to_string(),
                worker_identifier: "worker-1".to_string(),
                initial_position: InitialPosition::Latest,
                lease_table_name: "click-counter".to_string(),
                metrics_namespace: Some("ns".to_string()),
            }
        );

        config.application_name.clear();
        assert!(SchedulerSettings::try_from(&config).is_err());
    }
}
