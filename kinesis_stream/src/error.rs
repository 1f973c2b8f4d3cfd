use kinesis_stream_clap_blocks::consumer::ConfigError;

use crate::kcl::{BoxError, CheckpointError, SchedulerError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to deserialize record {sequence_number} of shard {shard_id}: {source}")]
    Deserialize {
        shard_id: String,
        sequence_number: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to checkpoint shard {shard_id}: {source}")]
    Checkpoint {
        shard_id: String,
        #[source]
        source: CheckpointError,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("shard {shard_id} failed: {message}")]
    ShardFailed { shard_id: String, message: String },

    #[error("{task} task failed: {message}")]
    TaskFailed {
        task: &'static str,
        message: String,
    },

    #[error("invalid consumer configuration: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// The shard an error is scoped to, if any.
    pub fn shard_id(&self) -> Option<&str> {
        match self {
            Self::Deserialize { shard_id, .. }
            | Self::Checkpoint { shard_id, .. }
            | Self::ShardFailed { shard_id, .. } => Some(shard_id),
            Self::Scheduler(_) | Self::TaskFailed { .. } | Self::Config(_) => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
