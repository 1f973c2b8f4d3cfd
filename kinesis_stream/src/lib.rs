//! Consume a Kinesis data stream as a stream of shards.
//!
//! The Kinesis client library leases shards to a worker and pushes their records into callbacks
//! on its own thread pool. [`start`] runs such a worker and turns those callbacks into a
//! [`ShardStream`]: each leased shard is yielded as a [`Shard`], whose records are pulled from a
//! bounded buffer. A consumer falling behind on a shard blocks the worker thread feeding it, so
//! the library fetches that shard no faster than it is processed.
//!
//! A shard's progress is checkpointed automatically once its records have been drained, and can
//! be checkpointed earlier through its [`Checkpointer`]. Checkpointing a shard whose lease has
//! moved on to another worker is not an error.
//!
//! The client library itself is abstracted by the traits in [`kcl`]; [`mock`] provides an
//! in-memory implementation.

pub mod buffer;
pub mod checkpoint;
mod error;
pub mod kcl;
pub mod mock;
pub mod processor;
pub mod record;
pub mod registry;
mod signal;
pub mod supervisor;

pub use buffer::{ShardRecords, StopReason};
pub use checkpoint::Checkpointer;
pub use error::{Error, Result};
pub use kinesis_stream_clap_blocks::consumer::{
    ConsumerConfig, InitialPosition, ShardFailurePolicy,
};
pub use record::{BytesDeserializer, JsonDeserializer, Record, RecordDeserializer, Utf8Deserializer};
pub use supervisor::{Shard, ShardStream, start};
