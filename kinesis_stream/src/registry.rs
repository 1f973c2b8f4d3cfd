//! Publishes shards to the consumer as the client library hands out leases.
use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    Error,
    buffer::{ShardBuffer, ShardReceiver, WeakQueueHandle},
    checkpoint::CheckpointTracker,
    kcl::RecordProcessorCheckpointer,
    signal::Signal,
};

/// A shard whose records are ready to be consumed.
#[derive(Debug)]
pub(crate) struct DiscoveredShard {
    pub(crate) receiver: ShardReceiver,
    pub(crate) tracker: Arc<CheckpointTracker>,
}

/// The consumer side of the registry.
pub(crate) type ShardDiscovery = mpsc::UnboundedReceiver<Signal<DiscoveredShard>>;

/// Registry of the shards leased during a run.
///
/// Cheap to clone; every shard processor holds a clone. The channel is unbounded since the number
/// of shards is bounded by the stream itself. Shards ending does not end the registry, only
/// [`shutdown`](Self::shutdown) does.
#[derive(Debug, Clone)]
pub struct ShardRegistry {
    tx: mpsc::UnboundedSender<Signal<DiscoveredShard>>,
    max_shard_buffer_size: NonZeroUsize,
    /// Buffers of the shards still being delivered or consumed.
    queues: Arc<Mutex<Vec<WeakQueueHandle>>>,
    is_shutdown: Arc<AtomicBool>,
}

impl ShardRegistry {
    pub(crate) fn new(max_shard_buffer_size: NonZeroUsize) -> (Self, ShardDiscovery) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            tx,
            max_shard_buffer_size,
            queues: Default::default(),
            is_shutdown: Arc::new(AtomicBool::new(false)),
        };
        (registry, rx)
    }

    /// Create the buffer and tracker of a newly leased shard and publish them to the consumer.
    ///
    /// Returns the producer end, which the shard's processor feeds.
    pub fn new_shard(
        &self,
        shard_id: impl Into<String>,
        checkpointer: Arc<dyn RecordProcessorCheckpointer>,
    ) -> ShardBuffer {
        let shard_id = shard_id.into();
        let tracker = Arc::new(CheckpointTracker::new(shard_id.clone(), checkpointer));
        let (buffer, receiver) =
            ShardBuffer::new(shard_id.clone(), self.max_shard_buffer_size, Arc::clone(&tracker));
        {
            let mut queues = self.queues.lock();
            queues.retain(|q| !q.is_dropped());
            queues.push(buffer.queue_handle().downgrade());
        }

        let shard = DiscoveredShard { receiver, tracker };
        if self.tx.send(Signal::Value(shard)).is_err() {
            // Dropping the unsent shard closes its buffer, so deliveries to it are discarded.
            debug!(%shard_id, "shard consumer gone, shard will not be consumed");
        } else {
            info!(%shard_id, "discovered shard");
        }
        buffer
    }

    /// End shard discovery once the already published shards have been consumed.
    ///
    /// Only the first call has an effect; it returns `true`.
    pub fn shutdown(&self, cause: Option<Error>) -> bool {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            debug!("shard registry already shut down");
            return false;
        }
        info!(failed = cause.is_some(), "shutting down shard registry");
        if self.tx.send(Signal::End(cause)).is_err() {
            debug!("shard consumer gone before registry shutdown");
        }
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Close the buffer of every shard seen so far, unblocking worker threads stuck on a full
    /// buffer.
    pub fn shutdown_queues(&self) {
        let queues = self.queues.lock();
        debug!(n_shards = queues.len(), "closing all shard buffers");
        for queue in queues.iter().filter_map(WeakQueueHandle::upgrade) {
            queue.close();
        }
    }
}
