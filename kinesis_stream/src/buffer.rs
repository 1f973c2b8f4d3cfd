//! The per-shard channel between the worker thread delivering a shard and the task consuming it.
//!
//! The producer end, [`ShardBuffer`], is driven synchronously from the client library's worker
//! thread. The consumer end is exposed as the [`ShardRecords`] stream. The channel is bounded, so
//! a consumer that falls behind blocks the worker thread delivering its shard, which in turn
//! throttles how fast the client library fetches that shard.
use std::{
    fmt,
    num::NonZeroUsize,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::{Stream, StreamExt, stream::BoxStream};
use kinesis_stream_clap_blocks::consumer::ShardFailurePolicy;
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    Error, Result,
    checkpoint::{CheckpointTracker, checkpoint_on_completion},
    kcl::KinesisClientRecord,
    record::{Record, RecordDeserializer},
    signal::Signal,
    supervisor::FailureReporter,
};

/// Why a shard stops being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The worker is shutting down and releases the lease.
    ShutdownRequested,
    /// The shard was closed, e.g., by a resharding, and every record of it has been delivered.
    ShardEnded,
    /// Another worker took the lease.
    LeaseLost,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShutdownRequested => write!(f, "shutdown requested"),
            Self::ShardEnded => write!(f, "shard ended"),
            Self::LeaseLost => write!(f, "lease lost"),
        }
    }
}

type RecordSignal = Signal<KinesisClientRecord>;

/// Shared access to the receiving half of a shard's channel.
///
/// Lets the producer end discard what is still buffered, and lets the registry close the channels
/// of every shard at once.
#[derive(Debug, Clone)]
pub(crate) struct QueueHandle(Arc<Mutex<mpsc::Receiver<RecordSignal>>>);

/// A [`QueueHandle`] that does not keep the channel alive once both of its ends are gone.
#[derive(Debug)]
pub(crate) struct WeakQueueHandle(Weak<Mutex<mpsc::Receiver<RecordSignal>>>);

impl WeakQueueHandle {
    pub(crate) fn upgrade(&self) -> Option<QueueHandle> {
        self.0.upgrade().map(QueueHandle)
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl QueueHandle {
    pub(crate) fn downgrade(&self) -> WeakQueueHandle {
        WeakQueueHandle(Arc::downgrade(&self.0))
    }

    /// Close the channel. Buffered signals can still be received.
    pub(crate) fn close(&self) {
        self.0.lock().close();
    }

    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Option<RecordSignal>> {
        self.0.lock().poll_recv(cx)
    }

    /// Discard buffered signals, returning how many records were among them.
    fn drain(&self) -> usize {
        let mut rx = self.0.lock();
        let mut n_discarded = 0;
        while let Ok(signal) = rx.try_recv() {
            if matches!(signal, Signal::Value(_)) {
                n_discarded += 1;
            }
        }
        n_discarded
    }
}

/// The consumer end of a shard's channel. The channel closes when this is dropped.
#[derive(Debug)]
pub(crate) struct ShardReceiver {
    shard_id: String,
    queue: QueueHandle,
}

impl ShardReceiver {
    pub(crate) fn shard_id(&self) -> &str {
        &self.shard_id
    }

    async fn recv(&self) -> Option<RecordSignal> {
        futures::future::poll_fn(|cx| self.queue.poll_recv(cx)).await
    }

    fn close(&self) {
        self.queue.close();
    }
}

impl Drop for ShardReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

/// The producing half of a shard's channel, owned by the shard's processor.
///
/// None of the methods return errors: they run on the client library's worker thread, which has
/// nowhere to send them.
#[derive(Debug)]
pub struct ShardBuffer {
    shard_id: String,
    tx: mpsc::Sender<RecordSignal>,
    queue: QueueHandle,
    tracker: Arc<CheckpointTracker>,
    stopped: AtomicBool,
}

impl ShardBuffer {
    pub(crate) fn new(
        shard_id: impl Into<String>,
        capacity: NonZeroUsize,
        tracker: Arc<CheckpointTracker>,
    ) -> (Self, ShardReceiver) {
        let shard_id = shard_id.into();
        let (tx, rx) = mpsc::channel(capacity.get());
        let queue = QueueHandle(Arc::new(Mutex::new(rx)));

        let receiver = ShardReceiver {
            shard_id: shard_id.clone(),
            queue: queue.clone(),
        };
        let buffer = Self {
            shard_id,
            tx,
            queue,
            tracker,
            stopped: AtomicBool::new(false),
        };
        (buffer, receiver)
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Whether the buffer accepts no more records, either because it was stopped or because the
    /// consumer went away.
    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.tx.is_closed()
    }

    pub(crate) fn queue_handle(&self) -> QueueHandle {
        self.queue.clone()
    }

    /// Enqueue a batch of records delivered by the client library.
    ///
    /// Blocks the calling thread while the buffer is full. Must not be called from within an
    /// async context.
    pub fn offer_records(&self, records: Vec<KinesisClientRecord>) {
        if self.is_closed() {
            debug!(
                shard_id = %self.shard_id,
                n_records = records.len(),
                "shard buffer closed, discarding late records"
            );
            return;
        }
        let Some(last) = records.last() else {
            return;
        };
        self.tracker
            .set_max_sequence_number(last.extended_sequence_number());

        let n_records = records.len();
        for (offered, record) in records.into_iter().enumerate() {
            if self.tx.blocking_send(Signal::Value(record)).is_err() {
                // The consumer stopped reading this shard while the run goes on.
                debug!(
                    shard_id = %self.shard_id,
                    n_discarded = n_records - offered,
                    "shard consumer hung up, discarding rest of batch"
                );
                return;
            }
        }
    }

    /// Stop delivering the shard and wait for the consumer to finish with it.
    ///
    /// An ended shard keeps what is buffered so the consumer sees its final records, any other
    /// reason discards it. Returns once the consumer has closed its end.
    pub fn stop(&self, reason: StopReason) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!(shard_id = %self.shard_id, %reason, "shard buffer already stopped");
            return;
        }

        match reason {
            StopReason::ShardEnded => self.tracker.mark_end_of_shard(),
            StopReason::ShutdownRequested | StopReason::LeaseLost => {
                let n_discarded = self.queue.drain();
                if n_discarded > 0 {
                    info!(
                        shard_id = %self.shard_id,
                        %reason,
                        n_discarded,
                        "discarded undelivered records"
                    );
                }
            }
        }

        if self.tx.blocking_send(Signal::End(None)).is_err() {
            debug!(shard_id = %self.shard_id, "shard consumer already closed");
        }

        // Completes straight away if the consumer closed its end first.
        futures::executor::block_on(self.tx.closed());
        info!(shard_id = %self.shard_id, %reason, "stopped shard");
    }

    /// Close the channel, waking a producer blocked on a full buffer and a consumer waiting for
    /// records.
    pub fn shutdown_queue(&self) {
        self.queue.close();
    }
}

/// The records of one shard, in the order the client library delivered them.
///
/// Ends when the shard is stopped. When it ends, by completing or by failing, the shard's
/// progress is checkpointed before the stream reports the end. Dropping it early closes the
/// shard's buffer, after which further deliveries are discarded.
pub struct ShardRecords<T> {
    shard_id: String,
    inner: BoxStream<'static, Result<Record<T>>>,
}

impl<T> ShardRecords<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(
        receiver: ShardReceiver,
        tracker: Arc<CheckpointTracker>,
        deserializer: Arc<dyn RecordDeserializer<T>>,
        failures: FailureReporter,
        policy: ShardFailurePolicy,
    ) -> Self {
        let shard_id = receiver.shard_id().to_string();
        let reader = ShardReader {
            receiver,
            tracker,
            deserializer,
            failures,
            policy,
        };
        let inner = futures::stream::unfold(Some(reader), |reader| async move {
            let mut reader = reader?;
            match reader.next().await {
                Step::Record(record) => Some((Ok(record), Some(reader))),
                Step::Failed(e) => Some((Err(e), None)),
                Step::Finished => None,
            }
        })
        .boxed();

        Self { shard_id, inner }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }
}

impl<T> Stream for ShardRecords<T> {
    type Item = Result<Record<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> fmt::Debug for ShardRecords<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardRecords")
            .field("shard_id", &self.shard_id)
            .finish_non_exhaustive()
    }
}

enum Step<T> {
    Record(Record<T>),
    Failed(Error),
    Finished,
}

struct ShardReader<T> {
    receiver: ShardReceiver,
    tracker: Arc<CheckpointTracker>,
    deserializer: Arc<dyn RecordDeserializer<T>>,
    failures: FailureReporter,
    policy: ShardFailurePolicy,
}

impl<T: 'static> ShardReader<T> {
    async fn next(&mut self) -> Step<T> {
        match self.receiver.recv().await {
            Some(Signal::Value(raw)) => match self.deserializer.deserialize(&raw.data) {
                Ok(data) => {
                    self.tracker.mark_delivered(raw.extended_sequence_number());
                    Step::Record(Record::new(self.receiver.shard_id(), raw, data))
                }
                Err(source) => {
                    let e = Error::Deserialize {
                        shard_id: self.receiver.shard_id().to_string(),
                        sequence_number: raw.extended_sequence_number().to_string(),
                        source,
                    };
                    if self.policy == ShardFailurePolicy::AbortRun {
                        self.failures.shard_failed(&e);
                    }
                    self.finish(Some(e)).await
                }
            },
            Some(Signal::End(cause)) => self.finish(cause).await,
            None => self.finish(None).await,
        }
    }

    /// Checkpoint the shard and close the channel, releasing a producer waiting in `stop`.
    async fn finish(&mut self, failure: Option<Error>) -> Step<T> {
        let committed = checkpoint_on_completion(Arc::clone(&self.tracker)).await;
        self.receiver.close();

        if let Err(e) = &committed {
            error!(shard_id = %self.receiver.shard_id(), %e, "completion checkpoint failed");
            self.failures.report(Error::ShardFailed {
                shard_id: self.receiver.shard_id().to_string(),
                message: e.to_string(),
            });
        }

        match (failure, committed) {
            (Some(e), _) => {
                warn!(shard_id = %self.receiver.shard_id(), %e, "shard record stream failed");
                Step::Failed(e)
            }
            (None, Err(e)) => Step::Failed(e),
            (None, Ok(())) => {
                debug!(shard_id = %self.receiver.shard_id(), "shard record stream completed");
                Step::Finished
            }
        }
    }
}
