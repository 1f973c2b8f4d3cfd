//! Runs the client library's worker and exposes the shards it leases as a stream.
//!
//! The worker's run loop blocks, so it lives on tokio's blocking pool while a supervising task
//! waits for a reason to stop it. Whatever the reason, the run is torn down the same way: the
//! worker is asked to shut down gracefully, then the shard registry is shut down, which ends the
//! [`ShardStream`] once the consumer has taken every shard published before.
use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{Stream, StreamExt, stream::BoxStream};
use kinesis_stream_clap_blocks::consumer::{ConsumerConfig, ShardFailurePolicy};
use kinesis_stream_shutdown::ShutdownToken;
use observability_deps::tracing::{debug, error, info, warn};
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    Error, Result,
    buffer::ShardRecords,
    checkpoint::Checkpointer,
    kcl::{ClientLibrary, Scheduler, SchedulerError, SchedulerSettings},
    processor::ProcessorAdapterFactory,
    record::RecordDeserializer,
    registry::{DiscoveredShard, ShardDiscovery, ShardRegistry},
    signal::Signal,
};

/// Escalates failures that cannot be returned to whoever observed them, such as those seen on
/// the client library's worker threads, to the supervising task.
#[derive(Debug, Clone)]
pub(crate) struct FailureReporter {
    tx: mpsc::UnboundedSender<Error>,
}

impl FailureReporter {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Error>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A reporter nobody listens to.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new().0
    }

    pub(crate) fn report(&self, e: Error) {
        if let Err(mpsc::error::SendError(e)) = self.tx.send(e) {
            debug!(%e, "supervisor gone, dropping failure");
        }
    }

    /// Report that a shard's consumer failed in a way that must end the run.
    pub(crate) fn shard_failed(&self, e: &Error) {
        self.report(Error::ShardFailed {
            shard_id: e.shard_id().unwrap_or_default().to_string(),
            message: e.to_string(),
        });
    }
}

/// A shard leased by the worker, ready to be consumed.
pub struct Shard<T> {
    pub shard_id: String,
    pub records: ShardRecords<T>,
    pub checkpointer: Checkpointer,
}

impl<T> fmt::Debug for Shard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("shard_id", &self.shard_id)
            .field("records", &self.records)
            .field("checkpointer", &self.checkpointer)
            .finish()
    }
}

/// The shards of a consumer run, in the order the worker leased them.
///
/// Ends once the run has shut down. If the run failed, the failure is yielded as the final item.
/// Dropping the stream shuts the run down.
pub struct ShardStream<T> {
    inner: BoxStream<'static, Result<Shard<T>>>,
    _cancel_on_drop: DropGuard,
}

impl<T> ShardStream<T>
where
    T: Send + 'static,
{
    fn new(feed: ShardFeed<T>, cancel: CancellationToken) -> Self {
        let inner = futures::stream::unfold(Some(feed), |feed| async move {
            let mut feed = feed?;
            match feed.shards.recv().await {
                Some(Signal::Value(shard)) => {
                    let shard = feed.shard(shard);
                    Some((Ok(shard), Some(feed)))
                }
                Some(Signal::End(Some(e))) => Some((Err(e), None)),
                Some(Signal::End(None)) | None => None,
            }
        })
        .boxed();

        Self {
            inner,
            _cancel_on_drop: cancel.drop_guard(),
        }
    }
}

impl<T> Stream for ShardStream<T> {
    type Item = Result<Shard<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> fmt::Debug for ShardStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardStream").finish_non_exhaustive()
    }
}

/// Turns discovered shards into consumer handles.
struct ShardFeed<T> {
    shards: ShardDiscovery,
    deserializer: Arc<dyn RecordDeserializer<T>>,
    failures: FailureReporter,
    policy: ShardFailurePolicy,
}

impl<T> ShardFeed<T>
where
    T: Send + 'static,
{
    fn shard(&self, shard: DiscoveredShard) -> Shard<T> {
        let DiscoveredShard { receiver, tracker } = shard;
        Shard {
            shard_id: receiver.shard_id().to_string(),
            checkpointer: Checkpointer::new(Arc::clone(&tracker)),
            records: ShardRecords::new(
                receiver,
                tracker,
                Arc::clone(&self.deserializer),
                self.failures.clone(),
                self.policy,
            ),
        }
    }
}

/// Start consuming the stream named in `config` with the given client library.
///
/// `configure` can adjust the library's configuration before the worker is built. The run stops
/// when `shutdown` is requested, when the returned stream is dropped, when the worker's run loop
/// exits, or when a shard fails under [`ShardFailurePolicy::AbortRun`]. Once it has shut down
/// gracefully, `shutdown` is marked complete.
///
/// Must be called from within a tokio runtime.
pub fn start<L, T>(
    library: &L,
    config: &ConsumerConfig,
    deserializer: impl RecordDeserializer<T>,
    configure: impl FnOnce(L::Config) -> L::Config,
    shutdown: ShutdownToken,
) -> Result<ShardStream<T>>
where
    L: ClientLibrary,
    T: Send + 'static,
{
    let settings = SchedulerSettings::try_from(config)?;

    let (registry, shards) = ShardRegistry::new(config.max_shard_buffer_size);
    let (failures, failure_rx) = FailureReporter::new();
    let factory = Arc::new(ProcessorAdapterFactory::new(
        registry.clone(),
        failures.clone(),
    ));
    let scheduler = library.scheduler(configure(library.config(&settings)), factory)?;

    info!(
        stream_name = %settings.stream_name,
        application_name = %settings.application_name,
        worker_identifier = %settings.worker_identifier,
        initial_position = ?settings.initial_position,
        max_shard_buffer_size = config.max_shard_buffer_size.get(),
        "starting stream consumer"
    );

    let cancel = CancellationToken::new();
    let supervisor = SchedulingSupervisor {
        scheduler,
        registry,
        failures: failure_rx,
        shutdown,
        cancel: cancel.clone(),
        graceful_shutdown_timeout: config.graceful_shutdown_timeout,
    };
    tokio::spawn(supervisor.run());

    let feed = ShardFeed {
        shards,
        deserializer: Arc::new(deserializer),
        failures,
        policy: config.shard_failure_policy,
    };
    Ok(ShardStream::new(feed, cancel))
}

/// What made a run shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownTrigger {
    Requested,
    StreamDropped,
    ShardFailed,
    RunLoopExited,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "shutdown requested"),
            Self::StreamDropped => write!(f, "shard stream dropped"),
            Self::ShardFailed => write!(f, "shard failed"),
            Self::RunLoopExited => write!(f, "run loop exited"),
        }
    }
}

type RunLoop = JoinHandle<Result<(), SchedulerError>>;

#[derive(Debug)]
struct SchedulingSupervisor {
    scheduler: Arc<dyn Scheduler>,
    registry: ShardRegistry,
    failures: mpsc::UnboundedReceiver<Error>,
    shutdown: ShutdownToken,
    cancel: CancellationToken,
    graceful_shutdown_timeout: Duration,
}

impl SchedulingSupervisor {
    async fn run(mut self) {
        let scheduler = Arc::clone(&self.scheduler);
        let mut run_loop: RunLoop = tokio::task::spawn_blocking(move || scheduler.run());

        let mut exited = None;
        let mut failure = None;
        let trigger = tokio::select! {
            res = &mut run_loop => {
                exited = Some(run_loop_result(res));
                ShutdownTrigger::RunLoopExited
            }
            _ = self.shutdown.wait_for_shutdown() => ShutdownTrigger::Requested,
            _ = self.cancel.cancelled() => ShutdownTrigger::StreamDropped,
            Some(e) = self.failures.recv() => {
                failure = Some(e);
                ShutdownTrigger::ShardFailed
            }
        };
        info!(%trigger, "shutting down stream consumer");

        let graceful = self.graceful_shutdown().await;
        if !graceful {
            // Worker threads blocked on a full buffer would keep the run loop alive.
            self.registry.shutdown_queues();
        }
        let exited = match exited {
            Some(res) => res,
            None => self.await_run_loop(run_loop).await,
        };

        let failure = failure
            .or_else(|| exited.err())
            .or_else(|| self.failures.try_recv().ok());
        if let Some(e) = &failure {
            error!(%e, "stream consumer failed");
            self.shutdown.trigger_shutdown();
        }

        self.registry.shutdown(failure);
        self.shutdown.complete();
        info!(%trigger, "stream consumer shut down");
    }

    /// Ask the worker to release its leases. Returns whether it confirmed in time.
    async fn graceful_shutdown(&self) -> bool {
        let timeout = self.graceful_shutdown_timeout;
        match tokio::time::timeout(timeout, self.scheduler.start_graceful_shutdown()).await {
            Ok(Ok(true)) => {
                info!("graceful shutdown complete");
                true
            }
            Ok(Ok(false)) => {
                warn!("worker stopped without completing graceful shutdown");
                false
            }
            Ok(Err(e)) => {
                warn!(%e, "graceful shutdown failed");
                false
            }
            Err(_) => {
                warn!(?timeout, "graceful shutdown timed out");
                false
            }
        }
    }

    async fn await_run_loop(&self, run_loop: RunLoop) -> Result<()> {
        match tokio::time::timeout(self.graceful_shutdown_timeout, run_loop).await {
            Ok(res) => run_loop_result(res),
            Err(_) => {
                warn!("run loop did not exit after shutdown, abandoning it");
                Ok(())
            }
        }
    }
}

fn run_loop_result(res: Result<Result<(), SchedulerError>, JoinError>) -> Result<()> {
    res.map_err(|e| Error::TaskFailed {
        task: "run loop",
        message: e.to_string(),
    })??;
    debug!("run loop exited");
    Ok(())
}
