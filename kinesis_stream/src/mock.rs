//! An in-memory client library that plays scripted shard lifecycles.
//!
//! Each [`ShardScript`] is played on its own thread, the way the real library dedicates a worker
//! thread to a lease, so callbacks for a shard are strictly sequential while shards run
//! concurrently. Checkpoints are recorded by a [`MockCheckpointer`] per shard.
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use observability_deps::tracing::{debug, warn};
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::kcl::{
    CheckpointError, ClientLibrary, EncryptionType, ExtendedSequenceNumber, InitializationInput,
    KinesisClientRecord, LeaseLostInput, ProcessRecordsInput, RecordProcessorCheckpointer,
    Scheduler, SchedulerError, SchedulerSettings, ShardEndedInput, ShardRecordProcessor,
    ShardRecordProcessorFactory, ShutdownRequestedInput,
};

/// How long a script waits for the consumer to checkpoint before carrying on.
const CHECKPOINT_WAIT: Duration = Duration::from_secs(10);

/// A record with sequence number `sequence_number`.
pub fn record(sequence_number: u64, data: impl Into<Bytes>) -> KinesisClientRecord {
    KinesisClientRecord {
        sequence_number: sequence_number.to_string(),
        sub_sequence_number: 0,
        approximate_arrival_timestamp: arrival(sequence_number),
        data: data.into(),
        partition_key: format!("pk-{sequence_number}"),
        encryption_type: EncryptionType::None,
        explicit_hash_key: String::new(),
        aggregated: false,
    }
}

/// A record unpacked from the aggregated record `sequence_number`.
pub fn aggregated_record(
    sequence_number: u64,
    sub_sequence_number: u64,
    data: impl Into<Bytes>,
) -> KinesisClientRecord {
    KinesisClientRecord {
        sub_sequence_number,
        aggregated: true,
        ..record(sequence_number, data)
    }
}

fn arrival(sequence_number: u64) -> DateTime<Utc> {
    let secs = i64::try_from(sequence_number).map_or(i64::MAX, |n| n.saturating_add(1_700_000_000));
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// A commit that reached the checkpoint store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointCall {
    At(ExtendedSequenceNumber),
    ShardEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCheckpointFailure {
    LeaseLost,
    Store(String),
}

/// Checkpoint store of one shard.
#[derive(Debug)]
pub struct MockCheckpointer {
    shard_id: String,
    calls: Mutex<Vec<CheckpointCall>>,
    committed: Condvar,
    failure: Mutex<Option<MockCheckpointFailure>>,
}

impl MockCheckpointer {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            calls: Default::default(),
            committed: Condvar::new(),
            failure: Default::default(),
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Commits that succeeded, in order.
    pub fn calls(&self) -> Vec<CheckpointCall> {
        self.calls.lock().clone()
    }

    /// Fail every commit from now on.
    pub fn fail_with(&self, failure: MockCheckpointFailure) {
        *self.failure.lock() = Some(failure);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Block until at least `n` commits succeeded. Returns `false` on timeout.
    pub fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let mut calls = self.calls.lock();
        let timed_out = self
            .committed
            .wait_while_for(&mut calls, |calls| calls.len() < n, timeout)
            .timed_out();
        !timed_out
    }

    fn commit(&self, call: CheckpointCall) -> Result<(), CheckpointError> {
        if let Some(failure) = self.failure.lock().clone() {
            return Err(match failure {
                MockCheckpointFailure::LeaseLost => CheckpointError::ShutdownOrLeaseLost,
                MockCheckpointFailure::Store(msg) => CheckpointError::External(msg.into()),
            });
        }
        debug!(shard_id = %self.shard_id, ?call, "mock checkpoint");
        self.calls.lock().push(call);
        self.committed.notify_all();
        Ok(())
    }
}

impl RecordProcessorCheckpointer for MockCheckpointer {
    fn checkpoint(&self, position: &ExtendedSequenceNumber) -> Result<(), CheckpointError> {
        self.commit(CheckpointCall::At(position.clone()))
    }

    fn checkpoint_at_shard_end(&self) -> Result<(), CheckpointError> {
        self.commit(CheckpointCall::ShardEnd)
    }
}

#[derive(Debug, Clone)]
pub enum MockEvent {
    Records(Vec<KinesisClientRecord>),
    /// Wait until the consumer has committed this many checkpoints.
    AwaitCheckpoints(usize),
    /// Another worker takes the lease. Later commits fail as the lease is gone.
    LeaseLost,
    ShardEnded,
}

/// The lifecycle of one shard lease.
///
/// Events are played in order, including those following a lease loss or shard end, which
/// stand in for deliveries racing the stop. A script without either is released on shutdown.
#[derive(Debug, Clone)]
pub struct ShardScript {
    shard_id: String,
    events: Vec<MockEvent>,
}

impl ShardScript {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            events: vec![],
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn records(mut self, records: Vec<KinesisClientRecord>) -> Self {
        self.events.push(MockEvent::Records(records));
        self
    }

    pub fn await_checkpoints(mut self, n: usize) -> Self {
        self.events.push(MockEvent::AwaitCheckpoints(n));
        self
    }

    pub fn lease_lost(mut self) -> Self {
        self.events.push(MockEvent::LeaseLost);
        self
    }

    pub fn shard_ended(mut self) -> Self {
        self.events.push(MockEvent::ShardEnded);
        self
    }

    fn is_released(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, MockEvent::LeaseLost | MockEvent::ShardEnded))
    }
}

/// Configuration of the mock library, adjustable before the run starts.
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub settings: SchedulerSettings,
    pub scripts: Vec<ShardScript>,
    /// Fail building the scheduler.
    pub build_failure: Option<String>,
    /// Fail the run loop as soon as it starts.
    pub run_failure: Option<String>,
    pub graceful_shutdown_failure: Option<String>,
}

/// Client library whose worker plays a fixed set of shard scripts.
#[derive(Debug)]
pub struct MockClientLibrary {
    scripts: Vec<ShardScript>,
    checkpointers: BTreeMap<String, Arc<MockCheckpointer>>,
    schedulers: Mutex<Vec<Arc<MockScheduler>>>,
}

impl MockClientLibrary {
    pub fn new(scripts: Vec<ShardScript>) -> Self {
        let checkpointers = scripts
            .iter()
            .map(|s| {
                let checkpointer = Arc::new(MockCheckpointer::new(s.shard_id()));
                (s.shard_id().to_string(), checkpointer)
            })
            .collect();
        Self {
            scripts,
            checkpointers,
            schedulers: Default::default(),
        }
    }

    /// The checkpoint store of a scripted shard.
    pub fn checkpointer(&self, shard_id: &str) -> Option<Arc<MockCheckpointer>> {
        self.checkpointers.get(shard_id).map(Arc::clone)
    }

    /// The most recently built scheduler.
    pub fn last_scheduler(&self) -> Option<Arc<MockScheduler>> {
        self.schedulers.lock().last().map(Arc::clone)
    }
}

impl ClientLibrary for MockClientLibrary {
    type Config = MockConfig;

    fn config(&self, settings: &SchedulerSettings) -> Self::Config {
        MockConfig {
            settings: settings.clone(),
            scripts: self.scripts.clone(),
            build_failure: None,
            run_failure: None,
            graceful_shutdown_failure: None,
        }
    }

    fn scheduler(
        &self,
        config: Self::Config,
        factory: Arc<dyn ShardRecordProcessorFactory>,
    ) -> Result<Arc<dyn Scheduler>, SchedulerError> {
        if let Some(msg) = config.build_failure {
            return Err(SchedulerError::Build(msg.into()));
        }

        let mut workers = Vec::with_capacity(config.scripts.len());
        for script in config.scripts {
            let checkpointer = self.checkpointer(script.shard_id()).unwrap_or_else(|| {
                Arc::new(MockCheckpointer::new(script.shard_id()))
            });
            workers.push((script, checkpointer));
        }

        let scheduler = Arc::new(MockScheduler {
            settings: config.settings,
            factory,
            workers: Mutex::new(Some(workers)),
            run_failure: config.run_failure,
            graceful_shutdown_failure: config.graceful_shutdown_failure,
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            graceful_shutdown_calls: AtomicUsize::new(0),
        });
        self.schedulers.lock().push(Arc::clone(&scheduler));
        Ok(scheduler)
    }
}

type Worker = (ShardScript, Arc<MockCheckpointer>);

/// Worker of the mock library.
///
/// The run loop starts one thread per script and returns once shutdown was requested and every
/// thread has released its shard.
#[derive(Debug)]
pub struct MockScheduler {
    settings: SchedulerSettings,
    factory: Arc<dyn ShardRecordProcessorFactory>,
    workers: Mutex<Option<Vec<Worker>>>,
    run_failure: Option<String>,
    graceful_shutdown_failure: Option<String>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    graceful_shutdown_calls: AtomicUsize,
}

impl MockScheduler {
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn graceful_shutdown_calls(&self) -> usize {
        self.graceful_shutdown_calls.load(Ordering::SeqCst)
    }

    /// Whether the run loop has returned.
    pub fn has_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    fn run(&self) -> Result<(), SchedulerError> {
        let Some(workers) = self.workers.lock().take() else {
            return Err(SchedulerError::Run("run loop already started".into()));
        };
        let _stopped = self.stopped.clone().drop_guard();

        if let Some(msg) = &self.run_failure {
            return Err(SchedulerError::Run(msg.clone().into()));
        }

        let mut handles = Vec::with_capacity(workers.len());
        for (script, checkpointer) in workers {
            let processor = self.factory.shard_record_processor();
            let shutdown = self.shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("mock-worker-{}", script.shard_id()))
                .spawn(move || play(processor, script, checkpointer, shutdown))
                .map_err(|e| SchedulerError::Run(Box::new(e)))?;
            handles.push(handle);
        }

        futures::executor::block_on(self.shutdown.cancelled());
        for handle in handles {
            handle
                .join()
                .map_err(|_| SchedulerError::Run("worker thread panicked".into()))?;
        }
        Ok(())
    }

    async fn start_graceful_shutdown(&self) -> Result<bool, SchedulerError> {
        self.graceful_shutdown_calls.fetch_add(1, Ordering::SeqCst);
        let already_stopped = self.stopped.is_cancelled();
        self.shutdown.cancel();

        if let Some(msg) = &self.graceful_shutdown_failure {
            return Err(SchedulerError::Shutdown(msg.clone().into()));
        }
        if already_stopped {
            return Ok(false);
        }
        self.stopped.cancelled().await;
        Ok(true)
    }
}

fn play(
    mut processor: Box<dyn ShardRecordProcessor>,
    script: ShardScript,
    checkpointer: Arc<MockCheckpointer>,
    shutdown: CancellationToken,
) {
    let released = script.is_released();
    let ShardScript { shard_id, events } = script;
    processor.initialize(InitializationInput {
        shard_id: shard_id.clone(),
        extended_sequence_number: None,
    });

    let handle: Arc<dyn RecordProcessorCheckpointer> = Arc::clone(&checkpointer) as _;
    for event in events {
        match event {
            MockEvent::Records(records) => processor.process_records(ProcessRecordsInput {
                records,
                checkpointer: Arc::clone(&handle),
                millis_behind_latest: Some(0),
            }),
            MockEvent::AwaitCheckpoints(n) => {
                if !checkpointer.wait_for_calls(n, CHECKPOINT_WAIT) {
                    warn!(%shard_id, n, "gave up waiting for checkpoints");
                }
            }
            MockEvent::LeaseLost => {
                checkpointer.fail_with(MockCheckpointFailure::LeaseLost);
                processor.lease_lost(LeaseLostInput);
            }
            MockEvent::ShardEnded => processor.shard_ended(ShardEndedInput {
                checkpointer: Arc::clone(&handle),
            }),
        }
    }

    if !released {
        futures::executor::block_on(shutdown.cancelled());
        processor.shutdown_requested(ShutdownRequestedInput {
            checkpointer: handle,
        });
    }
    debug!(%shard_id, "mock worker done");
}
