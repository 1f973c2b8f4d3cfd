//! The callbacks the client library invokes for each leased shard, forwarded to the shard's
//! buffer.
use std::sync::Arc;

use observability_deps::tracing::{debug, error, info};

use crate::{
    Error,
    buffer::{ShardBuffer, StopReason},
    kcl::{
        InitializationInput, LeaseLostInput, ProcessRecordsInput, ShardEndedInput,
        ShardRecordProcessor, ShardRecordProcessorFactory, ShutdownRequestedInput,
    },
    registry::ShardRegistry,
    supervisor::FailureReporter,
};

#[derive(Debug)]
enum ProcessorState {
    Uninitialized,
    /// Records have been delivered, so the shard has been published.
    Bound(ShardBuffer),
}

/// Processor of one shard lease.
///
/// The library calls a processor from one thread at a time, so its state needs no
/// synchronization. The shard is only published to the consumer once its first records arrive.
#[derive(Debug)]
pub struct ProcessorAdapter {
    shard_id: Option<String>,
    state: ProcessorState,
    registry: ShardRegistry,
    failures: FailureReporter,
}

impl ProcessorAdapter {
    pub(crate) fn new(registry: ShardRegistry, failures: FailureReporter) -> Self {
        Self {
            shard_id: None,
            state: ProcessorState::Uninitialized,
            registry,
            failures,
        }
    }

    pub fn shard_id(&self) -> Option<&str> {
        self.shard_id.as_deref()
    }

    fn stop(&self, reason: StopReason) {
        match &self.state {
            ProcessorState::Bound(buffer) => buffer.stop(reason),
            ProcessorState::Uninitialized => {
                debug!(shard_id = ?self.shard_id, %reason, "stopped shard without records")
            }
        }
    }
}

impl ShardRecordProcessor for ProcessorAdapter {
    fn initialize(&mut self, input: InitializationInput) {
        info!(
            shard_id = %input.shard_id,
            resume_from = ?input.extended_sequence_number.map(|p| p.to_string()),
            "initializing shard processor"
        );
        self.shard_id = Some(input.shard_id);
    }

    fn process_records(&mut self, input: ProcessRecordsInput) {
        if input.records.is_empty() {
            return;
        }

        if let ProcessorState::Uninitialized = self.state {
            let Some(shard_id) = &self.shard_id else {
                let e = Error::TaskFailed {
                    task: "shard processor",
                    message: "records delivered before initialize".to_string(),
                };
                error!(%e, n_records = input.records.len(), "discarding records");
                self.failures.report(e);
                return;
            };
            let buffer = self
                .registry
                .new_shard(shard_id.clone(), Arc::clone(&input.checkpointer));
            self.state = ProcessorState::Bound(buffer);
        }

        if let ProcessorState::Bound(buffer) = &self.state {
            debug!(
                shard_id = %buffer.shard_id(),
                n_records = input.records.len(),
                millis_behind_latest = ?input.millis_behind_latest,
                "received records"
            );
            buffer.offer_records(input.records);
        }
    }

    fn lease_lost(&mut self, _input: LeaseLostInput) {
        self.stop(StopReason::LeaseLost);
    }

    fn shard_ended(&mut self, input: ShardEndedInput) {
        self.stop(StopReason::ShardEnded);

        let shard_id = self.shard_id.clone().unwrap_or_default();
        match input.checkpointer.checkpoint_at_shard_end() {
            Ok(()) => debug!(%shard_id, "acknowledged shard end"),
            Err(e) if e.is_lease_lost() => {
                debug!(%shard_id, "lease already revoked, shard end not acknowledged")
            }
            Err(source) => {
                let e = Error::Checkpoint { shard_id, source };
                error!(%e, "failed to acknowledge shard end");
                self.failures.report(e);
            }
        }
    }

    fn shutdown_requested(&mut self, _input: ShutdownRequestedInput) {
        self.stop(StopReason::ShutdownRequested);
    }
}

/// Hands every lease of a run a [`ProcessorAdapter`] publishing to the run's registry.
#[derive(Debug)]
pub(crate) struct ProcessorAdapterFactory {
    registry: ShardRegistry,
    failures: FailureReporter,
}

impl ProcessorAdapterFactory {
    pub(crate) fn new(registry: ShardRegistry, failures: FailureReporter) -> Self {
        Self { registry, failures }
    }
}

impl ShardRecordProcessorFactory for ProcessorAdapterFactory {
    fn shard_record_processor(&self) -> Box<dyn ShardRecordProcessor> {
        Box::new(ProcessorAdapter::new(
            self.registry.clone(),
            self.failures.clone(),
        ))
    }
}
