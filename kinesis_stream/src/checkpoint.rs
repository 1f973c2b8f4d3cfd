//! Tracks how far a shard has been delivered and commits that progress through the client
//! library's checkpointer.
use std::sync::Arc;

use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;

use crate::{
    Error, Result,
    kcl::{CheckpointError, ExtendedSequenceNumber, RecordProcessorCheckpointer},
};

#[derive(Debug, Default)]
struct CheckpointState {
    /// Position of the last record offered to the shard's buffer.
    max_sequence_number: Option<ExtendedSequenceNumber>,
    /// Position of the last record handed to the consumer. Only this is ever committed.
    delivered: Option<ExtendedSequenceNumber>,
    end_of_shard: bool,
    last_checkpointed: Option<ExtendedSequenceNumber>,
}

/// Progress of one shard.
///
/// Written by the worker thread delivering the shard and committed by the task consuming it. The
/// two never commit at the same time: the consumer only commits once the shard's records have
/// drained.
#[derive(Debug)]
pub struct CheckpointTracker {
    shard_id: String,
    checkpointer: Arc<dyn RecordProcessorCheckpointer>,
    state: Mutex<CheckpointState>,
}

impl CheckpointTracker {
    pub(crate) fn new(
        shard_id: impl Into<String>,
        checkpointer: Arc<dyn RecordProcessorCheckpointer>,
    ) -> Self {
        Self {
            shard_id: shard_id.into(),
            checkpointer,
            state: Default::default(),
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Record the position of the newest record seen for the shard.
    ///
    /// The client library delivers a shard's records in order, so this simply overwrites.
    pub(crate) fn set_max_sequence_number(&self, position: ExtendedSequenceNumber) {
        self.state.lock().max_sequence_number = Some(position);
    }

    pub fn max_sequence_number(&self) -> Option<ExtendedSequenceNumber> {
        self.state.lock().max_sequence_number.clone()
    }

    /// Record that the consumer has received the record at `position`.
    pub(crate) fn mark_delivered(&self, position: ExtendedSequenceNumber) {
        self.state.lock().delivered = Some(position);
    }

    pub fn delivered_sequence_number(&self) -> Option<ExtendedSequenceNumber> {
        self.state.lock().delivered.clone()
    }

    pub(crate) fn mark_end_of_shard(&self) {
        self.state.lock().end_of_shard = true;
    }

    pub fn is_end_of_shard(&self) -> bool {
        self.state.lock().end_of_shard
    }

    /// Commit the position of the last record handed to the consumer.
    ///
    /// Blocks until the checkpoint store acknowledges. A revoked lease counts as success.
    pub fn checkpoint(&self) -> Result<()> {
        let position = {
            let state = self.state.lock();
            match &state.delivered {
                None => {
                    debug!(shard_id = %self.shard_id, "no records delivered, nothing to checkpoint");
                    return Ok(());
                }
                Some(position) if state.last_checkpointed.as_ref() == Some(position) => {
                    debug!(shard_id = %self.shard_id, %position, "position already checkpointed");
                    return Ok(());
                }
                Some(position) => position.clone(),
            }
        };

        let committed = self.commit(|| self.checkpointer.checkpoint(&position))?;
        if committed {
            debug!(shard_id = %self.shard_id, %position, "checkpointed shard");
            self.state.lock().last_checkpointed = Some(position);
        }
        Ok(())
    }

    /// Commit the shard's progress once its records have drained.
    ///
    /// A shard that has ended is checkpointed as fully consumed rather than at a position, but
    /// only if every record offered for it reached the consumer.
    pub fn check_end_of_shard_checkpointed(&self) -> Result<()> {
        let fully_delivered = {
            let state = self.state.lock();
            state.end_of_shard && state.delivered == state.max_sequence_number
        };
        if !fully_delivered {
            return self.checkpoint();
        }

        if self.commit(|| self.checkpointer.checkpoint_at_shard_end())? {
            info!(shard_id = %self.shard_id, "checkpointed shard end");
        }
        Ok(())
    }

    /// Returns whether the commit reached the store, `false` if the lease had already moved on.
    fn commit(&self, f: impl FnOnce() -> Result<(), CheckpointError>) -> Result<bool> {
        match f() {
            Ok(()) => Ok(true),
            Err(e) if e.is_lease_lost() => {
                debug!(shard_id = %self.shard_id, "lease already revoked, skipping checkpoint");
                Ok(false)
            }
            Err(source) => Err(Error::Checkpoint {
                shard_id: self.shard_id.clone(),
                source,
            }),
        }
    }
}

/// Commits a shard's progress from async code.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    tracker: Arc<CheckpointTracker>,
}

impl Checkpointer {
    pub(crate) fn new(tracker: Arc<CheckpointTracker>) -> Self {
        Self { tracker }
    }

    pub fn shard_id(&self) -> &str {
        self.tracker.shard_id()
    }

    /// Commit the newest position delivered for the shard.
    ///
    /// The checkpoint store is called on tokio's blocking pool.
    pub async fn checkpoint(&self) -> Result<()> {
        let tracker = Arc::clone(&self.tracker);
        on_blocking_pool(move || tracker.checkpoint()).await
    }
}

/// Run the completion checkpoint for a shard whose record stream has finished.
pub(crate) async fn checkpoint_on_completion(tracker: Arc<CheckpointTracker>) -> Result<()> {
    on_blocking_pool(move || tracker.check_end_of_shard_checkpointed()).await
}

async fn on_blocking_pool(f: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskFailed {
            task: "checkpoint",
            message: e.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use crate::mock::{CheckpointCall, MockCheckpointFailure, MockCheckpointer};

    use super::*;

    fn tracker() -> (Arc<MockCheckpointer>, CheckpointTracker) {
        let checkpointer = Arc::new(MockCheckpointer::new("shard-0"));
        let tracker = CheckpointTracker::new("shard-0", Arc::clone(&checkpointer) as _);
        (checkpointer, tracker)
    }

    #[test]
    fn test_checkpoint_latest_position() {
        let (checkpointer, tracker) = tracker();

        tracker.checkpoint().unwrap();
        assert!(checkpointer.calls().is_empty());

        tracker.set_max_sequence_number(ExtendedSequenceNumber::new("9", None));
        // offered but not yet received by the consumer
        tracker.checkpoint().unwrap();
        assert!(checkpointer.calls().is_empty());

        tracker.mark_delivered(ExtendedSequenceNumber::new("1", None));
        tracker.mark_delivered(ExtendedSequenceNumber::new("5", Some(2)));
        assert_eq!(
            tracker.delivered_sequence_number(),
            Some(ExtendedSequenceNumber::new("5", Some(2)))
        );

        tracker.checkpoint().unwrap();
        // nothing new to commit
        tracker.checkpoint().unwrap();
        assert_eq!(
            checkpointer.calls(),
            vec![CheckpointCall::At(ExtendedSequenceNumber::new("5", Some(2)))]
        );

        tracker.mark_delivered(ExtendedSequenceNumber::new("9", None));
        tracker.checkpoint().unwrap();
        assert_eq!(checkpointer.calls().len(), 2);
    }

    #[test]
    fn test_lease_lost_is_not_an_error() {
        let (checkpointer, tracker) = tracker();
        checkpointer.fail_with(MockCheckpointFailure::LeaseLost);

        tracker.set_max_sequence_number(ExtendedSequenceNumber::new("1", None));
        tracker.mark_delivered(ExtendedSequenceNumber::new("1", None));
        tracker.checkpoint().unwrap();
        tracker.mark_end_of_shard();
        tracker.check_end_of_shard_checkpointed().unwrap();
        assert!(checkpointer.calls().is_empty());
    }

    #[test]
    fn test_other_failures_propagate() {
        let (checkpointer, tracker) = tracker();
        checkpointer.fail_with(MockCheckpointFailure::Store("throttled".to_string()));

        tracker.mark_delivered(ExtendedSequenceNumber::new("1", None));
        let err = tracker.checkpoint().unwrap_err();
        assert!(
            matches!(&err, Error::Checkpoint { shard_id, .. } if shard_id == "shard-0"),
            "unexpected error: {err}"
        );

        // the failed position is retried on the next call
        checkpointer.clear_failure();
        tracker.checkpoint().unwrap();
        assert_eq!(checkpointer.calls().len(), 1);
    }

    #[test]
    fn test_end_of_shard_checkpoint() {
        let (checkpointer, tracker) = tracker();
        tracker.set_max_sequence_number(ExtendedSequenceNumber::new("3", None));
        tracker.mark_delivered(ExtendedSequenceNumber::new("3", None));

        tracker.check_end_of_shard_checkpointed().unwrap();
        assert!(!tracker.is_end_of_shard());

        tracker.mark_end_of_shard();
        tracker.check_end_of_shard_checkpointed().unwrap();
        assert_eq!(
            checkpointer.calls(),
            vec![
                CheckpointCall::At(ExtendedSequenceNumber::new("3", None)),
                CheckpointCall::ShardEnd,
            ]
        );
    }

    #[test]
    fn test_ended_shard_not_fully_delivered() {
        let (checkpointer, tracker) = tracker();
        tracker.set_max_sequence_number(ExtendedSequenceNumber::new("6", None));
        tracker.mark_delivered(ExtendedSequenceNumber::new("2", None));
        tracker.mark_end_of_shard();

        // the records after 2 never reached the consumer, so the shard is not done
        tracker.check_end_of_shard_checkpointed().unwrap();
        assert_eq!(
            checkpointer.calls(),
            vec![CheckpointCall::At(ExtendedSequenceNumber::new("2", None))]
        );
    }

    #[tokio::test]
    async fn test_checkpointer_handle() {
        let (checkpointer, tracker) = tracker();
        tracker.set_max_sequence_number(ExtendedSequenceNumber::new("9", None));
        tracker.mark_delivered(ExtendedSequenceNumber::new("8", None));

        let handle = Checkpointer::new(Arc::new(tracker));
        assert_eq!(handle.shard_id(), "shard-0");
        handle.checkpoint().await.unwrap();
        assert_eq!(
            checkpointer.calls(),
            vec![CheckpointCall::At(ExtendedSequenceNumber::new("8", None))]
        );
    }
}
