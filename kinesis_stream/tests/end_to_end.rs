use std::{collections::BTreeMap, time::Duration};

use futures::StreamExt;
use kinesis_stream::{
    ConsumerConfig, Error, Shard, ShardFailurePolicy, Utf8Deserializer,
    kcl::{ExtendedSequenceNumber, KinesisClientRecord},
    mock::{CheckpointCall, MockClientLibrary, ShardScript, record},
    start,
};
use kinesis_stream_shutdown::ShutdownManager;
use pretty_assertions::assert_eq;
use test_helpers::timeout::FutureTimeout;

const TIMEOUT: Duration = Duration::from_secs(10);

fn batch(range: std::ops::Range<u64>) -> Vec<KinesisClientRecord> {
    range.map(|n| record(n, format!("r{n}"))).collect()
}

fn config() -> ConsumerConfig {
    let mut config = ConsumerConfig::new("clicks", "click-counter");
    config.worker_identifier = "worker-1".to_string();
    config.graceful_shutdown_timeout = Duration::from_secs(5);
    config
}

/// Read a shard to its end, checkpointing every `checkpoint_every` records.
async fn consume(shard: Shard<String>, checkpoint_every: Option<usize>) -> (String, Vec<String>) {
    let Shard {
        shard_id,
        mut records,
        checkpointer,
    } = shard;

    let mut data = vec![];
    while let Some(record) = records.next().await {
        data.push(record.unwrap().data);
        if checkpoint_every.is_some_and(|n| data.len() % n == 0) {
            checkpointer.checkpoint().await.unwrap();
        }
    }
    (shard_id, data)
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_shards_are_consumed_and_checkpointed() {
    let library = MockClientLibrary::new(vec![
        ShardScript::new("shard-a")
            .records(batch(0..3))
            .records(batch(3..5))
            .records(batch(5..9))
            .shard_ended(),
        ShardScript::new("shard-b")
            .records(batch(0..2))
            .await_checkpoints(1)
            .lease_lost()
            // in flight when the lease was lost
            .records(batch(2..4)),
    ]);
    let manager = ShutdownManager::new();
    let token = manager.register();

    let mut stream = start(&library, &config(), Utf8Deserializer, |c| c, token).unwrap();

    let mut consumers = vec![];
    for _ in 0..2 {
        let shard = stream.next().with_timeout_panic(TIMEOUT).await.unwrap().unwrap();
        let checkpoint_every = (shard.shard_id == "shard-b").then_some(2);
        consumers.push(tokio::spawn(consume(shard, checkpoint_every)));
    }
    let mut consumed = BTreeMap::new();
    for consumer in consumers {
        let (shard_id, data) = consumer.with_timeout_panic(TIMEOUT).await.unwrap();
        consumed.insert(shard_id, data);
    }

    assert_eq!(
        consumed["shard-a"],
        ["r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8"]
    );
    assert_eq!(consumed["shard-b"], ["r0", "r1"]);

    // no further shards until the run is shut down
    manager.shutdown();
    assert!(stream.next().with_timeout_panic(TIMEOUT).await.is_none());
    manager.join().with_timeout_panic(TIMEOUT).await;

    // drained by the consumer, then acknowledged by the processor
    assert_eq!(
        library.checkpointer("shard-a").unwrap().calls(),
        [CheckpointCall::ShardEnd, CheckpointCall::ShardEnd]
    );
    // nothing newer to commit when the shard completed
    assert_eq!(
        library.checkpointer("shard-b").unwrap().calls(),
        [CheckpointCall::At(ExtendedSequenceNumber::new("1", None))]
    );

    let scheduler = library.last_scheduler().unwrap();
    assert_eq!(scheduler.graceful_shutdown_calls(), 1);
    assert_eq!(scheduler.settings().worker_identifier, "worker-1");
    assert_eq!(scheduler.settings().lease_table_name, "click-counter");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_shutdown_releases_active_shards() {
    let library = MockClientLibrary::new(vec![ShardScript::new("shard-a").records(batch(0..2))]);
    let manager = ShutdownManager::new();
    let token = manager.register();

    let mut stream = start(&library, &config(), Utf8Deserializer, |c| c, token).unwrap();
    let shard = stream.next().with_timeout_panic(TIMEOUT).await.unwrap().unwrap();
    let Shard { mut records, .. } = shard;
    for expected in ["r0", "r1"] {
        let record = records.next().with_timeout_panic(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(record.data, expected);
        assert_eq!(record.shard_id, "shard-a");
    }

    manager.shutdown();
    // the shard ends once its lease is released
    assert!(records.next().with_timeout_panic(TIMEOUT).await.is_none());
    assert!(stream.next().with_timeout_panic(TIMEOUT).await.is_none());
    manager.join().with_timeout_panic(TIMEOUT).await;

    assert_eq!(
        library.checkpointer("shard-a").unwrap().calls(),
        [CheckpointCall::At(ExtendedSequenceNumber::new("1", None))]
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_graceful_shutdown_failure_is_not_fatal() {
    let library = MockClientLibrary::new(vec![ShardScript::new("shard-a").records(batch(0..2))]);
    let manager = ShutdownManager::new();
    let token = manager.register();

    let mut stream = start(
        &library,
        &config(),
        Utf8Deserializer,
        |mut c| {
            c.graceful_shutdown_failure = Some("lease table unavailable".to_string());
            c
        },
        token,
    )
    .unwrap();
    let shard = stream.next().with_timeout_panic(TIMEOUT).await.unwrap().unwrap();
    let consumer = tokio::spawn(consume(shard, None));

    manager.shutdown();
    assert!(stream.next().with_timeout_panic(TIMEOUT).await.is_none());
    manager.join().with_timeout_panic(TIMEOUT).await;
    consumer.with_timeout_panic(TIMEOUT).await.unwrap();

    let scheduler = library.last_scheduler().unwrap();
    assert_eq!(scheduler.graceful_shutdown_calls(), 1);
    assert!(scheduler.has_stopped());
}

fn with_bad_record() -> MockClientLibrary {
    let mut bad = record(1, "");
    bad.data = bytes::Bytes::from_static(&[0xff, 0xfe]);
    MockClientLibrary::new(vec![
        ShardScript::new("shard-a").records(vec![record(0, "r0"), bad, record(2, "r2")]),
        ShardScript::new("shard-b").records(batch(0..1)),
    ])
}

async fn next_shard(stream: &mut kinesis_stream::ShardStream<String>) -> Shard<String> {
    stream.next().with_timeout_panic(TIMEOUT).await.unwrap().unwrap()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_deserialize_failure_is_isolated_to_its_shard() {
    let library = with_bad_record();
    let manager = ShutdownManager::new();
    let token = manager.register();

    let mut stream = start(&library, &config(), Utf8Deserializer, |c| c, token).unwrap();
    let mut shards = BTreeMap::new();
    for _ in 0..2 {
        let shard = next_shard(&mut stream).await;
        shards.insert(shard.shard_id.clone(), shard);
    }

    let results = shards
        .remove("shard-a")
        .unwrap()
        .records
        .collect::<Vec<_>>()
        .with_timeout_panic(TIMEOUT)
        .await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap().data, "r0");
    assert!(matches!(
        &results[1],
        Err(Error::Deserialize { shard_id, sequence_number, .. })
            if shard_id == "shard-a" && sequence_number == "1"
    ));

    // the other shard and the run carry on
    let mut other = shards.remove("shard-b").unwrap().records;
    assert_eq!(
        other.next().with_timeout_panic(TIMEOUT).await.unwrap().unwrap().data,
        "r0"
    );
    assert!(!manager.is_shutdown_requested());
    drop(other);

    manager.shutdown();
    assert!(stream.next().with_timeout_panic(TIMEOUT).await.is_none());
    manager.join().with_timeout_panic(TIMEOUT).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_deserialize_failure_aborts_run() {
    let library = with_bad_record();
    let manager = ShutdownManager::new();
    let token = manager.register();
    let mut config = config();
    config.shard_failure_policy = ShardFailurePolicy::AbortRun;

    let mut stream = start(&library, &config, Utf8Deserializer, |c| c, token).unwrap();
    let mut shards = BTreeMap::new();
    for _ in 0..2 {
        let shard = next_shard(&mut stream).await;
        shards.insert(shard.shard_id.clone(), shard);
    }

    let failing = shards.remove("shard-a").unwrap();
    let results = failing
        .records
        .collect::<Vec<_>>()
        .with_timeout_panic(TIMEOUT)
        .await;
    assert!(matches!(results.last(), Some(Err(Error::Deserialize { .. }))));
    let consumer = tokio::spawn(consume(shards.remove("shard-b").unwrap(), None));

    // the whole run is torn down and reports the failed shard
    let err = stream
        .next()
        .with_timeout_panic(TIMEOUT)
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(&err, Error::ShardFailed { shard_id, .. } if shard_id == "shard-a"),
        "unexpected error: {err}"
    );
    assert!(stream.next().await.is_none());
    assert!(manager.is_shutdown_requested());
    manager.join().with_timeout_panic(TIMEOUT).await;

    let (_, data) = consumer.with_timeout_panic(TIMEOUT).await.unwrap();
    assert!(data.len() <= 1);
}
