//! End-to-end bus tests.
//!
//! These run the full producer → store → subscription → processor →
//! offset-commit path, against the in-memory backend and the durable
//! SQLite backend, plus durable-only checks for hydration after a
//! process restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;

use streambus_client::{
    AtomicProducer, BusConfig, CompactedProcessor, CompactedSubscription, ConsumerRecord,
    DurableProcessor, DurableSubscription, MessageBus, ProcessorError, ResolvedConsumerConfig,
    ResolvedProducerConfig, TransactionalProducer,
};
use streambus_core::{OffsetStrategy, ProducerRecord};

// ============================================================================
// Helpers & mocks
// ============================================================================

fn consumer_config(group: &str) -> ResolvedConsumerConfig {
    ResolvedConsumerConfig {
        group: group.to_string(),
        client_id: format!("{}-test", group),
        max_poll_records: 10,
        offset_reset_strategy: OffsetStrategy::Earliest,
        poll_interval_ms: 10,
    }
}

fn plain_producer_config() -> ResolvedProducerConfig {
    ResolvedProducerConfig {
        client_id: "it-producer".to_string(),
        transactional_id: None,
    }
}

fn transactional_producer_config() -> ResolvedProducerConfig {
    ResolvedProducerConfig {
        client_id: "it-producer".to_string(),
        transactional_id: Some("it-txn".to_string()),
    }
}

fn typed_entry(topic: &str, key: &str, value: &str) -> ProducerRecord {
    ProducerRecord::typed(topic, &key.to_string(), Some(&value.to_string())).unwrap()
}

struct CountingProcessor {
    calls: AtomicUsize,
    keys: Mutex<Vec<String>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl CountingProcessor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            keys: Mutex::new(Vec::new()),
            batch_sizes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DurableProcessor for CountingProcessor {
    type Key = String;
    type Value = String;

    async fn on_next(
        &self,
        batch: Vec<ConsumerRecord<String, String>>,
    ) -> Result<(), ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(batch.len());
        self.keys
            .lock()
            .unwrap()
            .extend(batch.iter().map(|r| r.key.clone()));
        Ok(())
    }
}

struct SnapshotProcessor {
    snapshots: Mutex<Vec<HashMap<String, i64>>>,
}

impl SnapshotProcessor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshots: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CompactedProcessor for SnapshotProcessor {
    type Key = String;
    type Value = i64;

    async fn on_snapshot(&self, snapshot: &HashMap<String, i64>) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }

    async fn on_next(
        &self,
        _record: ConsumerRecord<String, i64>,
        _previous: Option<i64>,
        _current: &HashMap<String, i64>,
    ) {
    }
}

async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", description);
}

async fn wait_for_offset(bus: &MessageBus, topic: &str, group: &str, partition: u32, expected: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let committed = bus.committed_offset(topic, group, partition).await.unwrap();
        if committed == Some(expected) {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "{}-{} for '{}' never reached {} (last: {:?})",
                topic, partition, group, expected, committed
            );
        }
        sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Shared scenarios (run against both backends)
// ============================================================================

/// Three records across three partitions arrive in a single poll; a
/// successful batch commits offset 1 on every touched partition.
async fn run_fan_out_delivery(bus: Arc<MessageBus>) {
    let producer = AtomicProducer::new(bus.clone(), plain_producer_config());
    for (partition, key) in ["a", "b", "c"].iter().enumerate() {
        producer
            .send_to_partition(
                typed_entry("orders", key, &format!("payload-{}", key)),
                partition as u32,
            )
            .await
            .unwrap();
    }

    let processor = CountingProcessor::new();
    let mut subscription = DurableSubscription::new(
        bus.clone(),
        "orders",
        consumer_config("g1"),
        processor.clone(),
    );
    subscription.start().await.unwrap();

    for partition in 0..3 {
        wait_for_offset(&bus, "orders", "g1", partition, 1).await;
    }
    subscription.stop().await;

    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(processor.batch_sizes.lock().unwrap().clone(), vec![3]);
    let mut keys = processor.keys.lock().unwrap().clone();
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c"]);
}

/// Aborted transactions are invisible to every reader; committed ones
/// surface all records with contiguous offsets, from offset 0 for a new
/// group.
async fn run_transaction_visibility(bus: Arc<MessageBus>) {
    let producer = TransactionalProducer::new(bus.clone(), transactional_producer_config()).unwrap();

    let mut txn = producer.begin_transaction().await.unwrap();
    txn.send_to_partition(typed_entry("orders", "gone-1", "x"), 0)
        .await
        .unwrap();
    txn.send_to_partition(typed_entry("orders", "gone-2", "y"), 0)
        .await
        .unwrap();
    txn.abort().await.unwrap();

    assert!(bus.replay_all("orders").await.unwrap().is_empty());
    assert_eq!(bus.high_watermark("orders", 0).await.unwrap(), 0);
    assert!(bus
        .read("orders", "after-abort", None, 10, OffsetStrategy::Earliest)
        .await
        .unwrap()
        .is_empty());

    let mut txn = producer.begin_transaction().await.unwrap();
    for i in 0..3 {
        txn.send_to_partition(typed_entry("orders", &format!("k{}", i), "v"), 0)
            .await
            .unwrap();
    }
    let metadata = txn.commit().await.unwrap();
    let offsets: Vec<u64> = metadata.iter().map(|m| m.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2]);

    let batch = bus
        .read("orders", "after-commit", None, 10, OffsetStrategy::Earliest)
        .await
        .unwrap();
    let offsets: Vec<u64> = batch.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2]);
}

// ============================================================================
// In-memory backend
// ============================================================================

async fn in_memory_bus() -> Arc<MessageBus> {
    Arc::new(
        MessageBus::new(BusConfig::in_memory().with_topic("orders", 3))
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn test_memory_fan_out_delivery() {
    run_fan_out_delivery(in_memory_bus().await).await;
}

#[tokio::test]
async fn test_memory_transaction_visibility() {
    run_transaction_visibility(in_memory_bus().await).await;
}

// ============================================================================
// Database backend
// ============================================================================

async fn database_bus(path: &str) -> Arc<MessageBus> {
    Arc::new(
        MessageBus::new(BusConfig::database(path).with_topic("orders", 3))
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn test_database_fan_out_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.db");
    run_fan_out_delivery(database_bus(path.to_str().unwrap()).await).await;
}

#[tokio::test]
async fn test_database_transaction_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.db");
    run_transaction_visibility(database_bus(path.to_str().unwrap()).await).await;
}

#[tokio::test]
async fn test_database_restart_preserves_records_and_progress() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.db");
    let path = path.to_str().unwrap();

    {
        let bus = Arc::new(
            MessageBus::new(BusConfig::database(path).with_topic("orders", 1))
                .await
                .unwrap(),
        );
        let producer = AtomicProducer::new(bus.clone(), plain_producer_config());
        for key in ["a", "b", "c"] {
            producer
                .send_to_partition(typed_entry("orders", key, "v"), 0)
                .await
                .unwrap();
        }

        let processor = CountingProcessor::new();
        let mut subscription = DurableSubscription::new(
            bus.clone(),
            "orders",
            consumer_config("g1"),
            processor.clone(),
        );
        subscription.start().await.unwrap();
        wait_for_offset(&bus, "orders", "g1", 0, 3).await;
        subscription.stop().await;
    }

    // A new process: the delivery mirror is rebuilt from the database.
    let bus = Arc::new(
        MessageBus::new(BusConfig::database(path).with_topic("orders", 1))
            .await
            .unwrap(),
    );
    assert_eq!(bus.replay_all("orders").await.unwrap().len(), 3);
    assert_eq!(
        bus.committed_offset("orders", "g1", 0).await.unwrap(),
        Some(3)
    );

    // The old group resumes at its committed position: no redelivery.
    let resumed = CountingProcessor::new();
    let mut subscription = DurableSubscription::new(
        bus.clone(),
        "orders",
        consumer_config("g1"),
        resumed.clone(),
    );
    subscription.start().await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(resumed.calls.load(Ordering::SeqCst), 0);

    // New writes continue the offset sequence and reach the resumed group.
    let producer = AtomicProducer::new(bus.clone(), plain_producer_config());
    let metadata = producer
        .send_to_partition(typed_entry("orders", "d", "v"), 0)
        .await
        .unwrap();
    assert_eq!(metadata.offset, 3);
    wait_for_offset(&bus, "orders", "g1", 0, 4).await;
    subscription.stop().await;
    assert_eq!(resumed.keys.lock().unwrap().clone(), vec!["d"]);

    // A fresh group still replays everything from offset 0.
    let history = bus
        .read("orders", "g2", None, 10, OffsetStrategy::Earliest)
        .await
        .unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].offset, 0);
}

#[tokio::test]
async fn test_database_consume_produce_offset_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.db");
    let bus = Arc::new(
        MessageBus::new(
            BusConfig::database(path.to_str().unwrap())
                .with_topic("orders", 1)
                .with_topic("derived", 1),
        )
        .await
        .unwrap(),
    );

    let atomic = AtomicProducer::new(bus.clone(), plain_producer_config());
    atomic
        .send_batch(vec![
            typed_entry("orders", "o1", "v1").with_partition(0),
            typed_entry("orders", "o2", "v2").with_partition(0),
        ])
        .await
        .unwrap();

    // Process the batch, produce a derived record, and advance the input
    // group's offset — all in one transaction.
    let polled = bus
        .read("orders", "pipeline", None, 10, OffsetStrategy::Earliest)
        .await
        .unwrap();
    assert_eq!(polled.len(), 2);

    let producer = TransactionalProducer::new(bus.clone(), transactional_producer_config()).unwrap();
    let mut txn = producer.begin_transaction().await.unwrap();
    txn.send_to_partition(typed_entry("derived", "o1+o2", "sum"), 0)
        .await
        .unwrap();
    txn.send_offsets("pipeline", &polled);
    txn.commit().await.unwrap();

    assert_eq!(
        bus.committed_offset("orders", "pipeline", 0).await.unwrap(),
        Some(2)
    );
    assert_eq!(bus.replay_all("derived").await.unwrap().len(), 1);
    assert!(bus
        .read("orders", "pipeline", None, 10, OffsetStrategy::Earliest)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_database_compacted_view() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus.db");
    let bus = Arc::new(
        MessageBus::new(BusConfig::database(path.to_str().unwrap()).with_topic("config", 1))
            .await
            .unwrap(),
    );

    let producer = AtomicProducer::new(bus.clone(), plain_producer_config());
    for (key, value) in [("X", 1i64), ("Y", 2), ("X", 3)] {
        producer
            .send_to_partition(
                ProducerRecord::typed("config", &key.to_string(), Some(&value)).unwrap(),
                0,
            )
            .await
            .unwrap();
    }
    producer
        .send_to_partition(
            ProducerRecord::typed::<_, i64>("config", &"Y".to_string(), None).unwrap(),
            0,
        )
        .await
        .unwrap();

    let processor = SnapshotProcessor::new();
    let mut subscription = CompactedSubscription::new(
        bus.clone(),
        "config",
        consumer_config("view"),
        processor.clone(),
    );
    subscription.start().await.unwrap();
    wait_until("snapshot delivery", || {
        !processor.snapshots.lock().unwrap().is_empty()
    })
    .await;

    let snapshots = processor.snapshots.lock().unwrap().clone();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].get("X"), Some(&3));
    assert!(!snapshots[0].contains_key("Y"));
    assert_eq!(subscription.get_value(&"X".to_string()).await, Some(3));

    // The view follows records written after the snapshot.
    producer
        .send_to_partition(
            ProducerRecord::typed("config", &"Z".to_string(), Some(&9i64)).unwrap(),
            0,
        )
        .await
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while subscription.get_value(&"Z".to_string()).await != Some(9) {
        if Instant::now() > deadline {
            panic!("live view never picked up key Z");
        }
        sleep(Duration::from_millis(10)).await;
    }
    subscription.stop().await;
}
