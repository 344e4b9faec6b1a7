//! Durable (event-log) subscription.
//!
//! Polls a topic on behalf of one consumer group and hands typed batches
//! to a [`DurableProcessor`]. The group registers from the earliest
//! offset, so a fresh subscription replays the topic's full history.
//!
//! ## Delivery rules
//!
//! - Records that do not decode to the processor's types are silently
//!   dropped from the batch before delivery; their offsets are still
//!   consumed.
//! - A successful `on_next` commits `max offset in batch + 1` for every
//!   partition the batch touched.
//! - A failing `on_next` commits nothing: the identical unread range is
//!   polled again immediately, with no backoff and no retry limit. The
//!   group can never advance past a batch its processor has not handled.
//!
//! The loop sleeps `poll_interval_ms` only when a poll returns nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use streambus_core::{OffsetStrategy, Record, Result};

use crate::bus::MessageBus;
use crate::config::ResolvedConsumerConfig;
use crate::processor::DurableProcessor;

use super::{
    current_state, decode_record, new_shared_state, set_state, ControlSignal, SharedState,
    SubscriptionState,
};

/// At-least-once polling consumer with a dedicated consumption task.
pub struct DurableSubscription<P: DurableProcessor> {
    name: String,
    topic: String,
    config: ResolvedConsumerConfig,
    bus: Arc<MessageBus>,
    processor: Arc<P>,
    state: SharedState,
    control_tx: Option<mpsc::Sender<ControlSignal>>,
    join_handle: Option<JoinHandle<()>>,
}

impl<P: DurableProcessor> DurableSubscription<P> {
    pub fn new(
        bus: Arc<MessageBus>,
        topic: impl Into<String>,
        config: ResolvedConsumerConfig,
        processor: Arc<P>,
    ) -> Self {
        let topic = topic.into();
        Self {
            name: format!("{}-{}", config.group, topic),
            topic,
            config,
            bus,
            processor,
            state: new_shared_state(),
            control_tx: None,
            join_handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        current_state(&self.state) == SubscriptionState::Running
    }

    /// Spawn the consumption task. A no-op when already running; a stopped
    /// subscription stays stopped.
    pub async fn start(&mut self) -> Result<()> {
        match current_state(&self.state) {
            SubscriptionState::Running => return Ok(()),
            SubscriptionState::Stopped => {
                warn!(
                    subscription = %self.name,
                    "subscription is stopped; build a new instance to consume again"
                );
                return Ok(());
            }
            SubscriptionState::Created => {}
        }
        // Unknown topics surface here rather than inside the task.
        self.bus.partition_count_of(&self.topic).await?;

        set_state(&self.state, SubscriptionState::Running);
        let (control_tx, control_rx) = mpsc::channel(1);
        let worker = DurableWorker {
            name: self.name.clone(),
            topic: self.topic.clone(),
            config: self.config.clone(),
            bus: self.bus.clone(),
            processor: self.processor.clone(),
            state: self.state.clone(),
        };
        self.join_handle = Some(tokio::spawn(worker.run(control_rx)));
        self.control_tx = Some(control_tx);
        info!(subscription = %self.name, topic = %self.topic, "durable subscription started");
        Ok(())
    }

    /// Signal the consumption task and wait for it to finish its in-flight
    /// batch and exit. Idempotent.
    pub async fn stop(&mut self) {
        let was_running = self.control_tx.is_some();
        if let Some(control_tx) = self.control_tx.take() {
            let _ = control_tx.send(ControlSignal::Stop).await;
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
        set_state(&self.state, SubscriptionState::Stopped);
        if was_running {
            info!(subscription = %self.name, "durable subscription stopped");
        }
    }
}

struct DurableWorker<P: DurableProcessor> {
    name: String,
    topic: String,
    config: ResolvedConsumerConfig,
    bus: Arc<MessageBus>,
    processor: Arc<P>,
    state: SharedState,
}

impl<P: DurableProcessor> DurableWorker<P> {
    async fn run(self, mut control_rx: mpsc::Receiver<ControlSignal>) {
        loop {
            match control_rx.try_recv() {
                Ok(ControlSignal::Stop) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            match self.poll_once().await {
                // Nothing to read; idle before the next poll.
                Ok(0) => sleep(Duration::from_millis(self.config.poll_interval_ms)).await,
                Ok(_) => {}
                Err(error) => {
                    warn!(subscription = %self.name, error = %error, "poll failed; retrying");
                    sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                }
            }
        }
        set_state(&self.state, SubscriptionState::Stopped);
        info!(subscription = %self.name, "consumption loop exited");
    }

    /// One poll → filter → process → commit pass. Returns the polled record
    /// count; a processor failure still counts as polled so the loop
    /// re-polls immediately.
    async fn poll_once(&self) -> Result<usize> {
        // A durable consumer is typically the system of record for its
        // downstream state, so the group always registers from the
        // earliest offset.
        let batch = self
            .bus
            .read(
                &self.topic,
                &self.config.group,
                None,
                self.config.max_poll_records,
                OffsetStrategy::Earliest,
            )
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let polled = batch.len();

        let typed: Vec<_> = batch
            .iter()
            .filter_map(|record| decode_record::<P::Key, P::Value>(&self.bus, record))
            .collect();
        if !typed.is_empty() {
            if let Err(error) = self.processor.on_next(typed).await {
                warn!(
                    subscription = %self.name,
                    error = %error,
                    "processor failed; batch will be redelivered"
                );
                return Ok(polled);
            }
        }
        // Commit from the unfiltered batch: dropped records are consumed
        // too, otherwise a batch of only mismatches would repoll forever.
        for (partition, next_offset) in next_offsets(&batch) {
            self.bus
                .commit_offset(&self.topic, &self.config.group, partition, next_offset)
                .await?;
        }
        Ok(polled)
    }
}

fn next_offsets(batch: &[Record]) -> HashMap<u32, u64> {
    let mut next = HashMap::new();
    for record in batch {
        let entry = next.entry(record.partition).or_insert(0);
        *entry = (*entry).max(record.offset + 1);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::processor::{ConsumerRecord, ProcessorError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;
    use streambus_core::{BusError, ProducerRecord};

    /// Records every call; the first `fail_first` calls return an error.
    struct RecordingProcessor {
        fail_first: AtomicUsize,
        calls: AtomicUsize,
        successes: AtomicUsize,
        batches: Mutex<Vec<Vec<u64>>>,
        keys: Mutex<Vec<String>>,
    }

    impl RecordingProcessor {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_first: AtomicUsize::new(fail_first),
                calls: AtomicUsize::new(0),
                successes: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
                keys: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DurableProcessor for RecordingProcessor {
        type Key = String;
        type Value = String;

        async fn on_next(
            &self,
            batch: Vec<ConsumerRecord<String, String>>,
        ) -> std::result::Result<(), ProcessorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|r| r.offset).collect());
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err("simulated processing failure".into());
            }
            self.keys
                .lock()
                .unwrap()
                .extend(batch.iter().map(|r| r.key.clone()));
            self.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn consumer_config(group: &str) -> ResolvedConsumerConfig {
        ResolvedConsumerConfig {
            group: group.to_string(),
            client_id: format!("{}-test", group),
            max_poll_records: 10,
            offset_reset_strategy: OffsetStrategy::Earliest,
            poll_interval_ms: 10,
        }
    }

    async fn bus_with_topic(partitions: u32) -> Arc<MessageBus> {
        Arc::new(
            MessageBus::new(BusConfig::in_memory().with_topic("orders", partitions))
                .await
                .unwrap(),
        )
    }

    async fn publish_typed(bus: &MessageBus, keys: &[&str]) {
        let entries = keys
            .iter()
            .map(|key| {
                ProducerRecord::typed("orders", &key.to_string(), Some(&format!("value-{}", key)))
                    .unwrap()
                    .with_partition(0)
            })
            .collect();
        bus.publish_atomic(entries).await.unwrap();
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

    async fn wait_for_offset(bus: &MessageBus, group: &str, partition: u32, expected: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let committed = bus
                .committed_offset("orders", group, partition)
                .await
                .unwrap();
            if committed == Some(expected) {
                return;
            }
            if Instant::now() > deadline {
                panic!("offset never reached {} (last: {:?})", expected, committed);
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_delivers_batches_and_commits_offsets() {
        let bus = bus_with_topic(1).await;
        publish_typed(&bus, &["a", "b", "c"]).await;

        let processor = RecordingProcessor::new(0);
        let mut subscription = DurableSubscription::new(
            bus.clone(),
            "orders",
            consumer_config("g1"),
            processor.clone(),
        );
        subscription.start().await.unwrap();
        assert!(subscription.is_running());

        wait_for_offset(&bus, "g1", 0, 3).await;
        subscription.stop().await;

        assert_eq!(processor.keys.lock().unwrap().clone(), vec!["a", "b", "c"]);
        assert_eq!(processor.successes.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_running());
    }

    #[tokio::test]
    async fn test_failing_processor_redelivers_the_same_batch() {
        let bus = bus_with_topic(1).await;
        publish_typed(&bus, &["a", "b", "c"]).await;

        let processor = RecordingProcessor::new(2);
        let mut subscription = DurableSubscription::new(
            bus.clone(),
            "orders",
            consumer_config("g1"),
            processor.clone(),
        );
        subscription.start().await.unwrap();

        wait_for_offset(&bus, "g1", 0, 3).await;
        subscription.stop().await;

        // Two failures then one success, each seeing the identical range;
        // the offset advanced exactly once.
        let batches = processor.batches.lock().unwrap().clone();
        assert!(batches.len() >= 3);
        assert!(batches.iter().all(|offsets| offsets == &vec![0, 1, 2]));
        assert_eq!(processor.successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mismatched_records_are_dropped_but_consumed() {
        let bus = bus_with_topic(1).await;
        // One decodable record and one whose key/value are not JSON at all.
        bus.publish_atomic(vec![
            ProducerRecord::typed("orders", &"good".to_string(), Some(&"v".to_string()))
                .unwrap()
                .with_partition(0),
            ProducerRecord::new("orders", "raw-key", "raw-value").with_partition(0),
        ])
        .await
        .unwrap();

        let processor = RecordingProcessor::new(0);
        let mut subscription = DurableSubscription::new(
            bus.clone(),
            "orders",
            consumer_config("g1"),
            processor.clone(),
        );
        subscription.start().await.unwrap();

        // Both offsets are consumed even though only one record was delivered.
        wait_for_offset(&bus, "g1", 0, 2).await;
        subscription.stop().await;

        assert_eq!(processor.keys.lock().unwrap().clone(), vec!["good"]);
    }

    #[tokio::test]
    async fn test_fully_mismatched_batch_still_advances() {
        let bus = bus_with_topic(1).await;
        bus.publish_atomic(vec![
            ProducerRecord::new("orders", "raw-1", "x").with_partition(0),
            ProducerRecord::new("orders", "raw-2", "y").with_partition(0),
        ])
        .await
        .unwrap();

        let processor = RecordingProcessor::new(0);
        let mut subscription = DurableSubscription::new(
            bus.clone(),
            "orders",
            consumer_config("g1"),
            processor.clone(),
        );
        subscription.start().await.unwrap();

        wait_for_offset(&bus, "g1", 0, 2).await;
        subscription.stop().await;

        // The processor never saw the undecodable records.
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stopped_subscription_is_terminal() {
        let bus = bus_with_topic(1).await;
        let processor = RecordingProcessor::new(0);
        let mut subscription = DurableSubscription::new(
            bus.clone(),
            "orders",
            consumer_config("g1"),
            processor.clone(),
        );

        subscription.start().await.unwrap();
        subscription.start().await.unwrap(); // running: no-op
        subscription.stop().await;
        subscription.stop().await; // idempotent

        subscription.start().await.unwrap(); // stopped: stays stopped
        assert!(!subscription.is_running());

        publish_typed(&bus, &["late"]).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_on_unknown_topic_fails() {
        let bus = bus_with_topic(1).await;
        let processor = RecordingProcessor::new(0);
        let mut subscription = DurableSubscription::new(
            bus,
            "missing",
            consumer_config("g1"),
            processor,
        );
        let err = subscription.start().await.unwrap_err();
        assert!(matches!(err, BusError::UnknownTopic(_)));
        assert!(!subscription.is_running());
    }

    #[tokio::test]
    async fn test_next_offsets_takes_batch_maximum_per_partition() {
        let record = |partition: u32, offset: u64| Record {
            topic: "orders".to_string(),
            partition,
            offset,
            timestamp: 0,
            key: bytes::Bytes::from("k"),
            value: None,
            transaction_id: streambus_core::ATOMIC_TRANSACTION_ID.to_string(),
        };
        let next = next_offsets(&[record(0, 4), record(0, 6), record(1, 0)]);
        assert_eq!(next[&0], 7);
        assert_eq!(next[&1], 1);
    }
}
