//! Compacted subscription.
//!
//! Maintains an eventually-consistent key→latest-value view of a topic.
//! On start the consumption task replays the topic's full history,
//! folding it into a map — insert on a present value, remove the key on
//! a tombstone — and delivers that map once via `on_snapshot`. After the
//! snapshot, each newly observed record triggers `on_next(record,
//! previous_value, current_map)` and is applied to the live map only
//! after the callback returns, so a processor always sees the map as it
//! stood before the record.
//!
//! A compacted consumer tracks its partition positions itself and never
//! commits group offsets: the view is rebuilt from a full replay on
//! every start.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use streambus_core::{Record, Result};

use crate::bus::MessageBus;
use crate::config::ResolvedConsumerConfig;
use crate::processor::CompactedProcessor;

use super::{
    current_state, decode_record, new_shared_state, set_state, ControlSignal, SharedState,
    SubscriptionState,
};

type Snapshot<P> =
    Arc<RwLock<HashMap<<P as CompactedProcessor>::Key, <P as CompactedProcessor>::Value>>>;

/// Key→latest-value subscription with a dedicated consumption task.
pub struct CompactedSubscription<P: CompactedProcessor> {
    name: String,
    topic: String,
    config: ResolvedConsumerConfig,
    bus: Arc<MessageBus>,
    processor: Arc<P>,
    snapshot: Snapshot<P>,
    ready: Arc<AtomicBool>,
    state: SharedState,
    control_tx: Option<mpsc::Sender<ControlSignal>>,
    join_handle: Option<JoinHandle<()>>,
}

impl<P: CompactedProcessor> CompactedSubscription<P> {
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
            snapshot: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(AtomicBool::new(false)),
            state: new_shared_state(),
            control_tx: None,
            join_handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff the consumption task is alive, whether or not the initial
    /// snapshot has completed.
    pub fn is_running(&self) -> bool {
        current_state(&self.state) == SubscriptionState::Running
    }

    /// True once the snapshot has been delivered to the processor.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Latest value for `key` in the live view, if any.
    pub async fn get_value(&self, key: &P::Key) -> Option<P::Value> {
        self.snapshot.read().await.get(key).cloned()
    }

    /// Spawn the consumption task: replay, snapshot, then follow new
    /// records. Idempotent while running; a stopped subscription stays
    /// stopped.
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
        let partition_count = self.bus.partition_count_of(&self.topic).await?;

        set_state(&self.state, SubscriptionState::Running);
        let (control_tx, control_rx) = mpsc::channel(1);
        let worker = CompactedWorker {
            name: self.name.clone(),
            topic: self.topic.clone(),
            partition_count,
            config: self.config.clone(),
            bus: self.bus.clone(),
            processor: self.processor.clone(),
            snapshot: self.snapshot.clone(),
            ready: self.ready.clone(),
            state: self.state.clone(),
        };
        self.join_handle = Some(tokio::spawn(worker.run(control_rx)));
        self.control_tx = Some(control_tx);
        info!(subscription = %self.name, topic = %self.topic, "compacted subscription started");
        Ok(())
    }

    /// Stop the consumption task exactly once, joining it so an in-flight
    /// record finishes. Idempotent.
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
            info!(subscription = %self.name, "compacted subscription stopped");
        }
    }
}

struct CompactedWorker<P: CompactedProcessor> {
    name: String,
    topic: String,
    partition_count: u32,
    config: ResolvedConsumerConfig,
    bus: Arc<MessageBus>,
    processor: Arc<P>,
    snapshot: Snapshot<P>,
    ready: Arc<AtomicBool>,
    state: SharedState,
}

impl<P: CompactedProcessor> CompactedWorker<P> {
    async fn run(self, mut control_rx: mpsc::Receiver<ControlSignal>) {
        let mut positions = match self.build_snapshot().await {
            Ok(positions) => positions,
            Err(err) => {
                error!(subscription = %self.name, error = %err, "snapshot replay failed");
                set_state(&self.state, SubscriptionState::Stopped);
                return;
            }
        };

        loop {
            match control_rx.try_recv() {
                Ok(ControlSignal::Stop) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            let mut observed = 0usize;
            for partition in 0..self.partition_count {
                let from_offset = positions[partition as usize];
                let batch = match self
                    .bus
                    .read_from(&self.topic, partition, from_offset, self.config.max_poll_records)
                    .await
                {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(subscription = %self.name, error = %err, "poll failed; retrying");
                        continue;
                    }
                };
                for record in batch {
                    positions[record.partition as usize] = record.offset + 1;
                    observed += 1;
                    self.deliver(record).await;
                }
            }
            if observed == 0 {
                sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
            }
        }
        set_state(&self.state, SubscriptionState::Stopped);
        info!(subscription = %self.name, "consumption loop exited");
    }

    /// Replay the full topic, fold it into the live map, and deliver the
    /// snapshot once. Returns the next offset to follow per partition.
    async fn build_snapshot(&self) -> Result<Vec<u64>> {
        let mut positions = vec![0u64; self.partition_count as usize];
        let mut resolved = HashMap::new();
        for record in self.bus.replay_all(&self.topic).await? {
            positions[record.partition as usize] = record.offset + 1;
            Self::fold(&self.bus, &mut resolved, &record);
        }
        let keys = resolved.len();
        *self.snapshot.write().await = resolved;
        {
            let snapshot = self.snapshot.read().await;
            self.processor.on_snapshot(&snapshot).await;
        }
        self.ready.store(true, Ordering::SeqCst);
        info!(subscription = %self.name, keys, "snapshot delivered");
        Ok(positions)
    }

    /// Last-write-wins fold: present value inserts, tombstone removes.
    /// Records that do not decode are dropped.
    fn fold(bus: &MessageBus, map: &mut HashMap<P::Key, P::Value>, record: &Record) {
        let Some(typed) = decode_record::<P::Key, P::Value>(bus, record) else {
            return;
        };
        match typed.value {
            Some(value) => {
                map.insert(typed.key, value);
            }
            None => {
                map.remove(&typed.key);
            }
        }
    }

    /// Deliver one post-snapshot record, then apply it to the live map.
    async fn deliver(&self, record: Record) {
        let Some(typed) = decode_record::<P::Key, P::Value>(&self.bus, &record) else {
            return;
        };
        let key = typed.key.clone();
        let value = typed.value.clone();
        let previous = self.snapshot.read().await.get(&key).cloned();
        {
            // The callback sees the map without this record applied.
            let snapshot = self.snapshot.read().await;
            self.processor.on_next(typed, previous, &snapshot).await;
        }
        let mut snapshot = self.snapshot.write().await;
        match value {
            Some(value) => {
                snapshot.insert(key, value);
            }
            None => {
                snapshot.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::processor::ConsumerRecord;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Instant;
    use streambus_core::{OffsetStrategy, ProducerRecord};

    /// One observed update: key, new value, previous value, and the value
    /// the live map held for the key at callback time.
    type Update = (String, Option<i64>, Option<i64>, Option<i64>);

    struct ViewProcessor {
        snapshots: Mutex<Vec<HashMap<String, i64>>>,
        updates: Mutex<Vec<Update>>,
    }

    impl ViewProcessor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                snapshots: Mutex::new(Vec::new()),
                updates: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompactedProcessor for ViewProcessor {
        type Key = String;
        type Value = i64;

        async fn on_snapshot(&self, snapshot: &HashMap<String, i64>) {
            self.snapshots.lock().unwrap().push(snapshot.clone());
        }

        async fn on_next(
            &self,
            record: ConsumerRecord<String, i64>,
            previous: Option<i64>,
            current: &HashMap<String, i64>,
        ) {
            self.updates.lock().unwrap().push((
                record.key.clone(),
                record.value,
                previous,
                current.get(&record.key).copied(),
            ));
        }
    }

    fn consumer_config() -> ResolvedConsumerConfig {
        ResolvedConsumerConfig {
            group: "view".to_string(),
            client_id: "view-test".to_string(),
            max_poll_records: 10,
            offset_reset_strategy: OffsetStrategy::Earliest,
            poll_interval_ms: 10,
        }
    }

    async fn bus_with_topic() -> Arc<MessageBus> {
        Arc::new(
            MessageBus::new(BusConfig::in_memory().with_topic("config", 1))
                .await
                .unwrap(),
        )
    }

    async fn publish(bus: &MessageBus, key: &str, value: Option<i64>) {
        let entry = ProducerRecord::typed("config", &key.to_string(), value.as_ref())
            .unwrap()
            .with_partition(0);
        bus.publish_atomic(vec![entry]).await.unwrap();
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

    #[tokio::test]
    async fn test_snapshot_resolves_last_value_and_drops_tombstoned_keys() {
        let bus = bus_with_topic().await;
        publish(&bus, "X", Some(1)).await;
        publish(&bus, "Y", Some(2)).await;
        publish(&bus, "X", Some(3)).await;
        publish(&bus, "Y", None).await; // tombstone

        let processor = ViewProcessor::new();
        let mut subscription =
            CompactedSubscription::new(bus, "config", consumer_config(), processor.clone());
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
        assert_eq!(subscription.get_value(&"Y".to_string()).await, None);
        subscription.stop().await;
    }

    #[tokio::test]
    async fn test_updates_see_previous_value_and_pre_update_map() {
        let bus = bus_with_topic().await;
        publish(&bus, "X", Some(3)).await;

        let processor = ViewProcessor::new();
        let mut subscription =
            CompactedSubscription::new(bus.clone(), "config", consumer_config(), processor.clone());
        subscription.start().await.unwrap();
        wait_until("snapshot delivery", || subscription.is_ready()).await;

        publish(&bus, "X", Some(5)).await;
        wait_until("live update", || {
            !processor.updates.lock().unwrap().is_empty()
        })
        .await;
        subscription.stop().await;

        let updates = processor.updates.lock().unwrap().clone();
        // New value 5, previous 3, and the callback-time map still held 3.
        assert_eq!(updates[0], ("X".to_string(), Some(5), Some(3), Some(3)));
        assert_eq!(subscription.get_value(&"X".to_string()).await, Some(5));
    }

    #[tokio::test]
    async fn test_live_tombstone_removes_the_key() {
        let bus = bus_with_topic().await;
        publish(&bus, "X", Some(5)).await;

        let processor = ViewProcessor::new();
        let mut subscription =
            CompactedSubscription::new(bus.clone(), "config", consumer_config(), processor.clone());
        subscription.start().await.unwrap();
        wait_until("snapshot delivery", || subscription.is_ready()).await;

        publish(&bus, "X", None).await;
        wait_until("tombstone update", || {
            !processor.updates.lock().unwrap().is_empty()
        })
        .await;
        subscription.stop().await;

        let updates = processor.updates.lock().unwrap().clone();
        assert_eq!(updates[0], ("X".to_string(), None, Some(5), Some(5)));
        assert_eq!(subscription.get_value(&"X".to_string()).await, None);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let bus = bus_with_topic().await;
        let processor = ViewProcessor::new();
        let mut subscription =
            CompactedSubscription::new(bus, "config", consumer_config(), processor.clone());

        subscription.start().await.unwrap();
        subscription.start().await.unwrap();
        wait_until("snapshot delivery", || subscription.is_ready()).await;
        assert_eq!(processor.snapshots.lock().unwrap().len(), 1);

        subscription.stop().await;
        subscription.stop().await;
        assert!(!subscription.is_running());

        // Terminal: restarting a stopped subscription does nothing.
        subscription.start().await.unwrap();
        assert!(!subscription.is_running());
    }

    #[tokio::test]
    async fn test_undecodable_records_are_skipped() {
        let bus = bus_with_topic().await;
        publish(&bus, "X", Some(1)).await;
        bus.publish_atomic(vec![
            ProducerRecord::new("config", "raw-bytes", "not json").with_partition(0)
        ])
        .await
        .unwrap();
        publish(&bus, "Z", Some(9)).await;

        let processor = ViewProcessor::new();
        let mut subscription =
            CompactedSubscription::new(bus, "config", consumer_config(), processor.clone());
        subscription.start().await.unwrap();
        wait_until("snapshot delivery", || subscription.is_ready()).await;
        subscription.stop().await;

        let snapshots = processor.snapshots.lock().unwrap().clone();
        assert_eq!(snapshots[0].len(), 2);
        assert_eq!(snapshots[0].get("X"), Some(&1));
        assert_eq!(snapshots[0].get("Z"), Some(&9));
    }
}
