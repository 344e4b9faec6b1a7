//! In-Memory Record Store
//!
//! The topic-service emulation: partition logs are plain vectors, consumer
//! offsets a map. Serves two roles — the whole bus in single-process
//! deployments and tests, and the delivery path in front of the durable
//! store, where committed records are mirrored in via [`apply_committed`]
//! after the database write succeeds.
//!
//! Because a record's offset equals its index in the partition vector
//! (offsets are gapless from zero), reads are cheap slices. Everything in
//! here is already committed: pending transactional records live in their
//! producer's buffer and never reach this store.
//!
//! [`apply_committed`]: InMemoryRecordStore::apply_committed

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use streambus_core::{
    BusError, OffsetStrategy, PartitionAssignmentListener, Partitioner, ProducerRecord, Record,
    Result, Topic, TopicConfig, ATOMIC_TRANSACTION_ID,
};

use crate::store::RecordStore;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct TopicLog {
    partition_count: u32,
    created_at: i64,
    /// One append-only log per partition; a record's offset is its index.
    partitions: Vec<Vec<Record>>,
    /// (group, partition) -> next offset to read.
    offsets: HashMap<(String, u32), u64>,
}

impl TopicLog {
    fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            created_at: now_ms(),
            partitions: vec![Vec::new(); partition_count as usize],
            offsets: HashMap::new(),
        }
    }

    fn check_partition(&self, topic: &str, partition: u32) -> Result<()> {
        if partition >= self.partition_count {
            return Err(BusError::OffsetNotFound {
                topic: topic.to_string(),
                partition,
            });
        }
        Ok(())
    }
}

/// Pure in-memory implementation of [`RecordStore`].
pub struct InMemoryRecordStore {
    partitioner: Partitioner,
    inner: RwLock<HashMap<String, TopicLog>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_partitioner(Partitioner::new())
    }

    /// A store whose partitioner notifies `listener` on first assignment of
    /// each (topic, partition) pair.
    pub fn with_listener(listener: Arc<dyn PartitionAssignmentListener>) -> Self {
        Self::with_partitioner(Partitioner::with_listener(listener))
    }

    fn with_partitioner(partitioner: Partitioner) -> Self {
        Self {
            partitioner,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Install already-committed records at their assigned offsets.
    ///
    /// This is the mirror/hydration entry point: records come out of the
    /// durable store with offsets already allocated, and each must continue
    /// its partition's log without a gap.
    pub async fn apply_committed(&self, records: Vec<Record>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for record in records {
            let log = inner
                .get_mut(&record.topic)
                .ok_or_else(|| BusError::UnknownTopic(record.topic.clone()))?;
            log.check_partition(&record.topic, record.partition)?;
            let slot = &mut log.partitions[record.partition as usize];
            let expected = slot.len() as u64;
            if record.offset != expected {
                return Err(BusError::persistence(format!(
                    "mirror gap on {}-{}: expected offset {}, got {}",
                    record.topic, record.partition, expected, record.offset
                )));
            }
            slot.push(record);
        }
        Ok(())
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_topic(&self, config: TopicConfig) -> Result<()> {
        if config.partition_count == 0 {
            return Err(BusError::persistence(format!(
                "topic '{}' must have at least one partition",
                config.name
            )));
        }
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.get(&config.name) {
            if existing.partition_count != config.partition_count {
                return Err(BusError::persistence(format!(
                    "topic '{}' already exists with {} partitions",
                    config.name, existing.partition_count
                )));
            }
            return Ok(());
        }
        debug!(topic = %config.name, partitions = config.partition_count, "created topic");
        inner.insert(config.name, TopicLog::new(config.partition_count));
        Ok(())
    }

    async fn get_topic(&self, name: &str) -> Result<Option<Topic>> {
        let inner = self.inner.read().await;
        Ok(inner.get(name).map(|log| Topic {
            name: name.to_string(),
            partition_count: log.partition_count,
            created_at: log.created_at,
        }))
    }

    async fn list_topics(&self) -> Result<Vec<Topic>> {
        let inner = self.inner.read().await;
        let mut topics: Vec<Topic> = inner
            .iter()
            .map(|(name, log)| Topic {
                name: name.clone(),
                partition_count: log.partition_count,
                created_at: log.created_at,
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    async fn write(&self, entries: Vec<ProducerRecord>) -> Result<Vec<Record>> {
        let timestamp = now_ms();
        let mut inner = self.inner.write().await;
        let mut committed = Vec::with_capacity(entries.len());
        for entry in entries {
            let log = inner
                .get_mut(&entry.topic)
                .ok_or_else(|| BusError::UnknownTopic(entry.topic.clone()))?;
            let partition = match entry.partition {
                Some(partition) => {
                    log.check_partition(&entry.topic, partition)?;
                    partition
                }
                None => self
                    .partitioner
                    .assign(&entry.topic, &entry.key, log.partition_count),
            };
            let slot = &mut log.partitions[partition as usize];
            let record = Record {
                topic: entry.topic,
                partition,
                offset: slot.len() as u64,
                timestamp,
                key: entry.key,
                value: entry.value,
                transaction_id: ATOMIC_TRANSACTION_ID.to_string(),
            };
            slot.push(record.clone());
            committed.push(record);
        }
        Ok(committed)
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        partition: Option<u32>,
        max_records: usize,
        strategy: OffsetStrategy,
    ) -> Result<Vec<Record>> {
        // Write lock: a first read may create the group's offset rows.
        let mut inner = self.inner.write().await;
        let log = inner
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        let partitions: Vec<u32> = match partition {
            Some(partition) => {
                log.check_partition(topic, partition)?;
                vec![partition]
            }
            None => (0..log.partition_count).collect(),
        };

        let mut batch = Vec::new();
        for partition in partitions {
            if batch.len() >= max_records {
                break;
            }
            let tail = log.partitions[partition as usize].len() as u64;
            let start = *log
                .offsets
                .entry((group.to_string(), partition))
                .or_insert_with(|| match strategy {
                    OffsetStrategy::Earliest => 0,
                    OffsetStrategy::Latest => tail,
                });
            let remaining = max_records - batch.len();
            batch.extend(
                log.partitions[partition as usize]
                    .iter()
                    .skip(start as usize)
                    .take(remaining)
                    .cloned(),
            );
        }
        Ok(batch)
    }

    async fn read_from(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> Result<Vec<Record>> {
        let inner = self.inner.read().await;
        let log = inner
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        log.check_partition(topic, partition)?;
        Ok(log.partitions[partition as usize]
            .iter()
            .skip(from_offset as usize)
            .take(max_records)
            .cloned()
            .collect())
    }

    async fn replay_all(&self, topic: &str) -> Result<Vec<Record>> {
        let inner = self.inner.read().await;
        let log = inner
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        let mut records = Vec::new();
        for slot in &log.partitions {
            records.extend(slot.iter().cloned());
        }
        Ok(records)
    }

    async fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64> {
        let inner = self.inner.read().await;
        let log = inner
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        log.check_partition(topic, partition)?;
        Ok(log.partitions[partition as usize].len() as u64)
    }

    async fn commit_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        offset: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let log = inner
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        log.check_partition(topic, partition)?;
        let current = log.offsets.entry((group.to_string(), partition)).or_insert(0);
        if offset > *current {
            *current = offset;
        } else {
            debug!(
                topic = %topic,
                group = %group,
                partition = partition,
                committed = *current,
                offered = offset,
                "ignoring non-monotonic offset commit"
            );
        }
        Ok(())
    }

    async fn committed_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Option<u64>> {
        let inner = self.inner.read().await;
        let log = inner
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
        log.check_partition(topic, partition)?;
        Ok(log.offsets.get(&(group.to_string(), partition)).copied())
    }
}
