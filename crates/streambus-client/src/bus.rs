//! The message bus facade.
//!
//! `MessageBus` wires a record store backend to the producer and
//! subscription APIs. In `InMemory` mode there is a single in-memory
//! store. In `Database` mode every write lands in the SQLite store first
//! and is then mirrored into an in-memory copy; subscriptions always poll
//! the in-memory side, so the durable store is never on the read hot path.
//!
//! ## Durability precedes visibility
//!
//! The mirror is only updated after the database write has committed. A
//! record a subscription can see is therefore always durable, and a
//! process restart rebuilds the mirror from the database (committed
//! records plus committed group offsets) before any subscription starts.
//!
//! ## Topic names
//!
//! Callers use logical topic names everywhere. When a `topic_prefix` is
//! configured the bus prepends it exactly once on the way in; stored
//! records carry the prefixed name.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use streambus_core::{
    BusError, OffsetCommit, OffsetStrategy, ProducerRecord, Record, Result, Topic, TopicConfig,
};
use streambus_store::{InMemoryRecordStore, RecordStore, SqliteRecordStore};

use crate::config::{BusConfig, BusType};

/// Partitioned log message bus over one of two interchangeable backends.
pub struct MessageBus {
    config: BusConfig,
    durable: Option<Arc<SqliteRecordStore>>,
    delivery: Arc<InMemoryRecordStore>,
    // Serializes durable-write-then-mirror so the mirror receives batches
    // in offset order.
    write_gate: Mutex<()>,
}

// Manual impl: the store backends hold non-Debug listener trait objects.
impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    /// Construct the bus, create the topics declared in `config`, and (in
    /// `Database` mode) hydrate the delivery mirror from the durable store.
    pub async fn new(config: BusConfig) -> Result<Self> {
        let durable = match config.bus_type {
            BusType::InMemory => None,
            BusType::Database => {
                let path = config.database_path.as_deref().ok_or_else(|| {
                    BusError::persistence("DATABASE bus requires a database path")
                })?;
                Some(Arc::new(SqliteRecordStore::new(path).await?))
            }
        };
        let bus = Self {
            durable,
            delivery: Arc::new(InMemoryRecordStore::new()),
            write_gate: Mutex::new(()),
            config,
        };

        for topic in bus.config.topics.clone() {
            bus.create_topic(&topic.name, topic.partition_count).await?;
        }
        bus.hydrate().await?;

        info!(
            bus_type = ?bus.config.bus_type,
            topics = bus.config.topics.len(),
            instance_id = %bus.config.instance_id,
            "message bus ready"
        );
        Ok(bus)
    }

    // ==================== Topic names ====================

    fn physical(&self, topic: &str) -> String {
        format!("{}{}", self.config.topic_prefix, topic)
    }

    /// Strip the configured prefix from a stored topic name.
    pub fn logical_name(&self, topic: &str) -> String {
        topic
            .strip_prefix(&self.config.topic_prefix)
            .unwrap_or(topic)
            .to_string()
    }

    // ==================== Topics ====================

    /// Declare a topic on every backend the bus runs. Idempotent for an
    /// identical partition count.
    pub async fn create_topic(&self, name: &str, partition_count: u32) -> Result<()> {
        let physical = self.physical(name);
        if let Some(durable) = &self.durable {
            durable
                .create_topic(TopicConfig::new(physical.clone(), partition_count))
                .await?;
        }
        self.delivery
            .create_topic(TopicConfig::new(physical, partition_count))
            .await
    }

    /// All registered topics, under their stored (prefixed) names.
    pub async fn topics(&self) -> Result<Vec<Topic>> {
        self.delivery.list_topics().await
    }

    pub async fn partition_count_of(&self, topic: &str) -> Result<u32> {
        let physical = self.physical(topic);
        match self.delivery.get_topic(&physical).await? {
            Some(topic) => Ok(topic.partition_count),
            None => Err(BusError::UnknownTopic(physical)),
        }
    }

    // ==================== Publishing ====================

    /// Write a batch under the always-committed marker: durable first (in
    /// `Database` mode), then mirrored for delivery.
    pub async fn publish_atomic(&self, entries: Vec<ProducerRecord>) -> Result<Vec<Record>> {
        let entries = self.prefixed(entries);
        let _gate = self.write_gate.lock().await;
        let committed = match &self.durable {
            Some(durable) => {
                let committed = durable.write_atomic(entries).await?;
                self.delivery.apply_committed(committed.clone()).await?;
                committed
            }
            None => self.delivery.write(entries).await?,
        };
        debug!(records = committed.len(), "published atomic batch");
        Ok(committed)
    }

    /// Open the durable marker for a producer transaction. A no-op on the
    /// in-memory bus, where the uncommitted buffer lives only in the
    /// transaction handle.
    pub async fn begin_transaction_marker(&self, transaction_id: &str) -> Result<()> {
        match &self.durable {
            Some(durable) => durable.begin_marker(transaction_id).await,
            None => Ok(()),
        }
    }

    /// Flush a producer transaction: records and folded offset commits
    /// become durable and visible as one unit, then the mirror is updated.
    pub async fn publish_transaction(
        &self,
        transaction_id: &str,
        entries: Vec<ProducerRecord>,
        offsets: Vec<OffsetCommit>,
    ) -> Result<Vec<Record>> {
        let entries = self.prefixed(entries);
        let offsets: Vec<OffsetCommit> = offsets
            .into_iter()
            .map(|commit| OffsetCommit {
                topic: self.physical(&commit.topic),
                ..commit
            })
            .collect();

        let _gate = self.write_gate.lock().await;
        let committed = match &self.durable {
            Some(durable) => {
                let committed = durable
                    .commit_transaction(transaction_id, entries, offsets.clone())
                    .await?;
                self.delivery.apply_committed(committed.clone()).await?;
                committed
            }
            None => self.delivery.write(entries).await?,
        };
        for commit in &offsets {
            self.delivery
                .commit_offset(&commit.topic, &commit.group, commit.partition, commit.next_offset)
                .await?;
        }
        debug!(
            transaction_id = %transaction_id,
            records = committed.len(),
            offset_commits = offsets.len(),
            "published transaction"
        );
        Ok(committed)
    }

    fn prefixed(&self, entries: Vec<ProducerRecord>) -> Vec<ProducerRecord> {
        if self.config.topic_prefix.is_empty() {
            return entries;
        }
        entries
            .into_iter()
            .map(|entry| ProducerRecord {
                topic: self.physical(&entry.topic),
                ..entry
            })
            .collect()
    }

    // ==================== Reading ====================

    pub async fn read(
        &self,
        topic: &str,
        group: &str,
        partition: Option<u32>,
        max_records: usize,
        strategy: OffsetStrategy,
    ) -> Result<Vec<Record>> {
        self.delivery
            .read(&self.physical(topic), group, partition, max_records, strategy)
            .await
    }

    pub async fn read_from(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> Result<Vec<Record>> {
        self.delivery
            .read_from(&self.physical(topic), partition, from_offset, max_records)
            .await
    }

    pub async fn replay_all(&self, topic: &str) -> Result<Vec<Record>> {
        self.delivery.replay_all(&self.physical(topic)).await
    }

    pub async fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64> {
        self.delivery
            .high_watermark(&self.physical(topic), partition)
            .await
    }

    // ==================== Offsets ====================

    /// Advance a group's next-offset-to-read. Durable store first, so a
    /// committed position is never newer in memory than on disk.
    pub async fn commit_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        offset: u64,
    ) -> Result<()> {
        let physical = self.physical(topic);
        if let Some(durable) = &self.durable {
            durable
                .commit_offset(&physical, group, partition, offset)
                .await?;
        }
        self.delivery
            .commit_offset(&physical, group, partition, offset)
            .await
    }

    pub async fn committed_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Option<u64>> {
        self.delivery
            .committed_offset(&self.physical(topic), group, partition)
            .await
    }

    // ==================== Introspection ====================

    pub fn max_message_size(&self) -> usize {
        self.config.max_allowed_message_size
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    // ==================== Hydration ====================

    /// Rebuild the delivery mirror from the durable store: topics, all
    /// committed records, then committed group offsets.
    async fn hydrate(&self) -> Result<()> {
        let Some(durable) = &self.durable else {
            return Ok(());
        };
        let topics = durable.list_topics().await?;
        let mut records = 0usize;
        for topic in &topics {
            self.delivery
                .create_topic(TopicConfig::new(topic.name.clone(), topic.partition_count))
                .await?;
            let replayed = durable.replay_all(&topic.name).await?;
            records += replayed.len();
            self.delivery.apply_committed(replayed).await?;
        }
        let offsets = durable.all_committed_offsets().await?;
        for commit in &offsets {
            self.delivery
                .commit_offset(&commit.topic, &commit.group, commit.partition, commit.next_offset)
                .await?;
        }
        info!(
            topics = topics.len(),
            records,
            offsets = offsets.len(),
            "hydrated delivery store from database"
        );
        Ok(())
    }
}
