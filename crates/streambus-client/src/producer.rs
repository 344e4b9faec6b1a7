//! Producers.
//!
//! Two variants write through the bus:
//!
//! - **AtomicProducer** — every send is immediately durable and visible.
//!   There is no transaction boundary; asking it for one fails fast.
//! - **TransactionalProducer** — `begin_transaction()` returns a
//!   [`ProducerTransaction`] handle that buffers sends client-side.
//!   Nothing touches a store until `commit()`, which makes the whole
//!   buffer (and any folded offset commits) visible as one unit.
//!   `abort()` simply drops the buffer. The handle owns its buffer and
//!   is consumed by commit/abort, so a finalized transaction cannot be
//!   reused.
//!
//! Both enforce the configured message size limit and default a record's
//! partition when none was chosen.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use streambus_core::{
    hash_partition, BusError, OffsetCommit, ProducerRecord, Record, RecordMetadata, Result,
};

use crate::bus::MessageBus;
use crate::config::ResolvedProducerConfig;

/// Size check plus default partition routing, applied before any write.
async fn prepare(bus: &MessageBus, record: ProducerRecord) -> Result<ProducerRecord> {
    let size = record.payload_size();
    if size > bus.max_message_size() {
        return Err(BusError::persistence(format!(
            "record of {} bytes for topic '{}' exceeds the {} byte limit",
            size,
            record.topic,
            bus.max_message_size()
        )));
    }
    if record.partition.is_some() {
        return Ok(record);
    }
    let partition_count = bus.partition_count_of(&record.topic).await?;
    // Default routing hashes the topic name, not the record key: every
    // unrouted record for a topic lands on the same partition. Kept for
    // compatibility with existing consumers; pass an explicit partition
    // when spreading matters.
    let partition = hash_partition(record.topic.as_bytes(), partition_count);
    Ok(record.with_partition(partition))
}

// ==================== Atomic producer ====================

/// Producer whose every send is immediately durable and visible.
pub struct AtomicProducer {
    bus: Arc<MessageBus>,
    config: ResolvedProducerConfig,
}

impl AtomicProducer {
    pub fn new(bus: Arc<MessageBus>, config: ResolvedProducerConfig) -> Self {
        Self { bus, config }
    }

    pub async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        let mut metadata = self.send_batch(vec![record]).await?;
        Ok(metadata.remove(0))
    }

    /// Write the batch as one store call; offsets within each partition
    /// are contiguous.
    pub async fn send_batch(&self, records: Vec<ProducerRecord>) -> Result<Vec<RecordMetadata>> {
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            prepared.push(prepare(&self.bus, record).await?);
        }
        let committed = self.bus.publish_atomic(prepared).await?;
        Ok(committed.iter().map(RecordMetadata::from).collect())
    }

    pub async fn send_to_partition(
        &self,
        record: ProducerRecord,
        partition: u32,
    ) -> Result<RecordMetadata> {
        self.send(record.with_partition(partition)).await
    }

    /// Always fails: an atomic producer has no transaction boundary.
    pub fn begin_transaction(&self) -> Result<ProducerTransaction<'_>> {
        Err(BusError::TransactionMisuse(format!(
            "producer '{}' is atomic and cannot open transactions",
            self.config.client_id
        )))
    }

    pub async fn close(&self) -> Result<()> {
        debug!(client_id = %self.config.client_id, "closed atomic producer");
        Ok(())
    }
}

// ==================== Transactional producer ====================

/// Producer whose writes become visible only at transaction commit.
#[derive(Debug)]
pub struct TransactionalProducer {
    bus: Arc<MessageBus>,
    config: ResolvedProducerConfig,
    transactional_id: String,
}

impl TransactionalProducer {
    /// Fails fast when the resolved config carries no `transactionalId`.
    pub fn new(bus: Arc<MessageBus>, config: ResolvedProducerConfig) -> Result<Self> {
        let transactional_id = config.transactional_id.clone().ok_or_else(|| {
            BusError::TransactionMisuse(format!(
                "producer '{}' resolved no transactionalId and cannot open transactions",
                config.client_id
            ))
        })?;
        Ok(Self {
            bus,
            config,
            transactional_id,
        })
    }

    /// Open a transaction handle. On the durable bus this creates the
    /// uncommitted marker row before any record is buffered.
    pub async fn begin_transaction(&self) -> Result<ProducerTransaction<'_>> {
        let transaction_id = format!("{}-{}", self.transactional_id, Uuid::new_v4());
        self.bus.begin_transaction_marker(&transaction_id).await?;
        info!(
            client_id = %self.config.client_id,
            transaction_id = %transaction_id,
            "transaction open"
        );
        Ok(ProducerTransaction {
            producer: self,
            transaction_id,
            entries: Vec::new(),
            offsets: Vec::new(),
        })
    }

    /// Always fails: sends must go through an open transaction handle.
    pub async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        Err(BusError::TransactionMisuse(format!(
            "send to '{}' outside an open transaction",
            record.topic
        )))
    }

    /// Always fails: sends must go through an open transaction handle.
    pub async fn send_batch(&self, _records: Vec<ProducerRecord>) -> Result<Vec<RecordMetadata>> {
        Err(BusError::TransactionMisuse(
            "send_batch outside an open transaction".to_string(),
        ))
    }

    pub async fn commit_transaction(
        &self,
        transaction: ProducerTransaction<'_>,
    ) -> Result<Vec<RecordMetadata>> {
        transaction.commit().await
    }

    pub async fn abort_transaction(&self, transaction: ProducerTransaction<'_>) -> Result<()> {
        transaction.abort().await
    }

    pub async fn close(&self) -> Result<()> {
        debug!(client_id = %self.config.client_id, "closed transactional producer");
        Ok(())
    }
}

/// One open transaction: exclusive owner of its buffered records and
/// staged offset commits until `commit` or `abort` consumes it.
#[derive(Debug)]
pub struct ProducerTransaction<'a> {
    producer: &'a TransactionalProducer,
    transaction_id: String,
    entries: Vec<ProducerRecord>,
    offsets: Vec<OffsetCommit>,
}

impl ProducerTransaction<'_> {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Buffer a record. No offset is known until commit.
    pub async fn send(&mut self, record: ProducerRecord) -> Result<()> {
        let record = prepare(&self.producer.bus, record).await?;
        self.entries.push(record);
        Ok(())
    }

    pub async fn send_batch(&mut self, records: Vec<ProducerRecord>) -> Result<()> {
        for record in records {
            self.send(record).await?;
        }
        Ok(())
    }

    pub async fn send_to_partition(&mut self, record: ProducerRecord, partition: u32) -> Result<()> {
        self.send(record.with_partition(partition)).await
    }

    /// Fold a consumer group's offset advancement over `records` into this
    /// transaction: for each touched partition, the committed position
    /// becomes the batch's maximum offset + 1, applied atomically with the
    /// buffered records at commit.
    pub fn send_offsets(&mut self, group: &str, records: &[Record]) {
        let mut next: HashMap<(String, u32), u64> = HashMap::new();
        for record in records {
            let topic = self.producer.bus.logical_name(&record.topic);
            let entry = next.entry((topic, record.partition)).or_insert(0);
            *entry = (*entry).max(record.offset + 1);
        }
        for ((topic, partition), next_offset) in next {
            self.offsets.push(OffsetCommit {
                topic,
                partition,
                group: group.to_string(),
                next_offset,
            });
        }
    }

    /// Flush everything buffered as one visible unit.
    pub async fn commit(self) -> Result<Vec<RecordMetadata>> {
        let committed = self
            .producer
            .bus
            .publish_transaction(&self.transaction_id, self.entries, self.offsets)
            .await?;
        info!(
            transaction_id = %self.transaction_id,
            records = committed.len(),
            "transaction committed"
        );
        Ok(committed.iter().map(RecordMetadata::from).collect())
    }

    /// Discard the buffer; nothing from this transaction ever becomes
    /// visible. The durable marker, if any, stays uncommitted.
    pub async fn abort(self) -> Result<()> {
        info!(
            transaction_id = %self.transaction_id,
            discarded = self.entries.len(),
            "transaction aborted"
        );
        Ok(())
    }
}
