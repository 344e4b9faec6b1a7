//! The storage contract shared by both bus backends.

use async_trait::async_trait;

use streambus_core::{OffsetStrategy, ProducerRecord, Record, Result, Topic, TopicConfig};

/// A partitioned, append-only record store with per-group offset
/// bookkeeping.
///
/// Implementations must support many concurrent readers (one per active
/// subscription) and writers. Offset allocation is linearizable per
/// partition: no two records in the same partition ever receive the same
/// offset, and offsets are gapless from zero.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ==================== Topic Management ====================

    /// Declare a topic. Partition counts are fixed once the topic exists:
    /// re-declaring with the same count is a no-op, a different count is an
    /// error.
    async fn create_topic(&self, config: TopicConfig) -> Result<()>;

    /// Look up a topic by name.
    async fn get_topic(&self, name: &str) -> Result<Option<Topic>>;

    /// All declared topics.
    async fn list_topics(&self) -> Result<Vec<Topic>>;

    // ==================== Writing ====================

    /// Append records, assigning the next offset per target partition.
    ///
    /// Entries without an explicit partition are assigned one from their key
    /// by the store's partitioner. The whole batch becomes visible
    /// atomically; the returned records carry their assigned offsets, in
    /// input order.
    ///
    /// Fails with `UnknownTopic` when a target topic was never declared.
    async fn write(&self, entries: Vec<ProducerRecord>) -> Result<Vec<Record>>;

    // ==================== Reading ====================

    /// Read up to `max_records` for a consumer group, starting at the
    /// group's committed offset per partition.
    ///
    /// A group with no committed offset for a partition gets one created
    /// from `strategy` (EARLIEST = 0, LATEST = the partition's current
    /// tail). Within a partition records come back in strictly increasing
    /// offset order, with no skips and no still-pending transactional
    /// records. `partition = None` reads across all partitions of the topic.
    async fn read(
        &self,
        topic: &str,
        group: &str,
        partition: Option<u32>,
        max_records: usize,
        strategy: OffsetStrategy,
    ) -> Result<Vec<Record>>;

    /// Read up to `max_records` committed records from an explicit position,
    /// without touching any consumer group state.
    async fn read_from(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> Result<Vec<Record>>;

    /// Full committed history of a topic, partition-major, each partition in
    /// offset order from zero. Used to build compacted snapshots.
    async fn replay_all(&self, topic: &str) -> Result<Vec<Record>>;

    /// Next offset that will be assigned in the partition.
    async fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64>;

    // ==================== Consumer Offsets ====================

    /// Set a group's next-offset-to-read for a partition.
    ///
    /// Monotonic: a commit below the current value is ignored, protecting
    /// against out-of-order commits from concurrent callers.
    async fn commit_offset(&self, topic: &str, group: &str, partition: u32, offset: u64)
        -> Result<()>;

    /// The group's next-offset-to-read, if it has ever committed (or been
    /// initialized by a read).
    async fn committed_offset(&self, topic: &str, group: &str, partition: u32)
        -> Result<Option<u64>>;
}
