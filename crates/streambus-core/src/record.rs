//! Record and Topic Data Structures
//!
//! This module defines the fundamental units of data on the bus.
//!
//! ## Structure
//! Each committed record carries:
//! - **topic / partition / offset**: its immutable position in the log
//! - **timestamp**: when the record was written (milliseconds since epoch)
//! - **key**: opaque bytes used for partition assignment and compaction
//! - **value**: opaque payload bytes, or absent — an absent value is a
//!   **tombstone**, the logical deletion marker for its key in a compacted
//!   view
//! - **transaction_id**: the transaction the record was written under;
//!   writes outside an explicit transaction use the reserved
//!   always-committed id
//!
//! ## Design Decisions
//! - Payloads are `bytes::Bytes` for cheap cloning between the durable store
//!   and the in-memory delivery path
//! - Offsets are u64, zero-based, gapless within a partition
//! - `ProducerRecord` leaves the partition optional: producers fill it from
//!   the topic-name hash, callers may pin it explicitly, and a store assigns
//!   it from the record key when it is still unset on arrival

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;

/// Transaction id reserved for writes made outside any explicit transaction.
///
/// The durable store seeds a marker row for this id as already committed, so
/// atomic writes become visible the moment their insert lands.
pub const ATOMIC_TRANSACTION_ID: &str = "atomic-transaction";

/// A committed record: the unit of delivery to subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Topic this record belongs to
    pub topic: String,

    /// Partition within the topic
    pub partition: u32,

    /// Offset within the partition (zero-based, gapless)
    pub offset: u64,

    /// Write timestamp in milliseconds since epoch
    pub timestamp: i64,

    /// Record key
    pub key: Bytes,

    /// Record value; `None` is a tombstone
    pub value: Option<Bytes>,

    /// Transaction the record was written under
    pub transaction_id: String,
}

impl Record {
    /// True when the value is absent, i.e. the record deletes its key from a
    /// compacted view.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Estimate the payload size of this record in bytes.
    pub fn estimated_size(&self) -> usize {
        self.key.len() + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}

/// A record as handed to a producer, before an offset has been assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    /// Target topic
    pub topic: String,

    /// Target partition; when `None` the producer (or store) chooses one
    pub partition: Option<u32>,

    /// Record key
    pub key: Bytes,

    /// Record value; `None` writes a tombstone
    pub value: Option<Bytes>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// A record with an absent value — deletes `key` from compacted views.
    pub fn tombstone(topic: impl Into<String>, key: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: key.into(),
            value: None,
        }
    }

    /// Encode a typed key/value pair. `value = None` produces a tombstone.
    ///
    /// Fails with `SerializationMismatch` when either side cannot be encoded.
    pub fn typed<K, V>(topic: &str, key: &K, value: Option<&V>) -> Result<Self>
    where
        K: Serialize,
        V: Serialize,
    {
        Ok(Self {
            topic: topic.to_string(),
            partition: None,
            key: codec::encode(key)?,
            value: value.map(codec::encode).transpose()?,
        })
    }

    /// Pin the record to an explicit partition.
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Combined key + value size in bytes, as checked against the bus's
    /// maximum allowed message size.
    pub fn payload_size(&self) -> usize {
        self.key.len() + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}

/// Position assigned to a record by a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

impl From<&Record> for RecordMetadata {
    fn from(record: &Record) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        }
    }
}

/// Configuration for declaring a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic name (unique identifier)
    pub name: String,

    /// Number of partitions; fixed once the topic exists
    pub partition_count: u32,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>, partition_count: u32) -> Self {
        Self {
            name: name.into(),
            partition_count,
        }
    }
}

/// An existing topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    /// Topic name
    pub name: String,

    /// Number of partitions
    pub partition_count: u32,

    /// Creation timestamp (milliseconds since epoch)
    pub created_at: i64,
}

/// Starting-offset policy applied when a consumer group has no committed
/// offset for a partition yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OffsetStrategy {
    /// Start from offset 0 and replay the full history.
    #[default]
    Earliest,
    /// Start from the partition's current tail; only new records are seen.
    Latest,
}

impl std::str::FromStr for OffsetStrategy {
    type Err = crate::error::BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "EARLIEST" => Ok(OffsetStrategy::Earliest),
            "LATEST" => Ok(OffsetStrategy::Latest),
            other => Err(crate::error::BusError::SerializationMismatch(format!(
                "invalid offset strategy '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for OffsetStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OffsetStrategy::Earliest => write!(f, "EARLIEST"),
            OffsetStrategy::Latest => write!(f, "LATEST"),
        }
    }
}

/// A staged consumer-offset advancement, as folded into a producer
/// transaction or applied during delivery-store hydration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommit {
    pub topic: String,
    pub partition: u32,
    pub group: String,
    /// Next offset the group should read
    pub next_offset: u64,
}
