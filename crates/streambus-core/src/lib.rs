pub mod codec;
pub mod error;
pub mod partitioner;
pub mod record;

pub use error::{BusError, Result};
pub use partitioner::{hash_partition, PartitionAssignmentListener, Partitioner};
pub use record::{
    OffsetCommit, OffsetStrategy, ProducerRecord, Record, RecordMetadata, Topic, TopicConfig,
    ATOMIC_TRANSACTION_ID,
};
