//! Deterministic Key → Partition Assignment
//!
//! Routes a record key to a partition with `hash(key) % partition_count`,
//! using SipHash so the mapping is stable across processes and restarts
//! (the std `DefaultHasher` makes no such promise).
//!
//! A partitioner optionally carries a [`PartitionAssignmentListener`]. The
//! first time this instance routes any key to a given (topic, partition)
//! pair, the listener's `on_partitions_assigned` fires — exactly once, even
//! when several keys resolve to that partition concurrently. Later hits on
//! the same pair are silent.

use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, PoisonError};

use siphasher::sip::SipHasher;

/// Callback invoked the first time a (topic, partition) pair is assigned by
/// a given [`Partitioner`] instance.
pub trait PartitionAssignmentListener: Send + Sync {
    fn on_partitions_assigned(&self, topic: &str, partition: u32);
}

/// Hash raw bytes onto a partition index.
///
/// Also used by producers to derive a topic's default partition from the
/// topic name itself.
pub fn hash_partition(data: &[u8], partition_count: u32) -> u32 {
    let mut hasher = SipHasher::new();
    hasher.write(data);
    (hasher.finish() % u64::from(partition_count.max(1))) as u32
}

/// Deterministic key→partition mapper with first-assignment notification.
pub struct Partitioner {
    listener: Option<Arc<dyn PartitionAssignmentListener>>,
    notified: Mutex<HashSet<(String, u32)>>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self {
            listener: None,
            notified: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_listener(listener: Arc<dyn PartitionAssignmentListener>) -> Self {
        Self {
            listener: Some(listener),
            notified: Mutex::new(HashSet::new()),
        }
    }

    /// Assign `key` to a partition of `topic`.
    ///
    /// Stable for a given key and partition count. Fires the listener on the
    /// first assignment of each (topic, partition) pair.
    pub fn assign(&self, topic: &str, key: &[u8], partition_count: u32) -> u32 {
        let partition = hash_partition(key, partition_count);
        self.notify_first_assignment(topic, partition);
        partition
    }

    fn notify_first_assignment(&self, topic: &str, partition: u32) {
        let Some(listener) = &self.listener else {
            return;
        };
        // The set insertion decides the winner; the callback runs outside
        // the lock so a slow listener cannot block other producers.
        let first = {
            let mut notified = self
                .notified
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            notified.insert((topic.to_string(), partition))
        };
        if first {
            listener.on_partitions_assigned(topic, partition);
        }
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new()
    }
}
