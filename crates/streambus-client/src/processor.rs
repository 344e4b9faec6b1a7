//! Processor traits — the user-supplied half of a subscription.
//!
//! Processors declare their key/value types; the subscription decodes
//! each polled record into them and silently drops records that do not
//! decode (see the subscription modules for the delivery rules around
//! that filter).

use std::collections::HashMap;
use std::error::Error;
use std::hash::Hash;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// A decoded record as delivered to processors.
///
/// `value` is `None` for a tombstone. `topic` is the logical name, with
/// any configured prefix already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord<K, V> {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub timestamp: i64,
    pub key: K,
    pub value: Option<V>,
}

impl<K, V> ConsumerRecord<K, V> {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Error a processor reports from `on_next`. Treated as recoverable: the
/// subscription logs it and redelivers the same batch, forever.
pub type ProcessorError = Box<dyn Error + Send + Sync>;

/// Receives batches from a [`DurableSubscription`].
///
/// Delivery is at-least-once: a crash or an `Err` from `on_next` means
/// the same records arrive again, so implementations must be idempotent.
///
/// [`DurableSubscription`]: crate::subscription::DurableSubscription
#[async_trait]
pub trait DurableProcessor: Send + Sync + 'static {
    type Key: DeserializeOwned + Send + Sync + 'static;
    type Value: DeserializeOwned + Send + Sync + 'static;

    /// Handle one polled batch. Returning `Err` leaves the group offset
    /// where it was; the batch is redelivered on the next poll.
    async fn on_next(
        &self,
        batch: Vec<ConsumerRecord<Self::Key, Self::Value>>,
    ) -> Result<(), ProcessorError>;
}

/// Receives the snapshot and per-record updates from a
/// [`CompactedSubscription`].
///
/// [`CompactedSubscription`]: crate::subscription::CompactedSubscription
#[async_trait]
pub trait CompactedProcessor: Send + Sync + 'static {
    type Key: DeserializeOwned + Clone + Eq + Hash + Send + Sync + 'static;
    type Value: DeserializeOwned + Clone + Send + Sync + 'static;

    /// Called exactly once, after the startup replay resolved the full
    /// key→latest-value map.
    async fn on_snapshot(&self, snapshot: &HashMap<Self::Key, Self::Value>);

    /// Called for every record observed after the snapshot. `current` is
    /// the live map as it stood *before* this record is applied;
    /// `previous` is the value the record's key had in it, if any.
    async fn on_next(
        &self,
        record: ConsumerRecord<Self::Key, Self::Value>,
        previous: Option<Self::Value>,
        current: &HashMap<Self::Key, Self::Value>,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_detection() {
        let record = ConsumerRecord::<String, i64> {
            topic: "orders".to_string(),
            partition: 0,
            offset: 4,
            timestamp: 0,
            key: "k".to_string(),
            value: None,
        };
        assert!(record.is_tombstone());
        assert!(!ConsumerRecord { value: Some(1), ..record }.is_tombstone());
    }
}
