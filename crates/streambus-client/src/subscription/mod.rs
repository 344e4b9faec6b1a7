//! Subscriptions.
//!
//! Each subscription owns one dedicated consumption task, spawned at
//! `start()` and joined at `stop()`. Control is cooperative: the loop
//! checks its control channel between batches, so an in-flight batch
//! always completes (processing and offset commit) before the task
//! exits. A stopped subscription is terminal; build a new instance to
//! consume again.

use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use streambus_core::{codec, Record};

use crate::bus::MessageBus;
use crate::processor::ConsumerRecord;

pub mod compacted;
pub mod durable;

pub use compacted::CompactedSubscription;
pub use durable::DurableSubscription;

/// Lifecycle of a subscription. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Running,
    Stopped,
}

/// Signal sent to a consumption task.
pub(crate) enum ControlSignal {
    Stop,
}

pub(crate) type SharedState = Arc<Mutex<SubscriptionState>>;

pub(crate) fn new_shared_state() -> SharedState {
    Arc::new(Mutex::new(SubscriptionState::Created))
}

pub(crate) fn current_state(state: &SharedState) -> SubscriptionState {
    *state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn set_state(state: &SharedState, next: SubscriptionState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

/// Decode a stored record into the processor's declared types.
///
/// Returns `None` when the key, or a present value, does not decode —
/// the silent-drop filter. A tombstone (absent value) always passes the
/// value side.
pub(crate) fn decode_record<K, V>(bus: &MessageBus, record: &Record) -> Option<ConsumerRecord<K, V>>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    let key = codec::decode_opt::<K>(&record.key)?;
    let value = match &record.value {
        Some(bytes) => Some(codec::decode_opt::<V>(bytes)?),
        None => None,
    };
    Some(ConsumerRecord {
        topic: bus.logical_name(&record.topic),
        partition: record.partition,
        offset: record.offset,
        timestamp: record.timestamp,
        key,
        value,
    })
}
