//! Error Types for the Message Bus
//!
//! The bus exposes a single closed error enumeration. Every fatal condition a
//! caller can observe maps onto one of the five kinds below; there is no open
//! hierarchy to extend. Recoverable conditions (a processor failing mid-batch
//! in a durable subscription) never surface here at all — the subscription
//! loop retries them, and they are visible only through logs and stalled
//! offsets.
//!
//! ## Kinds
//!
//! - `UnknownTopic`: the topic was never declared to the bus.
//! - `OffsetNotFound`: a partition offset was required but could not be
//!   located (typically a partition index outside the topic's range).
//! - `TransactionMisuse`: a transaction method was called outside a valid
//!   open transaction, or on a producer that does not support transactions.
//! - `SerializationMismatch`: a key or value could not be encoded or decoded
//!   as the declared type.
//! - `PersistenceFailure`: the durable store rejected or failed an operation.
//!
//! Database and serde failures are wrapped via the [`BusError::persistence`]
//! and [`BusError::serialization`] helpers at the call site rather than
//! through blanket `From` impls, which keeps the set of kinds closed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("offset not found for {topic}-{partition}")]
    OffsetNotFound { topic: String, partition: u32 },

    #[error("transaction misuse: {0}")]
    TransactionMisuse(String),

    #[error("serialization mismatch: {0}")]
    SerializationMismatch(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl BusError {
    /// Wrap a storage-layer failure.
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        BusError::PersistenceFailure(err.to_string())
    }

    /// Wrap an encode/decode failure.
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        BusError::SerializationMismatch(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
