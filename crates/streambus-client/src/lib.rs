//! StreamBus Client
//!
//! The user-facing API of the bus: wiring, producers, and subscriptions
//! over the record store layer.
//!
//! ## Components
//!
//! - **MessageBus**: selects the backend (in-memory, or SQLite mirrored
//!   into memory for delivery), creates the configured topics, and owns
//!   the durable-write-then-mirror ordering.
//! - **AtomicProducer / TransactionalProducer**: write through the bus.
//!   Atomic sends are durable and visible immediately; transactional
//!   sends buffer in a [`ProducerTransaction`] handle and become visible
//!   only when it commits.
//! - **DurableSubscription**: at-least-once polling consumer for one
//!   group; commits offsets only after its processor succeeds and
//!   redelivers a failed batch forever.
//! - **CompactedSubscription**: replays a topic into a key→latest-value
//!   snapshot, then follows new records, keeping the view live.
//! - **ConfigResolver**: merges enforced, per-role, and caller parameters
//!   into the resolved structs the clients consume.
//!
//! ```text
//! AtomicProducer ──┐                          ┌── DurableSubscription ── DurableProcessor
//!                  ▼                          │
//!            ┌──────────┐   poll / commit     │
//!            │MessageBus│ ◄───────────────────┤
//!            └────┬─────┘                     │
//!    write        │ mirror                    └── CompactedSubscription ── CompactedProcessor
//!         SQLite ─┴─ in-memory
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use streambus_client::{AtomicProducer, BusConfig, ConfigResolver, MessageBus};
//! use streambus_core::ProducerRecord;
//!
//! let bus = Arc::new(MessageBus::new(BusConfig::database("bus.db").with_topic("orders", 3)).await?);
//! let resolver = ConfigResolver::from_config(&BusConfig::default());
//!
//! let producer = AtomicProducer::new(
//!     bus.clone(),
//!     resolver.resolve_producer("order.writer", &Default::default())?,
//! );
//! producer.send(ProducerRecord::typed("orders", &"order-1", Some(&42))?).await?;
//! ```

pub mod bus;
pub mod config;
pub mod processor;
pub mod producer;
pub mod subscription;

pub use bus::MessageBus;
pub use config::{
    BusConfig, BusType, ConfigResolver, ResolvedConsumerConfig, ResolvedProducerConfig, CLIENT_ID,
    MAX_POLL_RECORDS, OFFSET_RESET_STRATEGY, POLL_INTERVAL_MS, TRANSACTIONAL_ID,
};
pub use processor::{CompactedProcessor, ConsumerRecord, DurableProcessor, ProcessorError};
pub use producer::{AtomicProducer, ProducerTransaction, TransactionalProducer};
pub use subscription::{CompactedSubscription, DurableSubscription, SubscriptionState};
