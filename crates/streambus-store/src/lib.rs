//! StreamBus Record Store
//!
//! Partitioned record storage for the bus: append-only per-partition logs,
//! consumer-group offsets, and transaction markers, behind one trait with
//! two interchangeable backends.
//!
//! ## Backends
//!
//! - **InMemoryRecordStore**: partition logs as vectors, offsets as a map.
//!   No durability; used for tests and as the delivery mirror the durable
//!   bus serves reads from.
//! - **SqliteRecordStore**: the durable backend. Records, transaction
//!   markers, and consumer offsets live in SQLite; visibility of a record
//!   follows its transaction marker.
//!
//! Both allocate offsets gapless from zero per partition, create a group's
//! offset row on first read (EARLIEST or LATEST), and keep offset commits
//! monotonic.
//!
//! ```text
//! ┌───────────────┐   write / read / commit_offset   ┌─────────────────┐
//! │  MessageBus   │ ───────────────────────────────▶ │   RecordStore   │
//! └───────────────┘                                  ├─────────────────┤
//!                                                    │ InMemory │ SQLite│
//!                                                    └─────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use streambus_store::{RecordStore, SqliteRecordStore};
//! use streambus_core::{OffsetStrategy, ProducerRecord, TopicConfig};
//!
//! let store = SqliteRecordStore::new("bus.db").await?;
//! store.create_topic(TopicConfig::new("orders", 3)).await?;
//!
//! store.write(vec![ProducerRecord::new("orders", "order-1", "{\"qty\":2}")]).await?;
//!
//! let batch = store.read("orders", "billing", None, 100, OffsetStrategy::Earliest).await?;
//! for record in &batch {
//!     println!("{} {}-{}@{}", record.topic, record.partition, record.offset, record.timestamp);
//! }
//! ```

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::InMemoryRecordStore;
pub use sqlite::SqliteRecordStore;
pub use store::RecordStore;
