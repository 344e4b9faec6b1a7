//! Bus configuration and the config resolver.
//!
//! `BusConfig` is the static wiring for one bus instance: which backend,
//! where the database lives, which topics exist, and the instance-wide
//! limits. The `ConfigResolver` produces the per-role runtime parameters
//! producers and subscriptions consume as already-resolved structs.
//!
//! ## Resolution order
//!
//! For each key, highest precedence first:
//!
//! 1. enforced overrides (operator-pinned, cannot be overridden)
//! 2. stored per-role parameters
//! 3. caller-supplied parameters
//! 4. library defaults
//!
//! Consumers and producers never read raw key/value maps; they receive
//! [`ResolvedConsumerConfig`] / [`ResolvedProducerConfig`].

use std::collections::HashMap;
use std::str::FromStr;

use streambus_core::{BusError, OffsetStrategy, Result, TopicConfig};

// ==================== Keys & defaults ====================

/// Maximum records returned by one subscription poll.
pub const MAX_POLL_RECORDS: &str = "maxPollRecords";
/// Starting-offset policy for a group's first poll: `EARLIEST` or `LATEST`.
pub const OFFSET_RESET_STRATEGY: &str = "offsetResetStrategy";
/// Sleep between polls that return nothing, in milliseconds.
pub const POLL_INTERVAL_MS: &str = "pollIntervalMs";
/// Overrides the generated client id.
pub const CLIENT_ID: &str = "clientId";
/// Marks a producer role transactional and names its transaction-id prefix.
pub const TRANSACTIONAL_ID: &str = "transactionalId";

pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
/// 950 KiB, matching the broker-side default this bus emulates.
pub const DEFAULT_MAX_ALLOWED_MESSAGE_SIZE: usize = 972_800;

// ==================== Bus configuration ====================

/// Which record store backs the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusType {
    /// Pure in-memory emulation; nothing survives the process.
    #[default]
    InMemory,
    /// SQLite-backed durable store mirrored into memory for delivery.
    Database,
}

impl FromStr for BusType {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INMEMORY" => Ok(BusType::InMemory),
            "DATABASE" => Ok(BusType::Database),
            other => Err(BusError::serialization(format!(
                "invalid bus type '{}', expected INMEMORY or DATABASE",
                other
            ))),
        }
    }
}

/// Static configuration for one [`MessageBus`](crate::MessageBus) instance.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Identifies this process in generated client ids.
    pub instance_id: String,
    /// Prepended to every topic name at the API boundary; empty disables.
    pub topic_prefix: String,
    /// Largest encoded key+value a producer accepts, in bytes.
    pub max_allowed_message_size: usize,
    pub bus_type: BusType,
    /// SQLite database path; required when `bus_type` is `Database`.
    pub database_path: Option<String>,
    /// Topics created when the bus is constructed.
    pub topics: Vec<TopicConfig>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            instance_id: "streambus".to_string(),
            topic_prefix: String::new(),
            max_allowed_message_size: DEFAULT_MAX_ALLOWED_MESSAGE_SIZE,
            bus_type: BusType::InMemory,
            database_path: None,
            topics: Vec::new(),
        }
    }
}

impl BusConfig {
    /// Config for a purely in-memory bus.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Config for a durable bus persisting to `path`.
    pub fn database(path: impl Into<String>) -> Self {
        Self {
            bus_type: BusType::Database,
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_allowed_message_size = bytes;
        self
    }

    /// Declare a topic to be created at bus construction.
    pub fn with_topic(mut self, name: impl Into<String>, partition_count: u32) -> Self {
        self.topics.push(TopicConfig::new(name, partition_count));
        self
    }
}

// ==================== Resolved parameter structs ====================

/// Fully merged runtime parameters for one consumer group.
#[derive(Debug, Clone)]
pub struct ResolvedConsumerConfig {
    pub group: String,
    pub client_id: String,
    pub max_poll_records: usize,
    pub offset_reset_strategy: OffsetStrategy,
    pub poll_interval_ms: u64,
}

/// Fully merged runtime parameters for one producer.
#[derive(Debug, Clone)]
pub struct ResolvedProducerConfig {
    pub client_id: String,
    /// Present only for transactional producer roles.
    pub transactional_id: Option<String>,
}

// ==================== Resolver ====================

/// Layers enforced overrides, stored per-role parameters, and
/// caller-supplied parameters over the library defaults.
#[derive(Debug, Default)]
pub struct ConfigResolver {
    instance_id: String,
    enforced: HashMap<String, String>,
    roles: HashMap<String, HashMap<String, String>>,
}

impl ConfigResolver {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            enforced: HashMap::new(),
            roles: HashMap::new(),
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.instance_id.clone())
    }

    /// Pin a key so no role or caller value can override it.
    pub fn enforce(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.enforced.insert(key.into(), value.into());
        self
    }

    /// Store a parameter for one role, overriding caller values for it.
    pub fn with_role_parameter(
        mut self,
        role: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.roles
            .entry(role.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    fn lookup(&self, role: &str, caller: &HashMap<String, String>, key: &str) -> Option<String> {
        self.enforced
            .get(key)
            .or_else(|| self.roles.get(role).and_then(|params| params.get(key)))
            .or_else(|| caller.get(key))
            .cloned()
    }

    /// Resolve the consumer parameters for `role` consuming as `group`.
    pub fn resolve_consumer(
        &self,
        role: &str,
        group: &str,
        caller: &HashMap<String, String>,
    ) -> Result<ResolvedConsumerConfig> {
        let max_poll_records = match self.lookup(role, caller, MAX_POLL_RECORDS) {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                BusError::serialization(format!("invalid {} '{}'", MAX_POLL_RECORDS, raw))
            })?,
            None => DEFAULT_MAX_POLL_RECORDS,
        };
        let offset_reset_strategy = match self.lookup(role, caller, OFFSET_RESET_STRATEGY) {
            Some(raw) => raw.parse()?,
            None => OffsetStrategy::Earliest,
        };
        let poll_interval_ms = match self.lookup(role, caller, POLL_INTERVAL_MS) {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                BusError::serialization(format!("invalid {} '{}'", POLL_INTERVAL_MS, raw))
            })?,
            None => DEFAULT_POLL_INTERVAL_MS,
        };
        let client_id = self
            .lookup(role, caller, CLIENT_ID)
            .unwrap_or_else(|| format!("{}-consumer-{}", group, self.instance_id));

        Ok(ResolvedConsumerConfig {
            group: group.to_string(),
            client_id,
            max_poll_records,
            offset_reset_strategy,
            poll_interval_ms,
        })
    }

    /// Resolve the producer parameters for `role`.
    pub fn resolve_producer(
        &self,
        role: &str,
        caller: &HashMap<String, String>,
    ) -> Result<ResolvedProducerConfig> {
        let client_id = self
            .lookup(role, caller, CLIENT_ID)
            .unwrap_or_else(|| format!("{}-producer-{}", role, self.instance_id));
        let transactional_id = self.lookup(role, caller, TRANSACTIONAL_ID);
        Ok(ResolvedProducerConfig {
            client_id,
            transactional_id,
        })
    }
}
