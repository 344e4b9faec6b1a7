//! SQLite-Backed Durable Record Store
//!
//! Persists the bus's three logical tables — `topic_records`,
//! `transactions`, `consumer_offsets` — plus a `topics` registry, via sqlx.
//! Schema lives in embedded migrations and is applied on open.
//!
//! ## Transactional visibility
//!
//! Every record row carries a `transaction_id`; a record is visible to
//! readers only while its marker row in `transactions` says `committed`.
//! Writes outside an explicit transaction run under the reserved
//! always-committed marker, so they are visible the moment the insert
//! lands. A producer transaction's records are inserted, its staged offset
//! commits applied, and its marker flipped to committed inside one database
//! transaction — a reader can never observe part of it. Aborted
//! transactions never insert record rows at all; their marker simply stays
//! uncommitted.
//!
//! Reads additionally stop at the first still-pending offset in a
//! partition, so a reader can never skip past a record that is about to
//! become visible.
//!
//! ## Offset allocation
//!
//! The next offset for a partition is `MAX(offset) + 1` computed inside the
//! write's database transaction. SQLite serializes writers, which makes the
//! allocation linearizable per partition without a separate counter table.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use streambus_core::{
    BusError, OffsetCommit, OffsetStrategy, PartitionAssignmentListener, Partitioner,
    ProducerRecord, Record, Result, Topic, TopicConfig, ATOMIC_TRANSACTION_ID,
};

use crate::store::RecordStore;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.to_string().contains("UNIQUE constraint failed")
}

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    let key: Vec<u8> = row.try_get("key_bytes").map_err(BusError::persistence)?;
    let value: Option<Vec<u8>> = row.try_get("value_bytes").map_err(BusError::persistence)?;
    Ok(Record {
        topic: row.try_get("topic").map_err(BusError::persistence)?,
        partition: row
            .try_get::<i64, _>("partition")
            .map_err(BusError::persistence)? as u32,
        offset: row
            .try_get::<i64, _>("offset")
            .map_err(BusError::persistence)? as u64,
        timestamp: row.try_get("timestamp").map_err(BusError::persistence)?,
        key: key.into(),
        value: value.map(Into::into),
        transaction_id: row
            .try_get("transaction_id")
            .map_err(BusError::persistence)?,
    })
}

async fn partition_count_of<'e, E>(executor: E, topic: &str) -> Result<u32>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT partition_count FROM topics WHERE topic = ?")
        .bind(topic)
        .fetch_optional(executor)
        .await
        .map_err(BusError::persistence)?;
    match row {
        Some(row) => Ok(row
            .try_get::<i64, _>("partition_count")
            .map_err(BusError::persistence)? as u32),
        None => Err(BusError::UnknownTopic(topic.to_string())),
    }
}

async fn next_offset_of<'e, E>(executor: E, topic: &str, partition: u32) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        r#"SELECT COALESCE(MAX("offset") + 1, 0) AS next FROM topic_records
           WHERE topic = ? AND "partition" = ?"#,
    )
    .bind(topic)
    .bind(partition as i64)
    .fetch_one(executor)
    .await
    .map_err(BusError::persistence)?;
    let next: i64 = row.try_get("next").map_err(BusError::persistence)?;
    Ok(next as u64)
}

async fn upsert_offset<'e, E>(
    executor: E,
    topic: &str,
    group: &str,
    partition: u32,
    next_offset: u64,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"INSERT INTO consumer_offsets (topic, "partition", consumer_group, next_offset)
           VALUES (?, ?, ?, ?)
           ON CONFLICT (topic, "partition", consumer_group)
           DO UPDATE SET next_offset = excluded.next_offset
           WHERE excluded.next_offset > consumer_offsets.next_offset"#,
    )
    .bind(topic)
    .bind(partition as i64)
    .bind(group)
    .bind(next_offset as i64)
    .execute(executor)
    .await
    .map_err(BusError::persistence)?;
    Ok(())
}

/// Durable implementation of [`RecordStore`] on SQLite.
pub struct SqliteRecordStore {
    pool: SqlitePool,
    partitioner: Partitioner,
}

impl SqliteRecordStore {
    /// Open (or create) a store at `path`. `":memory:"` gives a private
    /// in-memory database.
    pub async fn new(path: &str) -> Result<Self> {
        Self::with_partitioner(path, Partitioner::new()).await
    }

    /// A store whose partitioner notifies `listener` on first assignment of
    /// each (topic, partition) pair.
    pub async fn with_listener(
        path: &str,
        listener: Arc<dyn PartitionAssignmentListener>,
    ) -> Result<Self> {
        Self::with_partitioner(path, Partitioner::with_listener(listener)).await
    }

    async fn with_partitioner(path: &str, partitioner: Partitioner) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(BusError::persistence)?
            .create_if_missing(true);
        // An in-memory database exists per connection; cap the pool at one
        // so every query sees the same data.
        let max_connections = if path.contains(":memory:") { 1 } else { 10 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(BusError::persistence)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(BusError::persistence)?;
        Ok(Self { pool, partitioner })
    }

    // ==================== Transaction markers ====================

    /// Create the marker row for a new transaction, uncommitted.
    pub async fn begin_marker(&self, transaction_id: &str) -> Result<()> {
        let result = sqlx::query("INSERT INTO transactions (transaction_id, committed) VALUES (?, 0)")
            .bind(transaction_id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => {
                debug!(transaction_id = %transaction_id, "opened transaction marker");
                Ok(())
            }
            Err(err) if is_unique_violation(&err) => Err(BusError::TransactionMisuse(format!(
                "transaction '{}' already exists",
                transaction_id
            ))),
            Err(err) => Err(BusError::persistence(err)),
        }
    }

    /// Whether the marker is committed; `None` if the marker is unknown.
    pub async fn transaction_committed(&self, transaction_id: &str) -> Result<Option<bool>> {
        let row = sqlx::query("SELECT committed FROM transactions WHERE transaction_id = ?")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(BusError::persistence)?;
        match row {
            Some(row) => {
                let committed: i64 = row.try_get("committed").map_err(BusError::persistence)?;
                Ok(Some(committed != 0))
            }
            None => Ok(None),
        }
    }

    // ==================== Writing ====================

    /// Write under the always-committed marker: durable and visible the
    /// moment the call returns.
    pub async fn write_atomic(&self, entries: Vec<ProducerRecord>) -> Result<Vec<Record>> {
        self.write_records(ATOMIC_TRANSACTION_ID, entries, Vec::new(), false)
            .await
    }

    /// Flush a producer transaction: insert its buffered records, apply its
    /// staged offset commits, and flip the marker to committed — all inside
    /// one database transaction.
    ///
    /// The marker must exist (created by [`begin_marker`]) and must not have
    /// been finalized before.
    ///
    /// [`begin_marker`]: SqliteRecordStore::begin_marker
    pub async fn commit_transaction(
        &self,
        transaction_id: &str,
        entries: Vec<ProducerRecord>,
        offsets: Vec<OffsetCommit>,
    ) -> Result<Vec<Record>> {
        self.write_records(transaction_id, entries, offsets, true).await
    }

    async fn write_records(
        &self,
        transaction_id: &str,
        entries: Vec<ProducerRecord>,
        offsets: Vec<OffsetCommit>,
        finalize_marker: bool,
    ) -> Result<Vec<Record>> {
        let mut tx = self.pool.begin().await.map_err(BusError::persistence)?;

        if finalize_marker {
            let row = sqlx::query("SELECT committed FROM transactions WHERE transaction_id = ?")
                .bind(transaction_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(BusError::persistence)?;
            match row {
                None => {
                    return Err(BusError::TransactionMisuse(format!(
                        "unknown transaction '{}'",
                        transaction_id
                    )))
                }
                Some(row) => {
                    let committed: i64 =
                        row.try_get("committed").map_err(BusError::persistence)?;
                    if committed != 0 {
                        return Err(BusError::TransactionMisuse(format!(
                            "transaction '{}' was already committed",
                            transaction_id
                        )));
                    }
                }
            }
        }

        let timestamp = now_ms();
        let mut partition_counts: HashMap<String, u32> = HashMap::new();
        let mut committed = Vec::with_capacity(entries.len());

        for entry in entries {
            let count = match partition_counts.get(&entry.topic) {
                Some(count) => *count,
                None => {
                    let count = partition_count_of(&mut *tx, &entry.topic).await?;
                    partition_counts.insert(entry.topic.clone(), count);
                    count
                }
            };
            let partition = match entry.partition {
                Some(partition) => {
                    if partition >= count {
                        return Err(BusError::OffsetNotFound {
                            topic: entry.topic,
                            partition,
                        });
                    }
                    partition
                }
                None => self.partitioner.assign(&entry.topic, &entry.key, count),
            };
            let offset = next_offset_of(&mut *tx, &entry.topic, partition).await?;

            sqlx::query(
                r#"INSERT INTO topic_records
                   (topic, "partition", "offset", timestamp, key_bytes, value_bytes, transaction_id)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&entry.topic)
            .bind(partition as i64)
            .bind(offset as i64)
            .bind(timestamp)
            .bind(entry.key.to_vec())
            .bind(entry.value.as_ref().map(|v| v.to_vec()))
            .bind(transaction_id)
            .execute(&mut *tx)
            .await
            .map_err(BusError::persistence)?;

            committed.push(Record {
                topic: entry.topic,
                partition,
                offset,
                timestamp,
                key: entry.key,
                value: entry.value,
                transaction_id: transaction_id.to_string(),
            });
        }

        for offset_commit in &offsets {
            upsert_offset(
                &mut *tx,
                &offset_commit.topic,
                &offset_commit.group,
                offset_commit.partition,
                offset_commit.next_offset,
            )
            .await?;
        }

        if finalize_marker {
            sqlx::query("UPDATE transactions SET committed = 1 WHERE transaction_id = ?")
                .bind(transaction_id)
                .execute(&mut *tx)
                .await
                .map_err(BusError::persistence)?;
        }

        tx.commit().await.map_err(BusError::persistence)?;
        debug!(
            transaction_id = %transaction_id,
            records = committed.len(),
            offset_commits = offsets.len(),
            "wrote records"
        );
        Ok(committed)
    }

    // ==================== Hydration ====================

    /// Every committed consumer offset in the store. Used to hydrate the
    /// delivery mirror after a restart.
    pub async fn all_committed_offsets(&self) -> Result<Vec<OffsetCommit>> {
        let rows = sqlx::query(
            r#"SELECT topic, "partition", consumer_group, next_offset FROM consumer_offsets"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(BusError::persistence)?;
        rows.iter()
            .map(|row| {
                Ok(OffsetCommit {
                    topic: row.try_get("topic").map_err(BusError::persistence)?,
                    partition: row
                        .try_get::<i64, _>("partition")
                        .map_err(BusError::persistence)? as u32,
                    group: row
                        .try_get("consumer_group")
                        .map_err(BusError::persistence)?,
                    next_offset: row
                        .try_get::<i64, _>("next_offset")
                        .map_err(BusError::persistence)? as u64,
                })
            })
            .collect()
    }

    // ==================== Read internals ====================

    /// The group's starting offset for a partition, creating the row from
    /// `strategy` when the group has none yet.
    async fn ensure_group_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        strategy: OffsetStrategy,
    ) -> Result<u64> {
        if let Some(offset) = self.committed_offset(topic, group, partition).await? {
            return Ok(offset);
        }
        let start = match strategy {
            OffsetStrategy::Earliest => 0,
            OffsetStrategy::Latest => self.high_watermark(topic, partition).await?,
        };
        sqlx::query(
            r#"INSERT OR IGNORE INTO consumer_offsets (topic, "partition", consumer_group, next_offset)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(group)
        .bind(start as i64)
        .execute(&self.pool)
        .await
        .map_err(BusError::persistence)?;
        // Another reader may have won the insert; theirs is authoritative.
        Ok(self
            .committed_offset(topic, group, partition)
            .await?
            .unwrap_or(start))
    }

    /// Committed records in [from, first-pending-offset), at most `limit`.
    async fn fetch_committed(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let pending_floor = sqlx::query(
            r#"SELECT MIN(r."offset") AS floor
               FROM topic_records r
               JOIN transactions t ON t.transaction_id = r.transaction_id
               WHERE r.topic = ? AND r."partition" = ? AND r."offset" >= ? AND t.committed = 0"#,
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(from_offset as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(BusError::persistence)?
        .try_get::<Option<i64>, _>("floor")
        .map_err(BusError::persistence)?;

        let rows = sqlx::query(
            r#"SELECT r.topic, r."partition", r."offset", r.timestamp,
                      r.key_bytes, r.value_bytes, r.transaction_id
               FROM topic_records r
               JOIN transactions t ON t.transaction_id = r.transaction_id
               WHERE r.topic = ? AND r."partition" = ? AND r."offset" >= ?
                 AND r."offset" < ? AND t.committed = 1
               ORDER BY r."offset"
               LIMIT ?"#,
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(from_offset as i64)
        .bind(pending_floor.unwrap_or(i64::MAX))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(BusError::persistence)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn check_partition(&self, topic: &str, partition: u32) -> Result<u32> {
        let count = partition_count_of(&self.pool, topic).await?;
        if partition >= count {
            return Err(BusError::OffsetNotFound {
                topic: topic.to_string(),
                partition,
            });
        }
        Ok(count)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create_topic(&self, config: TopicConfig) -> Result<()> {
        if config.partition_count == 0 {
            return Err(BusError::persistence(format!(
                "topic '{}' must have at least one partition",
                config.name
            )));
        }
        let result = sqlx::query("INSERT INTO topics (topic, partition_count, created_at) VALUES (?, ?, ?)")
            .bind(&config.name)
            .bind(config.partition_count as i64)
            .bind(now_ms())
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => {
                debug!(topic = %config.name, partitions = config.partition_count, "created topic");
                Ok(())
            }
            Err(err) if is_unique_violation(&err) => {
                let existing = partition_count_of(&self.pool, &config.name).await?;
                if existing == config.partition_count {
                    Ok(())
                } else {
                    Err(BusError::persistence(format!(
                        "topic '{}' already exists with {} partitions",
                        config.name, existing
                    )))
                }
            }
            Err(err) => Err(BusError::persistence(err)),
        }
    }

    async fn get_topic(&self, name: &str) -> Result<Option<Topic>> {
        let row = sqlx::query("SELECT topic, partition_count, created_at FROM topics WHERE topic = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(BusError::persistence)?;
        match row {
            Some(row) => Ok(Some(Topic {
                name: row.try_get("topic").map_err(BusError::persistence)?,
                partition_count: row
                    .try_get::<i64, _>("partition_count")
                    .map_err(BusError::persistence)? as u32,
                created_at: row.try_get("created_at").map_err(BusError::persistence)?,
            })),
            None => Ok(None),
        }
    }

    async fn list_topics(&self) -> Result<Vec<Topic>> {
        let rows =
            sqlx::query("SELECT topic, partition_count, created_at FROM topics ORDER BY topic")
                .fetch_all(&self.pool)
                .await
                .map_err(BusError::persistence)?;
        rows.iter()
            .map(|row| {
                Ok(Topic {
                    name: row.try_get("topic").map_err(BusError::persistence)?,
                    partition_count: row
                        .try_get::<i64, _>("partition_count")
                        .map_err(BusError::persistence)? as u32,
                    created_at: row.try_get("created_at").map_err(BusError::persistence)?,
                })
            })
            .collect()
    }

    async fn write(&self, entries: Vec<ProducerRecord>) -> Result<Vec<Record>> {
        self.write_atomic(entries).await
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        partition: Option<u32>,
        max_records: usize,
        strategy: OffsetStrategy,
    ) -> Result<Vec<Record>> {
        let count = partition_count_of(&self.pool, topic).await?;
        let partitions: Vec<u32> = match partition {
            Some(partition) => {
                if partition >= count {
                    return Err(BusError::OffsetNotFound {
                        topic: topic.to_string(),
                        partition,
                    });
                }
                vec![partition]
            }
            None => (0..count).collect(),
        };

        let mut batch = Vec::new();
        for partition in partitions {
            if batch.len() >= max_records {
                break;
            }
            let start = self
                .ensure_group_offset(topic, group, partition, strategy)
                .await?;
            let remaining = max_records - batch.len();
            batch.extend(self.fetch_committed(topic, partition, start, remaining).await?);
        }
        Ok(batch)
    }

    async fn read_from(
        &self,
        topic: &str,
        partition: u32,
        from_offset: u64,
        max_records: usize,
    ) -> Result<Vec<Record>> {
        self.check_partition(topic, partition).await?;
        self.fetch_committed(topic, partition, from_offset, max_records)
            .await
    }

    async fn replay_all(&self, topic: &str) -> Result<Vec<Record>> {
        // Existence check so an unknown topic is an error, not an empty scan.
        partition_count_of(&self.pool, topic).await?;
        let rows = sqlx::query(
            r#"SELECT r.topic, r."partition", r."offset", r.timestamp,
                      r.key_bytes, r.value_bytes, r.transaction_id
               FROM topic_records r
               JOIN transactions t ON t.transaction_id = r.transaction_id
               WHERE r.topic = ? AND t.committed = 1
               ORDER BY r."partition", r."offset""#,
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await
        .map_err(BusError::persistence)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn high_watermark(&self, topic: &str, partition: u32) -> Result<u64> {
        self.check_partition(topic, partition).await?;
        next_offset_of(&self.pool, topic, partition).await
    }

    async fn commit_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        offset: u64,
    ) -> Result<()> {
        self.check_partition(topic, partition).await?;
        upsert_offset(&self.pool, topic, group, partition, offset).await
    }

    async fn committed_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Option<u64>> {
        let row = sqlx::query(
            r#"SELECT next_offset FROM consumer_offsets
               WHERE topic = ? AND "partition" = ? AND consumer_group = ?"#,
        )
        .bind(topic)
        .bind(partition as i64)
        .bind(group)
        .fetch_optional(&self.pool)
        .await
        .map_err(BusError::persistence)?;
        match row {
            Some(row) => Ok(Some(
                row.try_get::<i64, _>("next_offset")
                    .map_err(BusError::persistence)? as u64,
            )),
            None => Ok(None),
        }
    }
}
