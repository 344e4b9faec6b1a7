//! Order Pipeline Example
//!
//! A complete pass through the bus APIs on the durable backend:
//! an atomic producer writes typed orders, a durable subscription
//! aggregates them, a transactional producer publishes the aggregate
//! together with the input group's offset commit, and a compacted
//! subscription serves the latest aggregate as a lookup table.
//!
//! Run with:
//! ```bash
//! cargo run --package streambus-client --example order_pipeline
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use streambus_client::{
    AtomicProducer, BusConfig, CompactedProcessor, CompactedSubscription, ConfigResolver,
    ConsumerRecord, DurableProcessor, DurableSubscription, MessageBus, ProcessorError,
    TransactionalProducer, TRANSACTIONAL_ID,
};
use streambus_core::{OffsetStrategy, ProducerRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    order_id: u64,
    customer: String,
    amount_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Totals {
    orders: u64,
    amount_cents: u64,
}

/// Sums every order it sees.
struct OrderTotals {
    seen: AtomicUsize,
    amount_cents: AtomicU64,
}

#[async_trait]
impl DurableProcessor for OrderTotals {
    type Key = String;
    type Value = Order;

    async fn on_next(
        &self,
        batch: Vec<ConsumerRecord<String, Order>>,
    ) -> Result<(), ProcessorError> {
        for record in &batch {
            if let Some(order) = &record.value {
                self.seen.fetch_add(1, Ordering::SeqCst);
                self.amount_cents
                    .fetch_add(order.amount_cents, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Serves the latest published totals.
struct TotalsView;

#[async_trait]
impl CompactedProcessor for TotalsView {
    type Key = String;
    type Value = Totals;

    async fn on_snapshot(&self, snapshot: &HashMap<String, Totals>) {
        println!("   📷 Snapshot resolved with {} key(s)", snapshot.len());
    }

    async fn on_next(
        &self,
        record: ConsumerRecord<String, Totals>,
        _previous: Option<Totals>,
        _current: &HashMap<String, Totals>,
    ) {
        println!("   🔄 Live update for key '{}'", record.key);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🎯 StreamBus Order Pipeline Example");
    println!("====================================\n");

    // Step 1: Durable bus over a throwaway SQLite file
    println!("📊 Step 1: Starting the bus (DATABASE mode)");
    let temp_dir = tempfile::tempdir()?;
    let db_path = temp_dir.path().join("order_pipeline.db");
    let bus = Arc::new(
        MessageBus::new(
            BusConfig::database(db_path.to_str().unwrap())
                .with_instance_id("pipeline-demo")
                .with_topic("orders", 3)
                .with_topic("order-totals", 1),
        )
        .await?,
    );
    println!("   ✅ Topics 'orders' (3 partitions) and 'order-totals' (1 partition)\n");

    // Step 2: Resolve client configs
    println!("🔧 Step 2: Resolving client configuration");
    let resolver = ConfigResolver::new("pipeline-demo")
        .with_role_parameter("totals.writer", TRANSACTIONAL_ID, "totals-txn");
    let consumer_config = resolver.resolve_consumer("totals.reader", "totals", &HashMap::new())?;
    let writer_config = resolver.resolve_producer("totals.writer", &HashMap::new())?;
    let ingest_config = resolver.resolve_producer("orders.ingest", &HashMap::new())?;
    println!("   ✅ Consumer '{}'", consumer_config.client_id);
    println!("   ✅ Transactional writer '{}'\n", writer_config.client_id);

    // Step 3: Atomic producer writes orders
    println!("✍️  Step 3: Writing 9 orders (atomic producer)");
    let ingest = AtomicProducer::new(bus.clone(), ingest_config);
    for i in 0..9u64 {
        let customer = format!("customer-{}", i % 3);
        let order = Order {
            order_id: i,
            customer: customer.clone(),
            amount_cents: (i + 1) * 250,
        };
        let metadata = ingest
            .send_to_partition(
                ProducerRecord::typed("orders", &customer, Some(&order))?,
                (i % 3) as u32,
            )
            .await?;
        println!(
            "   Order {} → partition {}, offset {}",
            i, metadata.partition, metadata.offset
        );
    }
    println!();

    // Step 4: Durable subscription aggregates them
    println!("📥 Step 4: Aggregating through a durable subscription");
    let totals = Arc::new(OrderTotals {
        seen: AtomicUsize::new(0),
        amount_cents: AtomicU64::new(0),
    });
    let mut subscription =
        DurableSubscription::new(bus.clone(), "orders", consumer_config, totals.clone());
    subscription.start().await?;
    while totals.seen.load(Ordering::SeqCst) < 9 {
        sleep(Duration::from_millis(20)).await;
    }
    subscription.stop().await;
    println!(
        "   ✅ Aggregated {} orders, {} cents total\n",
        totals.seen.load(Ordering::SeqCst),
        totals.amount_cents.load(Ordering::SeqCst)
    );

    // Step 5: Publish the aggregate transactionally, folding in the
    // pipeline group's offset commit
    println!("💾 Step 5: Publishing totals + offsets in one transaction");
    let polled = bus
        .read("orders", "pipeline", None, 100, OffsetStrategy::Earliest)
        .await?;
    let writer = TransactionalProducer::new(bus.clone(), writer_config)?;
    let mut txn = writer.begin_transaction().await?;
    let summary = Totals {
        orders: polled.len() as u64,
        amount_cents: totals.amount_cents.load(Ordering::SeqCst),
    };
    txn.send_to_partition(
        ProducerRecord::typed("order-totals", &"summary".to_string(), Some(&summary))?,
        0,
    )
    .await?;
    txn.send_offsets("pipeline", &polled);
    txn.commit().await?;
    println!("   ✅ Committed transaction covering {} input records\n", polled.len());

    // Step 6: Serve the aggregate through a compacted view
    println!("🔍 Step 6: Reading it back through a compacted view");
    let mut view = CompactedSubscription::new(
        bus.clone(),
        "order-totals",
        resolver.resolve_consumer("totals.view", "totals-view", &HashMap::new())?,
        Arc::new(TotalsView),
    );
    view.start().await?;
    while !view.is_ready() {
        sleep(Duration::from_millis(20)).await;
    }
    if let Some(current) = view.get_value(&"summary".to_string()).await {
        println!(
            "   ✅ Latest totals: {} orders, {} cents",
            current.orders, current.amount_cents
        );
    }
    view.stop().await;

    ingest.close().await?;
    writer.close().await?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Pipeline Complete!");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("What we demonstrated:");
    println!("  • Durable (SQLite-backed) bus with mirrored delivery");
    println!("  • Typed records with explicit partition routing");
    println!("  • At-least-once aggregation via a durable subscription");
    println!("  • Transactional produce + offset commit as one unit");
    println!("  • Compacted key→latest-value view");
    println!();

    Ok(())
}
