//! End-to-end demo against the in-process hub.
//!
//! Two processor instances share a consumer group over an 8-partition hub:
//! watch them split the partitions, pump events, and checkpoint progress.
//!
//! Run with: `cargo run --example in_memory_demo`

use eventline_processor::{CheckpointStore, EventProcessor, InMemoryCheckpointStore, InMemoryHub};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let hub = Arc::new(InMemoryHub::new(8));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

    let mut processors = Vec::new();
    for name in ["worker-a", "worker-b"] {
        let processor = EventProcessor::builder()
            .fully_qualified_namespace("memory")
            .event_hub_name("telemetry")
            .consumer_group("$default")
            .transport(hub.clone())
            .checkpoint_store(store.clone())
            .identifier(name)
            .load_balance_interval(Duration::from_millis(500))
            .ownership_expiration(Duration::from_millis(1500))
            .maximum_wait_time(Duration::from_millis(200))
            .build()?;

        processor.set_event_handler(|context, event| async move {
            println!(
                "[{}] partition {} seq {:?}: {}",
                context.consumer_group(),
                context.partition_id(),
                event.sequence_number,
                String::from_utf8_lossy(&event.body),
            );
            context.update_checkpoint(&event).await?;
            Ok(())
        })?;
        processor.set_error_handler(|context, operation, error| async move {
            eprintln!(
                "error in {} (partition {:?}): {}",
                operation,
                context.map(|c| c.partition_id().to_string()),
                error,
            );
        })?;
        processor.set_partition_closing_handler(|context, reason| async move {
            println!("partition {} closed: {}", context.partition_id(), reason);
        })?;

        processor.start().await?;
        processors.push(processor);
    }

    for round in 0..5 {
        for partition in 0..8 {
            hub.send(&partition.to_string(), format!("round {round}"))
                .await?;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
    }

    // Give the balancers time to settle, then report the split.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let ownership = store.list_ownership("memory", "telemetry", "$default").await?;
    for record in &ownership {
        println!("partition {} owned by {}", record.partition_id, record.owner_id);
    }

    for processor in &processors {
        processor.stop().await?;
    }
    Ok(())
}
