//! Load Balancing Integration Tests
//!
//! Multi-instance convergence tests over the in-memory hub and store:
//! - A solo processor acquires every partition and pumps them all
//! - Two processors settle at an even split; a dead peer's partitions are
//!   recovered after its leases expire
//! - Uneven partition counts settle within one partition of each other

use eventline_processor::{
    CheckpointStore, EventProcessor, InMemoryCheckpointStore, InMemoryHub,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const INTERVAL: Duration = Duration::from_millis(100);
const EXPIRATION: Duration = Duration::from_millis(300);

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn build_processor(
    identifier: &str,
    hub: Arc<InMemoryHub>,
    store: Arc<dyn CheckpointStore>,
) -> EventProcessor {
    EventProcessor::builder()
        .fully_qualified_namespace("memory")
        .event_hub_name("hub")
        .consumer_group("$default")
        .transport(hub)
        .checkpoint_store(store)
        .identifier(identifier)
        .load_balance_interval(INTERVAL)
        .ownership_expiration(EXPIRATION)
        .maximum_wait_time(Duration::from_millis(50))
        .build()
        .unwrap()
}

fn register_noop_handlers(processor: &EventProcessor) {
    processor
        .set_event_handler(|_, _| async { Ok(()) })
        .unwrap();
    processor.set_error_handler(|_, _, _| async {}).unwrap();
}

/// Active ownership counts per owner, as a peer would observe them.
async fn active_counts(store: &Arc<dyn CheckpointStore>) -> HashMap<String, usize> {
    let records = store
        .list_ownership("memory", "hub", "$default")
        .await
        .unwrap();
    let now = now_ms();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for record in records {
        if record.is_active(EXPIRATION, now) {
            *counts.entry(record.owner_id).or_default() += 1;
        }
    }
    counts
}

async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Sorted active ownership distribution.
async fn distribution(store: &Arc<dyn CheckpointStore>) -> Vec<usize> {
    let mut counts: Vec<usize> = active_counts(store).await.into_values().collect();
    counts.sort_unstable();
    counts
}

#[tokio::test]
async fn test_solo_processor_owns_every_partition_and_pumps_events() {
    let hub = Arc::new(InMemoryHub::new(4));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

    for partition in ["0", "1", "2", "3"] {
        hub.send(partition, format!("event-{partition}")).await.unwrap();
    }

    let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let processor = build_processor("solo", hub.clone(), store.clone());
    {
        let seen = seen.clone();
        processor
            .set_event_handler(move |context, _event| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().insert(context.partition_id().to_string());
                    Ok(())
                }
            })
            .unwrap();
    }
    processor.set_error_handler(|_, _, _| async {}).unwrap();

    processor.start().await.unwrap();

    let converged = wait_until(Duration::from_secs(15), || {
        let store = store.clone();
        async move { active_counts(&store).await.get("solo") == Some(&4) }
    })
    .await;
    assert!(converged, "solo processor should own all 4 partitions");

    let all_pumped = wait_until(Duration::from_secs(15), || {
        let seen = seen.clone();
        async move { seen.lock().unwrap().len() == 4 }
    })
    .await;
    assert!(all_pumped, "every partition's events should reach the handler");

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_processors_split_evenly_then_survivor_takes_over() {
    let hub = Arc::new(InMemoryHub::new(4));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

    let first = build_processor("proc-1", hub.clone(), store.clone());
    let second = build_processor("proc-2", hub.clone(), store.clone());
    register_noop_handlers(&first);
    register_noop_handlers(&second);

    first.start().await.unwrap();
    second.start().await.unwrap();

    let split = wait_until(Duration::from_secs(20), || {
        let store = store.clone();
        async move { distribution(&store).await == vec![2, 2] }
    })
    .await;
    assert!(split, "two healthy processors should settle at 2 + 2");

    // Kill one; its leases expire rather than being surrendered, and the
    // survivor picks the partitions up.
    second.stop().await.unwrap();

    let recovered = wait_until(Duration::from_secs(20), || {
        let store = store.clone();
        async move { active_counts(&store).await.get("proc-1") == Some(&4) }
    })
    .await;
    assert!(recovered, "survivor should own all 4 partitions");

    first.stop().await.unwrap();
}

#[tokio::test]
async fn test_three_processors_four_partitions() {
    let hub = Arc::new(InMemoryHub::new(4));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

    let processors: Vec<EventProcessor> = (1..=3)
        .map(|i| build_processor(&format!("proc-{i}"), hub.clone(), store.clone()))
        .collect();
    for processor in &processors {
        register_noop_handlers(processor);
        processor.start().await.unwrap();
    }

    let converged = wait_until(Duration::from_secs(30), || {
        let store = store.clone();
        async move { distribution(&store).await == vec![1, 1, 2] }
    })
    .await;
    assert!(converged, "expected a {{1, 1, 2}} split across three processors");

    for processor in &processors {
        processor.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_thirteen_partitions_three_processors() {
    let hub = Arc::new(InMemoryHub::new(13));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

    let processors: Vec<EventProcessor> = (1..=3)
        .map(|i| build_processor(&format!("proc-{i}"), hub.clone(), store.clone()))
        .collect();
    for processor in &processors {
        register_noop_handlers(processor);
        processor.start().await.unwrap();
    }

    // The 13th partition is only picked up by an owner already at the
    // floor, so this exercises the at-minimum eligibility rule.
    let converged = wait_until(Duration::from_secs(45), || {
        let store = store.clone();
        async move { distribution(&store).await == vec![4, 4, 5] }
    })
    .await;
    assert!(converged, "expected a {{4, 4, 5}} split across three processors");

    for processor in &processors {
        processor.stop().await.unwrap();
    }
}
