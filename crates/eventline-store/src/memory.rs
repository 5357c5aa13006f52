//! In-process checkpoint store.
//!
//! Same compare-and-set semantics as the blob-backed store, with a numeric
//! revision counter standing in for the blob e-tag. Useful for tests and
//! single-process deployments where durability is not required.

use crate::error::Result;
use crate::types::{Checkpoint, PartitionOwnership};
use crate::{now_ms, CheckpointStore};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

type RecordKey = (String, String, String, String);

#[derive(Debug)]
struct OwnershipSlot {
    owner_id: String,
    last_modified: i64,
    revision: u64,
}

#[derive(Debug, Default)]
struct State {
    ownership: HashMap<RecordKey, OwnershipSlot>,
    checkpoints: HashMap<RecordKey, Checkpoint>,
    next_revision: u64,
}

/// An in-memory [`CheckpointStore`].
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    state: Mutex<State>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key_of(o: &PartitionOwnership) -> RecordKey {
    (
        o.fully_qualified_namespace.clone(),
        o.event_hub_name.clone(),
        o.consumer_group.clone(),
        o.partition_id.clone(),
    )
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>> {
        let state = self.state.lock().await;
        let mut records: Vec<PartitionOwnership> = state
            .ownership
            .iter()
            .filter(|((ns, hub, group, _), _)| {
                ns == fully_qualified_namespace
                    && hub == event_hub_name
                    && group == consumer_group
            })
            .map(|((ns, hub, group, partition), slot)| PartitionOwnership {
                fully_qualified_namespace: ns.clone(),
                event_hub_name: hub.clone(),
                consumer_group: group.clone(),
                partition_id: partition.clone(),
                owner_id: slot.owner_id.clone(),
                last_modified: slot.last_modified,
                version: Some(slot.revision.to_string()),
            })
            .collect();
        records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(records)
    }

    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>> {
        let mut state = self.state.lock().await;
        let mut granted = Vec::new();

        for mut record in requested {
            let key = key_of(&record);
            let matches = match (state.ownership.get(&key), &record.version) {
                // First claim only succeeds when no record exists.
                (None, None) => true,
                (None, Some(_)) => false,
                (Some(_), None) => false,
                (Some(slot), Some(token)) => slot.revision.to_string() == *token,
            };

            if !matches {
                debug!(
                    partition_id = %record.partition_id,
                    owner_id = %record.owner_id,
                    "ownership claim lost"
                );
                continue;
            }

            state.next_revision += 1;
            let revision = state.next_revision;
            let last_modified = now_ms();
            state.ownership.insert(
                key,
                OwnershipSlot {
                    owner_id: record.owner_id.clone(),
                    last_modified,
                    revision,
                },
            );

            record.version = Some(revision.to_string());
            record.last_modified = last_modified;
            granted.push(record);
        }

        Ok(granted)
    }

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>> {
        let state = self.state.lock().await;
        let mut checkpoints: Vec<Checkpoint> = state
            .checkpoints
            .iter()
            .filter(|((ns, hub, group, _), _)| {
                ns == fully_qualified_namespace
                    && hub == event_hub_name
                    && group == consumer_group
            })
            .map(|(_, checkpoint)| checkpoint.clone())
            .collect();
        checkpoints.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(checkpoints)
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        let key = (
            checkpoint.fully_qualified_namespace.clone(),
            checkpoint.event_hub_name.clone(),
            checkpoint.consumer_group.clone(),
            checkpoint.partition_id.clone(),
        );
        let mut state = self.state.lock().await;
        state.checkpoints.insert(key, checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_request(partition: &str, owner: &str) -> PartitionOwnership {
        PartitionOwnership::first_claim("ns", "hub", "$default", partition, owner)
    }

    fn checkpoint(partition: &str, offset: i64, sequence: i64) -> Checkpoint {
        Checkpoint {
            fully_qualified_namespace: "ns".into(),
            event_hub_name: "hub".into(),
            consumer_group: "$default".into(),
            partition_id: partition.into(),
            offset,
            sequence_number: sequence,
        }
    }

    #[tokio::test]
    async fn test_first_claim_succeeds() {
        let store = InMemoryCheckpointStore::new();
        let granted = store
            .claim_ownership(vec![claim_request("0", "proc-a")])
            .await
            .unwrap();

        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].owner_id, "proc-a");
        assert!(granted[0].version.is_some());
        assert!(granted[0].last_modified > 0);
    }

    #[tokio::test]
    async fn test_competing_first_claims_one_winner() {
        let store = InMemoryCheckpointStore::new();
        let a = store
            .claim_ownership(vec![claim_request("0", "proc-a")])
            .await
            .unwrap();
        let b = store
            .claim_ownership(vec![claim_request("0", "proc-b")])
            .await
            .unwrap();

        assert_eq!(a.len(), 1);
        assert!(b.is_empty(), "second first-claim must lose");
    }

    #[tokio::test]
    async fn test_renew_with_current_token() {
        let store = InMemoryCheckpointStore::new();
        let granted = store
            .claim_ownership(vec![claim_request("0", "proc-a")])
            .await
            .unwrap();

        let renewed = store.claim_ownership(granted.clone()).await.unwrap();
        assert_eq!(renewed.len(), 1);
        assert_ne!(renewed[0].version, granted[0].version);
        assert!(renewed[0].last_modified >= granted[0].last_modified);
    }

    #[tokio::test]
    async fn test_stale_token_is_rejected() {
        let store = InMemoryCheckpointStore::new();
        let granted = store
            .claim_ownership(vec![claim_request("0", "proc-a")])
            .await
            .unwrap();

        // proc-b steals with the current token
        let mut steal = granted[0].clone();
        steal.owner_id = "proc-b".into();
        let stolen = store.claim_ownership(vec![steal]).await.unwrap();
        assert_eq!(stolen.len(), 1);

        // proc-a's renewal with its old token must now fail
        let renewed = store.claim_ownership(granted).await.unwrap();
        assert!(renewed.is_empty());
    }

    #[tokio::test]
    async fn test_partial_success() {
        let store = InMemoryCheckpointStore::new();
        store
            .claim_ownership(vec![claim_request("0", "proc-a")])
            .await
            .unwrap();

        // "0" is taken, "1" is free
        let granted = store
            .claim_ownership(vec![claim_request("0", "proc-b"), claim_request("1", "proc-b")])
            .await
            .unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].partition_id, "1");
    }

    #[tokio::test]
    async fn test_list_ownership_scoped() {
        let store = InMemoryCheckpointStore::new();
        store
            .claim_ownership(vec![
                claim_request("0", "proc-a"),
                PartitionOwnership::first_claim("ns", "hub", "other-group", "0", "proc-a"),
            ])
            .await
            .unwrap();

        let records = store.list_ownership("ns", "hub", "$default").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].consumer_group, "$default");
    }

    #[tokio::test]
    async fn test_checkpoint_last_writer_wins() {
        let store = InMemoryCheckpointStore::new();
        store.update_checkpoint(checkpoint("0", 100, 10)).await.unwrap();
        store.update_checkpoint(checkpoint("0", 50, 5)).await.unwrap();

        let checkpoints = store.list_checkpoints("ns", "hub", "$default").await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].offset, 50);
        assert_eq!(checkpoints[0].sequence_number, 5);
    }

    #[tokio::test]
    async fn test_list_checkpoints_empty_scope() {
        let store = InMemoryCheckpointStore::new();
        let checkpoints = store.list_checkpoints("ns", "hub", "$default").await.unwrap();
        assert!(checkpoints.is_empty());
    }
}
