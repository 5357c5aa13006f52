//! Blob-backed checkpoint store.
//!
//! The reference [`CheckpointStore`] implementation over any
//! [`object_store::ObjectStore`]. Each ownership record and each checkpoint
//! maps to a distinct, empty-bodied object:
//!
//! ```text
//! <namespace>/<event hub>/<consumer group>/ownership/<partition>
//! <namespace>/<event hub>/<consumer group>/checkpoint/<partition>
//! ```
//!
//! Record fields travel as object metadata (`ownerid` on ownership objects,
//! `sequencenumber` and `offset` on checkpoints). The opaque version token
//! is the object's e-tag, which makes `claim_ownership` a conditional put:
//! `PutMode::Create` for first claims, `PutMode::Update` with the presented
//! e-tag otherwise. A lost race surfaces as an `AlreadyExists` or
//! `Precondition` error and the entry is dropped from the claim result.

use crate::error::Result;
use crate::types::{Checkpoint, PartitionOwnership};
use crate::CheckpointStore;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectStore, PutMode, PutOptions,
    PutPayload, UpdateVersion,
};
use std::sync::Arc;
use tracing::{debug, warn};

const OWNER_ID_KEY: &str = "ownerid";
const SEQUENCE_NUMBER_KEY: &str = "sequencenumber";
const OFFSET_KEY: &str = "offset";

/// A [`CheckpointStore`] persisting records as blob metadata.
pub struct BlobCheckpointStore {
    store: Arc<dyn ObjectStore>,
}

impl BlobCheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn ownership_path(ns: &str, hub: &str, group: &str, partition: &str) -> Path {
        Path::from(format!("{}/{}/{}/ownership/{}", ns, hub, group, partition))
    }

    fn checkpoint_path(ns: &str, hub: &str, group: &str, partition: &str) -> Path {
        Path::from(format!("{}/{}/{}/checkpoint/{}", ns, hub, group, partition))
    }

    /// Claim a single record; `None` means the compare-and-set lost.
    async fn claim_one(&self, mut record: PartitionOwnership) -> Result<Option<PartitionOwnership>> {
        let path = Self::ownership_path(
            &record.fully_qualified_namespace,
            &record.event_hub_name,
            &record.consumer_group,
            &record.partition_id,
        );

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::Metadata(OWNER_ID_KEY.into()),
            AttributeValue::from(record.owner_id.clone()),
        );

        let mut options = PutOptions::default();
        options.attributes = attributes;
        options.mode = match &record.version {
            Some(token) => PutMode::Update(UpdateVersion {
                e_tag: Some(token.clone()),
                version: None,
            }),
            None => PutMode::Create,
        };

        let put = self
            .store
            .put_opts(&path, PutPayload::from(Bytes::new()), options)
            .await;

        match put {
            Ok(result) => {
                // last_modified must come from the store, not the local clock
                match self.store.head(&path).await {
                    Ok(meta) => {
                        record.version = result.e_tag.or(meta.e_tag);
                        record.last_modified = meta.last_modified.timestamp_millis();
                        Ok(Some(record))
                    }
                    Err(e) => {
                        warn!(
                            partition_id = %record.partition_id,
                            error = %e,
                            "claimed ownership but could not read it back, dropping claim"
                        );
                        Ok(None)
                    }
                }
            }
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => {
                debug!(
                    partition_id = %record.partition_id,
                    owner_id = %record.owner_id,
                    "ownership claim lost"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn metadata_value(attributes: &Attributes, key: &str) -> Option<String> {
        attributes.iter().find_map(|(attribute, value)| match attribute {
            Attribute::Metadata(k) if k.as_ref() == key => Some(value.as_ref().to_string()),
            _ => None,
        })
    }
}

#[async_trait]
impl CheckpointStore for BlobCheckpointStore {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>> {
        let prefix = Path::from(format!(
            "{}/{}/{}/ownership",
            fully_qualified_namespace, event_hub_name, consumer_group
        ));
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;

        let mut records = Vec::with_capacity(objects.len());
        for object in objects {
            let partition_id = match object.location.filename() {
                Some(name) => name.to_string(),
                None => continue,
            };

            // Listing does not surface metadata, so fetch each record. A
            // record deleted between list and get is simply skipped.
            let result = match self.store.get_opts(&object.location, GetOptions::default()).await {
                Ok(result) => result,
                Err(object_store::Error::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };

            let owner_id =
                Self::metadata_value(&result.attributes, OWNER_ID_KEY).unwrap_or_default();
            records.push(PartitionOwnership {
                fully_qualified_namespace: fully_qualified_namespace.to_string(),
                event_hub_name: event_hub_name.to_string(),
                consumer_group: consumer_group.to_string(),
                partition_id,
                owner_id,
                last_modified: result.meta.last_modified.timestamp_millis(),
                version: result.meta.e_tag.clone(),
            });
        }

        records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(records)
    }

    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>> {
        let mut granted = Vec::with_capacity(requested.len());
        for record in requested {
            if let Some(claimed) = self.claim_one(record).await? {
                granted.push(claimed);
            }
        }
        Ok(granted)
    }

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>> {
        let prefix = Path::from(format!(
            "{}/{}/{}/checkpoint",
            fully_qualified_namespace, event_hub_name, consumer_group
        ));
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;

        let mut checkpoints = Vec::with_capacity(objects.len());
        for object in objects {
            let partition_id = match object.location.filename() {
                Some(name) => name.to_string(),
                None => continue,
            };

            let result = match self.store.get_opts(&object.location, GetOptions::default()).await {
                Ok(result) => result,
                Err(object_store::Error::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };

            let sequence_number = Self::metadata_value(&result.attributes, SEQUENCE_NUMBER_KEY)
                .and_then(|v| v.parse::<i64>().ok());
            let offset = Self::metadata_value(&result.attributes, OFFSET_KEY)
                .and_then(|v| v.parse::<i64>().ok());

            let (Some(sequence_number), Some(offset)) = (sequence_number, offset) else {
                warn!(
                    partition_id = %partition_id,
                    location = %object.location,
                    "checkpoint record is missing position metadata, skipping"
                );
                continue;
            };

            checkpoints.push(Checkpoint {
                fully_qualified_namespace: fully_qualified_namespace.to_string(),
                event_hub_name: event_hub_name.to_string(),
                consumer_group: consumer_group.to_string(),
                partition_id,
                offset,
                sequence_number,
            });
        }

        checkpoints.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(checkpoints)
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        let path = Self::checkpoint_path(
            &checkpoint.fully_qualified_namespace,
            &checkpoint.event_hub_name,
            &checkpoint.consumer_group,
            &checkpoint.partition_id,
        );

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::Metadata(SEQUENCE_NUMBER_KEY.into()),
            AttributeValue::from(checkpoint.sequence_number.to_string()),
        );
        attributes.insert(
            Attribute::Metadata(OFFSET_KEY.into()),
            AttributeValue::from(checkpoint.offset.to_string()),
        );

        let mut options = PutOptions::default();
        options.attributes = attributes;

        self.store
            .put_opts(&path, PutPayload::from(Bytes::new()), options)
            .await?;

        debug!(
            partition_id = %checkpoint.partition_id,
            offset = checkpoint.offset,
            sequence_number = checkpoint.sequence_number,
            "checkpoint updated"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn blob_store() -> BlobCheckpointStore {
        BlobCheckpointStore::new(Arc::new(InMemory::new()))
    }

    fn claim_request(partition: &str, owner: &str) -> PartitionOwnership {
        PartitionOwnership::first_claim("ns", "hub", "$default", partition, owner)
    }

    #[tokio::test]
    async fn test_first_claim_round_trip() {
        let store = blob_store();
        let granted = store
            .claim_ownership(vec![claim_request("0", "proc-a")])
            .await
            .unwrap();
        assert_eq!(granted.len(), 1);
        assert!(granted[0].version.is_some());
        assert!(granted[0].last_modified > 0);

        let listed = store.list_ownership("ns", "hub", "$default").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].partition_id, "0");
        assert_eq!(listed[0].owner_id, "proc-a");
        assert_eq!(listed[0].version, granted[0].version);
    }

    #[tokio::test]
    async fn test_second_first_claim_loses() {
        let store = blob_store();
        let a = store
            .claim_ownership(vec![claim_request("0", "proc-a")])
            .await
            .unwrap();
        assert_eq!(a.len(), 1);

        let b = store
            .claim_ownership(vec![claim_request("0", "proc-b")])
            .await
            .unwrap();
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn test_renew_and_steal_with_tokens() {
        let store = blob_store();
        let granted = store
            .claim_ownership(vec![claim_request("0", "proc-a")])
            .await
            .unwrap();

        // Renewal with the current token succeeds and moves the token.
        let renewed = store.claim_ownership(granted.clone()).await.unwrap();
        assert_eq!(renewed.len(), 1);
        assert_ne!(renewed[0].version, granted[0].version);

        // The original token is now stale.
        let stale = store.claim_ownership(granted).await.unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn test_list_ownership_scoped_by_group() {
        let store = blob_store();
        store
            .claim_ownership(vec![
                claim_request("0", "proc-a"),
                PartitionOwnership::first_claim("ns", "hub", "other", "0", "proc-b"),
            ])
            .await
            .unwrap();

        let records = store.list_ownership("ns", "hub", "$default").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owner_id, "proc-a");
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let store = blob_store();
        store
            .update_checkpoint(Checkpoint {
                fully_qualified_namespace: "ns".into(),
                event_hub_name: "hub".into(),
                consumer_group: "$default".into(),
                partition_id: "2".into(),
                offset: 4096,
                sequence_number: 17,
            })
            .await
            .unwrap();

        let checkpoints = store.list_checkpoints("ns", "hub", "$default").await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].partition_id, "2");
        assert_eq!(checkpoints[0].offset, 4096);
        assert_eq!(checkpoints[0].sequence_number, 17);
    }

    #[tokio::test]
    async fn test_checkpoint_overwrite_is_unconditional() {
        let store = blob_store();
        for (offset, sequence) in [(100, 10), (50, 5)] {
            store
                .update_checkpoint(Checkpoint {
                    fully_qualified_namespace: "ns".into(),
                    event_hub_name: "hub".into(),
                    consumer_group: "$default".into(),
                    partition_id: "0".into(),
                    offset,
                    sequence_number: sequence,
                })
                .await
                .unwrap();
        }

        let checkpoints = store.list_checkpoints("ns", "hub", "$default").await.unwrap();
        assert_eq!(checkpoints[0].offset, 50);
        assert_eq!(checkpoints[0].sequence_number, 5);
    }

    #[tokio::test]
    async fn test_ownership_and_checkpoints_do_not_collide() {
        let store = blob_store();
        store
            .claim_ownership(vec![claim_request("0", "proc-a")])
            .await
            .unwrap();
        store
            .update_checkpoint(Checkpoint {
                fully_qualified_namespace: "ns".into(),
                event_hub_name: "hub".into(),
                consumer_group: "$default".into(),
                partition_id: "0".into(),
                offset: 1,
                sequence_number: 1,
            })
            .await
            .unwrap();

        assert_eq!(store.list_ownership("ns", "hub", "$default").await.unwrap().len(), 1);
        assert_eq!(store.list_checkpoints("ns", "hub", "$default").await.unwrap().len(), 1);
    }
}
