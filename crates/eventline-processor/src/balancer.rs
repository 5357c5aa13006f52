//! Load-balancer loop.
//!
//! One task per processor instance. Each cycle it renews the leases this
//! instance holds, reaps pumps for partitions it lost, restarts pumps that
//! crashed, observes the full cross-processor ownership view, and claims at
//! most one partition to converge toward an even distribution:
//!
//! ```text
//! renew → reap → heal → observe → enumerate → claim one → pace
//! ```
//!
//! Claiming a single partition per cycle bounds thrash and gives peers a
//! full cycle to react; tie-breaking among candidates is uniformly random
//! per instance so simultaneously started peers do not pile onto the same
//! victim. Coordination is purely optimistic: every mutation goes through
//! the store's compare-and-set, and a lost renewal simply drops the
//! partition from this instance's view.

use crate::context::{CloseReason, PartitionContext};
use crate::error::ErrorOperation;
use crate::handlers::ActiveHandlers;
use crate::now_ms;
use crate::processor::ProcessorOptions;
use crate::pump::{PartitionPump, PumpHandle};
use crate::transport::{EventHubTransport, TransportError};
use eventline_core::retry_with_backoff;
use eventline_store::{CheckpointStore, PartitionOwnership, StoreError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pumps currently running for this instance, keyed by partition id.
/// Mutated only by the load balancer; drained by the processor on stop.
pub(crate) type ActivePumps = Arc<RwLock<HashMap<String, PumpHandle>>>;

pub(crate) struct LoadBalancer {
    namespace: String,
    event_hub: String,
    consumer_group: String,
    identifier: String,
    store: Arc<dyn CheckpointStore>,
    transport: Arc<dyn EventHubTransport>,
    handlers: Arc<ActiveHandlers>,
    options: ProcessorOptions,

    /// Ownership records held by this instance. Touched only by this task.
    instance_ownership: HashMap<String, PartitionOwnership>,
    pumps: ActivePumps,
    rng: StdRng,
    shutdown: watch::Receiver<bool>,
}

impl LoadBalancer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        namespace: String,
        event_hub: String,
        consumer_group: String,
        identifier: String,
        store: Arc<dyn CheckpointStore>,
        transport: Arc<dyn EventHubTransport>,
        handlers: Arc<ActiveHandlers>,
        options: ProcessorOptions,
        pumps: ActivePumps,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            namespace,
            event_hub,
            consumer_group,
            identifier,
            store,
            transport,
            handlers,
            options,
            instance_ownership: HashMap::new(),
            pumps,
            // Seeded from entropy so simultaneously started peers diverge.
            rng: StdRng::from_entropy(),
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            identifier = %self.identifier,
            event_hub = %self.event_hub,
            consumer_group = %self.consumer_group,
            interval_ms = self.options.load_balance_interval.as_millis() as u64,
            "load balancer started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let cycle_start = Instant::now();
            self.run_cycle().await;

            let pause = self
                .options
                .load_balance_interval
                .saturating_sub(cycle_start.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        info!(identifier = %self.identifier, "load balancer stopped");
    }

    async fn run_cycle(&mut self) {
        self.renew_ownership().await;
        self.reap_lost_partitions().await;
        self.restart_stalled_pumps().await;

        let all = match self.list_ownership_with_retry().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "ownership listing failed, skipping claim phase");
                self.handlers
                    .notify_error(None, ErrorOperation::ListOwnership, e.into());
                return;
            }
        };

        let now = now_ms();
        let active: Vec<PartitionOwnership> = all
            .iter()
            .filter(|o| o.is_active(self.options.ownership_expiration, now))
            .cloned()
            .collect();

        let partitions = match self.partition_ids_with_retry().await {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!(error = %e, "partition enumeration failed, skipping claim phase");
                self.handlers
                    .notify_error(None, ErrorOperation::GetPartitionIds, e.into());
                return;
            }
        };

        self.claim_one_partition(&all, &active, &partitions).await;
    }

    /// Phase A: re-submit every held record through the store's
    /// compare-and-set. Records that lose the race leave the instance view.
    async fn renew_ownership(&mut self) {
        if self.instance_ownership.is_empty() {
            return;
        }

        let requests: Vec<PartitionOwnership> =
            self.instance_ownership.values().cloned().collect();
        match self.claim_with_retry(requests).await {
            Ok(renewed) => {
                let renewed: HashMap<String, PartitionOwnership> = renewed
                    .into_iter()
                    .map(|o| (o.partition_id.clone(), o))
                    .collect();
                for lost in self
                    .instance_ownership
                    .keys()
                    .filter(|p| !renewed.contains_key(*p))
                {
                    info!(
                        identifier = %self.identifier,
                        partition_id = %lost,
                        "ownership renewal lost to another processor"
                    );
                }
                self.instance_ownership = renewed;
            }
            Err(e) => {
                // Proceed with the stale view; the next cycle retries.
                warn!(error = %e, "ownership renewal failed, keeping previous view");
                self.handlers
                    .notify_error(None, ErrorOperation::RenewOwnership, e.into());
            }
        }
    }

    /// Phase B: stop pumps for partitions this instance no longer owns.
    async fn reap_lost_partitions(&mut self) {
        let lost: Vec<String> = self
            .pumps
            .read()
            .await
            .keys()
            .filter(|p| !self.instance_ownership.contains_key(*p))
            .cloned()
            .collect();

        for partition_id in lost {
            let handle = self.pumps.write().await.remove(&partition_id);
            if let Some(handle) = handle {
                warn!(
                    identifier = %self.identifier,
                    partition_id = %partition_id,
                    "stopping pump for lost partition"
                );
                handle.stop(CloseReason::OwnershipLost).await;
            }
        }
    }

    /// Phase C: every owned partition must have a live pump.
    async fn restart_stalled_pumps(&mut self) {
        let owned: Vec<String> = self.instance_ownership.keys().cloned().collect();
        for partition_id in owned {
            let needs_start = match self.pumps.read().await.get(&partition_id) {
                None => true,
                Some(handle) => handle.is_finished(),
            };
            if needs_start {
                debug!(
                    identifier = %self.identifier,
                    partition_id = %partition_id,
                    "starting pump for owned partition"
                );
                self.replace_pump(&partition_id).await;
            }
        }
    }

    /// Phase F: claim at most one partition per cycle.
    async fn claim_one_partition(
        &mut self,
        all: &[PartitionOwnership],
        active: &[PartitionOwnership],
        partitions: &[String],
    ) {
        let instance_partitions: HashSet<String> =
            self.instance_ownership.keys().cloned().collect();
        let Some(candidate) = select_claim(
            &self.identifier,
            &instance_partitions,
            active,
            partitions,
            &mut self.rng,
        ) else {
            return;
        };

        let request = build_claim_request(
            &self.identifier,
            &self.namespace,
            &self.event_hub,
            &self.consumer_group,
            candidate,
            all,
        );
        let partition_id = request.partition_id.clone();
        debug!(
            identifier = %self.identifier,
            partition_id = %partition_id,
            "attempting to claim partition"
        );

        match self.claim_with_retry(vec![request]).await {
            Ok(mut granted) => match granted.pop() {
                Some(owned) => {
                    info!(
                        identifier = %self.identifier,
                        partition_id = %owned.partition_id,
                        "partition claimed"
                    );
                    self.instance_ownership
                        .insert(owned.partition_id.clone(), owned);
                    self.replace_pump(&partition_id).await;
                }
                None => {
                    debug!(
                        identifier = %self.identifier,
                        partition_id = %partition_id,
                        "claim lost to another processor"
                    );
                }
            },
            Err(e) => {
                self.handlers
                    .notify_error(None, ErrorOperation::ClaimOwnership, e.into());
            }
        }
    }

    /// Stop any stale pump for the partition and start a fresh one.
    async fn replace_pump(&self, partition_id: &str) {
        let stale = self.pumps.write().await.remove(partition_id);
        if let Some(stale) = stale {
            stale.stop(CloseReason::Shutdown).await;
        }

        let context = PartitionContext::new(
            self.namespace.clone(),
            self.event_hub.clone(),
            self.consumer_group.clone(),
            partition_id.to_string(),
            Arc::clone(&self.store),
        );
        let handle = PartitionPump::spawn(
            context,
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            Arc::clone(&self.handlers),
            self.options.clone(),
        );
        self.pumps
            .write()
            .await
            .insert(partition_id.to_string(), handle);
    }

    async fn list_ownership_with_retry(&self) -> Result<Vec<PartitionOwnership>, StoreError> {
        let store = Arc::clone(&self.store);
        let namespace = self.namespace.clone();
        let event_hub = self.event_hub.clone();
        let consumer_group = self.consumer_group.clone();
        let try_timeout = self.options.retry.try_timeout;

        retry_with_backoff(&self.options.retry, StoreError::is_transient, || {
            let store = Arc::clone(&store);
            let namespace = namespace.clone();
            let event_hub = event_hub.clone();
            let consumer_group = consumer_group.clone();
            async move {
                match tokio::time::timeout(
                    try_timeout,
                    store.list_ownership(&namespace, &event_hub, &consumer_group),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout),
                }
            }
        })
        .await
    }

    async fn claim_with_retry(
        &self,
        requests: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>, StoreError> {
        let store = Arc::clone(&self.store);
        let try_timeout = self.options.retry.try_timeout;

        retry_with_backoff(&self.options.retry, StoreError::is_transient, || {
            let store = Arc::clone(&store);
            let requests = requests.clone();
            async move {
                match tokio::time::timeout(try_timeout, store.claim_ownership(requests)).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout),
                }
            }
        })
        .await
    }

    async fn partition_ids_with_retry(&self) -> Result<Vec<String>, TransportError> {
        let transport = Arc::clone(&self.transport);
        let try_timeout = self.options.retry.try_timeout;

        retry_with_backoff(&self.options.retry, TransportError::is_retryable, || {
            let transport = Arc::clone(&transport);
            async move {
                match tokio::time::timeout(try_timeout, transport.partition_ids()).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                }
            }
        })
        .await
    }
}

/// A partition the balancer decided to go after this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClaimCandidate {
    /// No active owner; claim fresh.
    Unclaimed(String),
    /// Take the partition from its current owner, presenting that owner's
    /// version token.
    Steal(PartitionOwnership),
}

/// Decide whether (and what) to claim, given the active ownership view.
///
/// Target distribution: with `P` partitions and `O` distinct active owners
/// (including this instance), every owner should hold `floor(P/O)` or
/// `floor(P/O) + 1` partitions. This instance claims only when it is below
/// the floor, or exactly at the floor while no other owner is below it.
/// Candidates are preferred in order: unclaimed partitions, partitions of
/// owners above the ceiling, then partitions of owners at the ceiling when
/// this instance has not reached the floor.
fn select_claim(
    identifier: &str,
    instance_partitions: &HashSet<String>,
    active: &[PartitionOwnership],
    partitions: &[String],
    rng: &mut StdRng,
) -> Option<ClaimCandidate> {
    if partitions.is_empty() {
        return None;
    }

    let mut owner_counts: HashMap<&str, usize> = HashMap::new();
    for record in active {
        *owner_counts.entry(record.owner_id.as_str()).or_default() += 1;
    }

    let mut owners: HashSet<&str> = owner_counts.keys().copied().collect();
    owners.insert(identifier);

    let min_per_owner = partitions.len() / owners.len();
    let max_per_owner = min_per_owner + 1;

    let mine = instance_partitions
        .iter()
        .filter(|p| {
            active
                .iter()
                .any(|o| &o.partition_id == *p && o.owner_id == identifier)
        })
        .count();

    let another_owner_below_minimum = owners.iter().any(|owner| {
        *owner != identifier && owner_counts.get(owner).copied().unwrap_or(0) < min_per_owner
    });
    let eligible =
        mine < min_per_owner || (mine == min_per_owner && !another_owner_below_minimum);
    if !eligible {
        return None;
    }

    let actively_owned: HashSet<&str> = active.iter().map(|o| o.partition_id.as_str()).collect();
    let unclaimed: Vec<&String> = partitions
        .iter()
        .filter(|p| !actively_owned.contains(p.as_str()))
        .collect();
    if let Some(partition) = unclaimed.choose(rng) {
        return Some(ClaimCandidate::Unclaimed((*partition).clone()));
    }

    let over_quota: Vec<&PartitionOwnership> = active
        .iter()
        .filter(|o| {
            o.owner_id != identifier
                && owner_counts.get(o.owner_id.as_str()).copied().unwrap_or(0) > max_per_owner
        })
        .collect();
    if let Some(victim) = over_quota.choose(rng) {
        return Some(ClaimCandidate::Steal((*victim).clone()));
    }

    if mine < min_per_owner {
        let at_maximum: Vec<&PartitionOwnership> = active
            .iter()
            .filter(|o| {
                o.owner_id != identifier
                    && owner_counts.get(o.owner_id.as_str()).copied().unwrap_or(0)
                        == max_per_owner
            })
            .collect();
        if let Some(victim) = at_maximum.choose(rng) {
            return Some(ClaimCandidate::Steal((*victim).clone()));
        }
    }

    None
}

/// Turn a candidate into the store claim request, attaching the version
/// token from the most recent (possibly expired) record when one exists.
fn build_claim_request(
    identifier: &str,
    namespace: &str,
    event_hub: &str,
    consumer_group: &str,
    candidate: ClaimCandidate,
    all: &[PartitionOwnership],
) -> PartitionOwnership {
    match candidate {
        ClaimCandidate::Unclaimed(partition_id) => {
            let mut request = PartitionOwnership::first_claim(
                namespace,
                event_hub,
                consumer_group,
                partition_id.clone(),
                identifier,
            );
            if let Some(existing) = all.iter().find(|o| o.partition_id == partition_id) {
                request.version = existing.version.clone();
            }
            request
        }
        ClaimCandidate::Steal(record) => PartitionOwnership {
            owner_id: identifier.to_string(),
            ..record
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(partition: &str, owner: &str) -> PartitionOwnership {
        PartitionOwnership {
            fully_qualified_namespace: "ns".into(),
            event_hub_name: "hub".into(),
            consumer_group: "$default".into(),
            partition_id: partition.into(),
            owner_id: owner.into(),
            last_modified: 0,
            version: Some(format!("v-{}", partition)),
        }
    }

    fn partitions(n: usize) -> Vec<String> {
        (0..n).map(|p| p.to_string()).collect()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_solo_processor_prefers_unclaimed() {
        let candidate = select_claim("me", &HashSet::new(), &[], &partitions(4), &mut rng());
        match candidate {
            Some(ClaimCandidate::Unclaimed(p)) => {
                assert!(partitions(4).contains(&p));
            }
            other => panic!("expected unclaimed candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_no_partitions_means_no_claim() {
        let candidate = select_claim("me", &HashSet::new(), &[], &[], &mut rng());
        assert!(candidate.is_none());
    }

    #[test]
    fn test_balanced_state_claims_nothing() {
        // 4 partitions, 2 owners, 2 + 2: steady state.
        let active = vec![
            record("0", "me"),
            record("1", "me"),
            record("2", "peer"),
            record("3", "peer"),
        ];
        let mine: HashSet<String> = ["0".to_string(), "1".to_string()].into();
        let candidate = select_claim("me", &mine, &active, &partitions(4), &mut rng());
        assert!(candidate.is_none());
    }

    #[test]
    fn test_not_eligible_when_peer_below_minimum() {
        // 13 partitions, 3 owners, min = 4. I hold 4, peer-a holds 5,
        // peer-b holds 3 (< min): peer-b gets the next claim, not me.
        let mut active = Vec::new();
        for p in 0..4 {
            active.push(record(&p.to_string(), "me"));
        }
        for p in 4..9 {
            active.push(record(&p.to_string(), "peer-a"));
        }
        for p in 9..12 {
            active.push(record(&p.to_string(), "peer-b"));
        }
        let mine: HashSet<String> = (0..4).map(|p| p.to_string()).collect();
        let candidate = select_claim("me", &mine, &active, &partitions(13), &mut rng());
        assert!(candidate.is_none());
    }

    #[test]
    fn test_at_minimum_claims_unclaimed_when_no_peer_is_starved() {
        // 13 partitions, 3 owners, min = 4. Everyone holds 4, one partition
        // is unclaimed: an at-minimum owner must pick up the 13th.
        let mut active = Vec::new();
        for p in 0..4 {
            active.push(record(&p.to_string(), "me"));
        }
        for p in 4..8 {
            active.push(record(&p.to_string(), "peer-a"));
        }
        for p in 8..12 {
            active.push(record(&p.to_string(), "peer-b"));
        }
        let mine: HashSet<String> = (0..4).map(|p| p.to_string()).collect();
        let candidate = select_claim("me", &mine, &active, &partitions(13), &mut rng());
        assert_eq!(candidate, Some(ClaimCandidate::Unclaimed("12".to_string())));
    }

    #[test]
    fn test_steals_from_over_quota_owner() {
        // 4 partitions, 2 owners, min = 2, max = 3. Peer holds all 4
        // (> max): steal one of them.
        let active: Vec<PartitionOwnership> =
            (0..4).map(|p| record(&p.to_string(), "peer")).collect();
        let candidate = select_claim("me", &HashSet::new(), &active, &partitions(4), &mut rng());
        match candidate {
            Some(ClaimCandidate::Steal(victim)) => assert_eq!(victim.owner_id, "peer"),
            other => panic!("expected steal candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_steals_from_at_maximum_owner_to_reach_minimum() {
        // 4 partitions, 3 owners (me at zero), min = 1, max = 2. Both peers
        // hold exactly max: steal to reach the minimum.
        let active = vec![
            record("0", "peer-a"),
            record("1", "peer-a"),
            record("2", "peer-b"),
            record("3", "peer-b"),
        ];
        let candidate = select_claim("me", &HashSet::new(), &active, &partitions(4), &mut rng());
        match candidate {
            Some(ClaimCandidate::Steal(victim)) => {
                assert!(victim.owner_id == "peer-a" || victim.owner_id == "peer-b");
            }
            other => panic!("expected steal candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_records_do_not_shield_partitions() {
        // The active view excludes expired records, so their partitions
        // count as unclaimed even though records exist in `all`.
        let candidate = select_claim("me", &HashSet::new(), &[], &partitions(2), &mut rng());
        assert!(matches!(candidate, Some(ClaimCandidate::Unclaimed(_))));
    }

    #[test]
    fn test_build_claim_request_reuses_expired_token() {
        let all = vec![record("1", "ghost")];
        let request = build_claim_request(
            "me",
            "ns",
            "hub",
            "$default",
            ClaimCandidate::Unclaimed("1".to_string()),
            &all,
        );
        assert_eq!(request.owner_id, "me");
        assert_eq!(request.version, Some("v-1".to_string()));
    }

    #[test]
    fn test_build_claim_request_fresh_partition_has_no_token() {
        let request = build_claim_request(
            "me",
            "ns",
            "hub",
            "$default",
            ClaimCandidate::Unclaimed("0".to_string()),
            &[],
        );
        assert!(request.version.is_none());
    }

    #[test]
    fn test_build_steal_request_keeps_victim_token() {
        let victim = record("2", "peer");
        let request = build_claim_request(
            "me",
            "ns",
            "hub",
            "$default",
            ClaimCandidate::Steal(victim.clone()),
            &[victim.clone()],
        );
        assert_eq!(request.owner_id, "me");
        assert_eq!(request.version, victim.version);
        assert_eq!(request.partition_id, "2");
    }
}
