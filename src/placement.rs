//! Replica placement.
//!
//! Placement is a pure function of the usable broker set and the random source handed to the
//! policy. The random source is injected so that tests can drive placements deterministically.
//!
//! ## Rack awareness
//! When more than half of the usable brokers carry a rack, each partition's replicas are spread
//! across racks before any rack receives a second replica. Brokers without a rack are treated as
//! members of one shared anonymous rack. Below that threshold, replicas are drawn uniformly at
//! random. In both modes the replicas of a single partition are always distinct, while
//! placements of different partitions are independent of one another.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{ControllerError, CtlResult};
use crate::BrokerId;

/// A broker which is eligible to host replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsableBroker {
    /// The ID of the broker.
    pub id: BrokerId,
    /// The rack of the broker, if any.
    pub rack: Option<String>,
}

/// A policy which decides where the replicas of new partitions are placed.
pub trait ReplicaPlacementPolicy: Send {
    /// Create replica assignments for `num_partitions` partitions.
    ///
    /// Each assignment holds `replication_factor` distinct broker IDs drawn from `usable_brokers`,
    /// the first of which is the preferred leader.
    fn create_placement(&mut self, num_partitions: usize, replication_factor: usize, usable_brokers: &[UsableBroker]) -> CtlResult<Vec<Vec<BrokerId>>>;
}

/// A placement policy which randomly selects replicas, spreading them across racks when rack
/// information is broadly available.
pub struct RandomReplicaPlacer<R> {
    rng: R,
}

impl<R: Rng> RandomReplicaPlacer<R> {
    /// Create a new instance using the given random source.
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Choose replicas uniformly at random.
    fn place_uniform(&mut self, replication_factor: usize, usable_brokers: &[UsableBroker]) -> Vec<BrokerId> {
        let mut ids: Vec<BrokerId> = usable_brokers.iter().map(|broker| broker.id).collect();
        let (chosen, _) = ids.partial_shuffle(&mut self.rng, replication_factor);
        chosen.to_vec()
    }

    /// Choose replicas one rack at a time, visiting racks in a random order.
    fn place_rack_aware(&mut self, replication_factor: usize, racks: &BTreeMap<Option<&str>, Vec<BrokerId>>) -> Vec<BrokerId> {
        let mut groups: Vec<Vec<BrokerId>> = racks.values().cloned().collect();
        for group in groups.iter_mut() {
            group.shuffle(&mut self.rng);
        }
        groups.shuffle(&mut self.rng);

        let mut replicas = Vec::with_capacity(replication_factor);
        while replicas.len() < replication_factor {
            let mut progressed = false;
            for group in groups.iter_mut() {
                if replicas.len() == replication_factor {
                    break;
                }
                if let Some(id) = group.pop() {
                    replicas.push(id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        replicas
    }
}

impl<R: Rng + Send> ReplicaPlacementPolicy for RandomReplicaPlacer<R> {
    #[tracing::instrument(level = "trace", skip(self, usable_brokers))]
    fn create_placement(&mut self, num_partitions: usize, replication_factor: usize, usable_brokers: &[UsableBroker]) -> CtlResult<Vec<Vec<BrokerId>>> {
        if replication_factor == 0 {
            return Err(ControllerError::InvalidReplicationFactor(0));
        }
        if replication_factor > usable_brokers.len() {
            return Err(ControllerError::NotEnoughReplicas {
                requested: replication_factor,
                available: usable_brokers.len(),
            });
        }

        let num_racked = usable_brokers.iter().filter(|broker| broker.rack.is_some()).count();
        if num_racked * 2 <= usable_brokers.len() {
            return Ok((0..num_partitions).map(|_| self.place_uniform(replication_factor, usable_brokers)).collect());
        }

        let racks = usable_brokers.iter().fold(BTreeMap::new(), |mut acc: BTreeMap<Option<&str>, Vec<BrokerId>>, broker| {
            acc.entry(broker.rack.as_deref()).or_default().push(broker.id);
            acc
        });
        tracing::trace!(num_racks = racks.len(), "placing replicas across racks");
        Ok((0..num_partitions).map(|_| self.place_rack_aware(replication_factor, &racks)).collect())
    }
}
