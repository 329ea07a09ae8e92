//! Cluster Control Manager.
//!
//! The manager is the authority on which brokers exist, which registration epoch each of them is
//! on, and whether each of them is fenced. It follows a strict decide/apply split:
//!
//! - Write operations (`register_broker`, `process_broker_heartbeat`, `decommission_broker`,
//!   `fence_stale_brokers`) validate their input against the current state and return a
//!   `ControllerResult` holding the records which describe the transition. They never touch the
//!   replicated state.
//! - `replay` is the only path which mutates replicated state. It is used for records produced
//!   by this node as well as for records committed by a previous leader, and it applies them in
//!   strictly increasing offset order.
//!
//! Heartbeat liveness tracking is the one piece of state written on the decide path. It is local
//! to the active controller, is never replicated, and is discarded on `deactivate`.

pub mod heartbeat;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::cluster::heartbeat::{BrokerControlState, BrokerHeartbeatManager};
use crate::error::{ControllerError, CtlResult};
use crate::models::{
    BrokerHeartbeatReply, BrokerHeartbeatRequest, BrokerRegistration, BrokerRegistrationReply, BrokerRegistrationRequest, ControllerResult, FenceBrokerRecord,
    MetadataRecord, RegisterBrokerRecord, UnfenceBrokerRecord, UnregisterBrokerRecord,
};
use crate::placement::{ReplicaPlacementPolicy, UsableBroker};
use crate::versioned::{VersionedMap, NO_OFFSET};
use crate::BrokerId;

const STORE_REGISTRATIONS: &str = "broker_registrations";
const STORE_FENCING: &str = "broker_fencing";

/// A cloneable, read-only handle to the cluster state as of retained snapshots.
///
/// Views may be moved to other threads and read from while the manager continues to replay
/// records. Reads only succeed for snapshots which the manager has not yet deleted.
#[derive(Clone)]
pub struct ClusterView {
    registrations: Arc<VersionedMap<BrokerId, Arc<RegisterBrokerRecord>>>,
    fencing: Arc<VersionedMap<BrokerId, bool>>,
}

impl ClusterView {
    /// All broker registrations as of the snapshot at `offset`.
    pub fn broker_registrations_at(&self, offset: i64) -> CtlResult<BTreeMap<BrokerId, BrokerRegistration>> {
        let fencing: BTreeMap<_, _> = self.fencing.entries_at(offset)?.into_iter().collect();
        Ok(self
            .registrations
            .entries_at(offset)?
            .into_iter()
            .map(|(id, record)| {
                let fenced = fencing.get(&id).copied().unwrap_or(true);
                (id, BrokerRegistration::from_record(&record, fenced))
            })
            .collect())
    }

    /// Check if the given broker was registered and unfenced as of the snapshot at `offset`.
    pub fn unfenced_at(&self, id: BrokerId, offset: i64) -> CtlResult<bool> {
        let registered = self.registrations.get_at(&id, offset)?.is_some();
        let fenced = self.fencing.get_at(&id, offset)?.unwrap_or(true);
        Ok(registered && !fenced)
    }

    /// The offset of the most recent retained snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<i64> {
        self.fencing.latest_snapshot()
    }

    /// The offsets of all retained snapshots, in ascending order.
    pub fn snapshots(&self) -> Vec<i64> {
        self.fencing.snapshots()
    }
}

/// The authority on broker registration & fencing state.
pub struct ClusterControlManager {
    /// Whether this manager may perform mutating operations.
    active: bool,
    /// Leader-local broker liveness tracking.
    heartbeats: BrokerHeartbeatManager,
    /// The policy used to place new replicas.
    placement: Box<dyn ReplicaPlacementPolicy>,
    /// The registration record of each broker's current incarnation.
    registrations: Arc<VersionedMap<BrokerId, Arc<RegisterBrokerRecord>>>,
    /// The fencing state of each registered broker.
    fencing: Arc<VersionedMap<BrokerId, bool>>,
    /// The highest offset which has been replayed or snapshotted.
    last_applied_offset: i64,
}

impl ClusterControlManager {
    /// Create a new instance.
    pub fn new(clock: Arc<dyn Clock>, session_timeout: Duration, placement: Box<dyn ReplicaPlacementPolicy>) -> Self {
        Self {
            active: false,
            heartbeats: BrokerHeartbeatManager::new(clock, session_timeout),
            placement,
            registrations: Arc::new(VersionedMap::new(STORE_REGISTRATIONS)),
            fencing: Arc::new(VersionedMap::new(STORE_FENCING)),
            last_applied_offset: NO_OFFSET,
        }
    }

    /// Mark this manager as ready to accept writes.
    ///
    /// Every registered broker is given a fresh liveness session, as no heartbeats were tracked
    /// while this manager was inactive.
    pub fn activate(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        for (id, _) in self.registrations.entries() {
            self.heartbeats.register(id);
        }
        tracing::debug!("cluster control manager activated");
    }

    /// Stop accepting writes, discarding all leader-local state.
    pub fn deactivate(&mut self) {
        self.active = false;
        self.heartbeats.clear();
        tracing::debug!("cluster control manager deactivated");
    }

    /// Check if this manager is active.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The highest offset which has been replayed or snapshotted.
    pub fn last_applied_offset(&self) -> i64 {
        self.last_applied_offset
    }

    /// A read-only handle over this manager's retained snapshots.
    pub fn view(&self) -> ClusterView {
        ClusterView {
            registrations: self.registrations.clone(),
            fencing: self.fencing.clone(),
        }
    }

    /// All current broker registrations.
    pub fn broker_registrations(&self) -> BTreeMap<BrokerId, BrokerRegistration> {
        self.registrations
            .entries()
            .into_iter()
            .map(|(id, record)| (id, BrokerRegistration::from_record(&record, self.fenced(id))))
            .collect()
    }

    /// The current registration of the given broker, if any.
    pub fn broker_registration(&self, id: BrokerId) -> Option<BrokerRegistration> {
        self.registrations
            .get(&id)
            .map(|record| BrokerRegistration::from_record(&record, self.fenced(id)))
    }

    /// Check if the given broker is registered and unfenced.
    pub fn unfenced(&self, id: BrokerId) -> bool {
        self.registrations.get(&id).is_some() && !self.fenced(id)
    }

    /// Ensure that `epoch` is the current registration epoch of the given broker.
    pub fn check_broker_epoch(&self, id: BrokerId, epoch: i64) -> CtlResult<()> {
        match self.registrations.get(&id) {
            None => Err(ControllerError::StaleBrokerEpoch(format!("no broker epoch found for broker {}", id))),
            Some(record) if record.broker_epoch != epoch => Err(ControllerError::StaleBrokerEpoch(format!(
                "expected broker epoch {} for broker {}, but got {}",
                record.broker_epoch, id, epoch
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Register a broker at the given epoch.
    ///
    /// The epoch is chosen by the caller, typically as the log offset at which the registration
    /// record will be written, and must be greater than the broker's current epoch. New
    /// registrations always start out fenced.
    #[tracing::instrument(level = "trace", skip(self, request))]
    pub fn register_broker(&mut self, request: BrokerRegistrationRequest, broker_epoch: i64) -> CtlResult<ControllerResult<BrokerRegistrationReply>> {
        self.ensure_active()?;
        validate_registration(&request)?;
        let id = request.broker_id;
        if let Some(existing) = self.registrations.get(&id) {
            if broker_epoch <= existing.broker_epoch {
                return Err(ControllerError::StaleBrokerEpoch(format!(
                    "registration epoch {} for broker {} is not greater than the current epoch {}",
                    broker_epoch, id, existing.broker_epoch
                )));
            }
            if existing.incarnation_id != request.incarnation_id && self.heartbeats.has_valid_session(id) {
                return Err(ControllerError::DuplicateBrokerRegistration(id));
            }
        }

        let record = RegisterBrokerRecord {
            broker_id: id,
            broker_epoch,
            incarnation_id: request.incarnation_id,
            endpoints: request.listeners,
            features: request.features,
            rack: request.rack,
        };
        Ok(ControllerResult::new(vec![record.into()], BrokerRegistrationReply { epoch: broker_epoch }))
    }

    /// Remove the given broker from the cluster, whether or not it is fenced.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn decommission_broker(&mut self, id: BrokerId) -> CtlResult<ControllerResult<()>> {
        self.ensure_active()?;
        if self.registrations.get(&id).is_none() {
            return Ok(ControllerResult::new(vec![], ()));
        }
        Ok(ControllerResult::new(vec![UnregisterBrokerRecord { broker_id: id }.into()], ()))
    }

    /// Process a heartbeat from a broker.
    ///
    /// `last_committed_offset` is the offset of the last committed metadata record, against
    /// which the broker's progress is measured. `shutdown_ready` indicates whether a broker in
    /// controlled shutdown may now stop.
    #[tracing::instrument(level = "trace", skip(self, request))]
    pub fn process_broker_heartbeat(
        &mut self, request: BrokerHeartbeatRequest, last_committed_offset: i64, shutdown_ready: bool,
    ) -> CtlResult<ControllerResult<BrokerHeartbeatReply>> {
        self.ensure_active()?;
        let (id, epoch) = (request.broker_id, request.broker_epoch);
        self.check_broker_epoch(id, epoch)?;

        let states = self.heartbeats.calculate_next_state(&request, self.fenced(id), shutdown_ready);
        let mut records = Vec::new();
        if states.current != states.next {
            tracing::debug!(broker_id = id, current = ?states.current, next = ?states.next, "broker control state changing");
            match states.next {
                BrokerControlState::Fenced | BrokerControlState::ShutdownNow => {
                    if !states.current.fenced() {
                        records.push(FenceBrokerRecord { id, epoch }.into());
                    }
                }
                BrokerControlState::Unfenced => records.push(UnfenceBrokerRecord { id, epoch }.into()),
                BrokerControlState::PendingControlledShutdown => (),
            }
        }
        self.heartbeats.touch(id);
        self.heartbeats.set_controlled_shutdown(id, states.next.in_controlled_shutdown());

        let reply = BrokerHeartbeatReply::new(
            request.current_metadata_offset >= last_committed_offset,
            states.next.fenced(),
            states.next.in_controlled_shutdown(),
            states.next.should_shut_down(),
        );
        Ok(ControllerResult::new(records, reply))
    }

    /// Fence every unfenced broker which has not sent a heartbeat within the session timeout.
    ///
    /// Fenced brokers stop being tracked until their next heartbeat, so a sweep never fences the
    /// same broker twice while its fence record is in flight.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn fence_stale_brokers(&mut self) -> CtlResult<ControllerResult<Vec<BrokerId>>> {
        self.ensure_active()?;
        let mut records = Vec::new();
        let mut fenced = Vec::new();
        for id in self.heartbeats.stale_brokers() {
            if let Some(record) = self.registrations.get(&id) {
                if !self.fenced(id) {
                    tracing::info!(broker_id = id, epoch = record.broker_epoch, "fencing broker whose session has expired");
                    records.push(FenceBrokerRecord { id, epoch: record.broker_epoch }.into());
                    fenced.push(id);
                }
            }
            self.heartbeats.remove(id);
        }
        Ok(ControllerResult::new(records, fenced))
    }

    /// All registered brokers which are eligible to host replicas, in ascending ID order.
    ///
    /// Brokers which are fenced or in controlled shutdown are not eligible.
    pub fn usable_brokers(&self) -> Vec<UsableBroker> {
        let mut usable: Vec<_> = self
            .registrations
            .entries()
            .into_iter()
            .filter(|(id, _)| !self.fenced(*id) && !self.heartbeats.in_controlled_shutdown(*id))
            .map(|(id, record)| UsableBroker { id, rack: record.rack.clone() })
            .collect();
        usable.sort_unstable_by_key(|broker| broker.id);
        usable
    }

    /// Compute replica placements for `num_partitions` new partitions over the unfenced brokers.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn place_replicas(&mut self, num_partitions: usize, replication_factor: i16) -> CtlResult<Vec<Vec<BrokerId>>> {
        if num_partitions == 0 {
            return Err(ControllerError::InvalidRequest("the number of partitions must be greater than 0".into()));
        }
        if replication_factor <= 0 {
            return Err(ControllerError::InvalidReplicationFactor(replication_factor));
        }
        let usable = self.usable_brokers();
        self.placement.create_placement(num_partitions, replication_factor as usize, &usable)
    }

    /// Apply a committed record at the given offset.
    ///
    /// Records must be replayed in strictly increasing offset order. Any error returned from this
    /// method is an `InvariantViolation`, after which this manager must not keep serving.
    #[tracing::instrument(level = "trace", skip(self, record))]
    pub fn replay(&mut self, record: &MetadataRecord, offset: i64) -> CtlResult<()> {
        if offset <= self.last_applied_offset {
            return Err(ControllerError::InvariantViolation(format!(
                "record offset {} is not greater than last applied offset {}",
                offset, self.last_applied_offset
            )));
        }
        match record {
            MetadataRecord::RegisterBroker(record) => self.replay_register(record, offset)?,
            MetadataRecord::UnfenceBroker(record) => self.replay_fencing(record.id, record.epoch, false, offset)?,
            MetadataRecord::FenceBroker(record) => self.replay_fencing(record.id, record.epoch, true, offset)?,
            MetadataRecord::UnregisterBroker(record) => self.replay_unregister(record.broker_id, offset)?,
        }
        self.last_applied_offset = offset;
        Ok(())
    }

    /// Create a snapshot of the current state at `offset`.
    pub fn create_snapshot(&mut self, offset: i64) -> CtlResult<()> {
        self.registrations.snapshot(offset)?;
        self.fencing.snapshot(offset)?;
        self.last_applied_offset = self.last_applied_offset.max(offset);
        Ok(())
    }

    /// Delete all snapshots below `offset`, reclaiming history no longer reachable.
    pub fn delete_snapshots_up_to(&mut self, offset: i64) {
        self.registrations.delete_snapshots_up_to(offset);
        self.fencing.delete_snapshots_up_to(offset);
    }

    /// Revert all state to the snapshot at `offset`.
    pub fn revert_to_snapshot(&mut self, offset: i64) -> CtlResult<()> {
        self.registrations.revert_to_snapshot(offset)?;
        self.fencing.revert_to_snapshot(offset)?;
        self.last_applied_offset = offset;
        tracing::info!(offset, "reverted cluster state to snapshot");
        Ok(())
    }

    fn replay_register(&mut self, record: &RegisterBrokerRecord, offset: i64) -> CtlResult<()> {
        let id = record.broker_id;
        if let Some(existing) = self.registrations.get(&id) {
            if record.broker_epoch <= existing.broker_epoch {
                return Err(ControllerError::InvariantViolation(format!(
                    "registration of broker {} at epoch {} does not supersede current epoch {}",
                    id, record.broker_epoch, existing.broker_epoch
                )));
            }
        }
        self.registrations.set(id, offset, Arc::new(record.clone()))?;
        self.fencing.set(id, offset, true)?;
        if self.active {
            self.heartbeats.register(id);
        }
        tracing::info!(broker_id = id, epoch = record.broker_epoch, incarnation_id = %record.incarnation_id, "registered broker");
        Ok(())
    }

    fn replay_fencing(&mut self, id: BrokerId, epoch: i64, fenced: bool, offset: i64) -> CtlResult<()> {
        match self.registrations.get(&id) {
            Some(record) if record.broker_epoch == epoch => {
                self.fencing.set(id, offset, fenced)?;
                tracing::info!(broker_id = id, epoch, fenced, "updated broker fencing state");
            }
            Some(record) => {
                tracing::warn!(broker_id = id, epoch, current_epoch = record.broker_epoch, fenced, "ignoring fencing record for stale broker epoch");
            }
            None => {
                tracing::warn!(broker_id = id, epoch, fenced, "ignoring fencing record for unknown broker");
            }
        }
        Ok(())
    }

    fn replay_unregister(&mut self, id: BrokerId, offset: i64) -> CtlResult<()> {
        let removed = self.registrations.remove(&id, offset)?;
        self.fencing.remove(&id, offset)?;
        self.heartbeats.remove(id);
        match removed {
            Some(record) => tracing::info!(broker_id = id, epoch = record.broker_epoch, "unregistered broker"),
            None => tracing::warn!(broker_id = id, "ignoring unregistration of unknown broker"),
        }
        Ok(())
    }

    fn fenced(&self, id: BrokerId) -> bool {
        self.fencing.get(&id).unwrap_or(true)
    }

    fn ensure_active(&self) -> CtlResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(ControllerError::NotActive)
        }
    }
}

/// Validate the contents of a registration request.
fn validate_registration(request: &BrokerRegistrationRequest) -> CtlResult<()> {
    if request.listeners.is_empty() {
        return Err(ControllerError::InvalidRequest(format!("broker {} registered without any listeners", request.broker_id)));
    }
    let mut names = HashSet::new();
    for listener in request.listeners.iter() {
        if !names.insert(listener.name.as_str()) {
            return Err(ControllerError::InvalidRequest(format!("duplicate listener name {}", listener.name)));
        }
    }
    if let Some((name, range)) = request.features.iter().find(|(_, range)| range.min > range.max) {
        return Err(ControllerError::InvalidRequest(format!(
            "invalid version range {}..{} for feature {}",
            range.min, range.max, name
        )));
    }
    Ok(())
}
