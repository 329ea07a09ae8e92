use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use uuid::Uuid;

use crate::clock::MockClock;
use crate::cluster::ClusterControlManager;
use crate::models::{BrokerHeartbeatRequest, BrokerRegistrationRequest, Endpoint, MetadataRecord, RegisterBrokerRecord, SecurityProtocol};
use crate::placement::{RandomReplicaPlacer, ReplicaPlacementPolicy};
use crate::BrokerId;

/// The session timeout used by test managers.
pub const SESSION_TIMEOUT: Duration = Duration::from_millis(1000);

/// A stable incarnation ID for tests.
pub fn incarnation(id: BrokerId) -> Uuid {
    Uuid::from_u128(0x5e7b_0000_0000_0000_0000_0000_0000_0000 | id as u128)
}

/// Build a new active manager over the given clock & placement policy.
pub fn new_manager_with(clock: Arc<MockClock>, placement: Box<dyn ReplicaPlacementPolicy>) -> ClusterControlManager {
    let mut manager = ClusterControlManager::new(clock, SESSION_TIMEOUT, placement);
    manager.activate();
    manager
}

/// Build a new active manager over the given clock, with a seeded placement policy.
pub fn new_manager(clock: Arc<MockClock>) -> ClusterControlManager {
    new_manager_with(clock, Box::new(RandomReplicaPlacer::new(StdRng::seed_from_u64(0))))
}

/// The single plaintext listener used by test brokers.
pub fn plaintext_endpoint() -> Endpoint {
    Endpoint::new("PLAINTEXT", SecurityProtocol::Plaintext, "example.com", 9092)
}

/// Build a registration request for the given broker.
pub fn registration_request(id: BrokerId, rack: Option<&str>) -> BrokerRegistrationRequest {
    BrokerRegistrationRequest {
        broker_id: id,
        incarnation_id: incarnation(id),
        listeners: vec![plaintext_endpoint()],
        features: BTreeMap::new(),
        rack: rack.map(String::from),
    }
}

/// Build a registration record for the given broker & epoch.
pub fn register_record(id: BrokerId, epoch: i64) -> RegisterBrokerRecord {
    RegisterBrokerRecord {
        broker_id: id,
        broker_epoch: epoch,
        incarnation_id: incarnation(id),
        endpoints: vec![plaintext_endpoint()],
        features: BTreeMap::new(),
        rack: None,
    }
}

/// Build a heartbeat request.
pub fn heartbeat(id: BrokerId, epoch: i64, current_metadata_offset: i64, want_fence: bool, want_shut_down: bool) -> BrokerHeartbeatRequest {
    BrokerHeartbeatRequest {
        broker_id: id,
        broker_epoch: epoch,
        current_metadata_offset,
        want_fence,
        want_shut_down,
    }
}

/// Replay the given records at the offsets following the manager's last applied offset,
/// returning the offset of the last record replayed.
pub fn replay_all(manager: &mut ClusterControlManager, records: &[MetadataRecord]) -> Result<i64> {
    for record in records {
        let offset = manager.last_applied_offset() + 1;
        manager.replay(record, offset).with_context(|| format!("error replaying {:?} at offset {}", record, offset))?;
    }
    Ok(manager.last_applied_offset())
}

/// Register the given broker at `epoch` and unfence it through a heartbeat.
pub fn register_and_unfence(manager: &mut ClusterControlManager, id: BrokerId, epoch: i64) -> Result<()> {
    replay_all(manager, &[register_record(id, epoch).into()])?;
    let result = manager.process_broker_heartbeat(heartbeat(id, epoch, 0, false, false), 0, false)?;
    replay_all(manager, &result.records)?;
    Ok(())
}
