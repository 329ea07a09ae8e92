//! Cluster data models, log records & request/response types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::BrokerId;

/// The security protocol spoken on a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

/// A network endpoint on which a broker listens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// The name of the listener.
    pub name: String,
    /// The security protocol of the listener.
    pub security_protocol: SecurityProtocol,
    /// The hostname of the listener.
    pub host: String,
    /// The port of the listener.
    pub port: u16,
}

impl Endpoint {
    /// Create a new instance.
    pub fn new(name: &str, security_protocol: SecurityProtocol, host: &str, port: u16) -> Self {
        Self {
            name: name.into(),
            security_protocol,
            host: host.into(),
            port,
        }
    }
}

/// An inclusive range of supported feature versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: i16,
    pub max: i16,
}

impl VersionRange {
    /// Create a new instance.
    pub fn new(min: i16, max: i16) -> Self {
        Self { min, max }
    }
}

/// The registration of a specific broker incarnation.
///
/// Registrations are replaced wholesale when a broker re-registers, they are never merged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRegistration {
    /// The ID of the broker.
    pub id: BrokerId,
    /// The epoch of this registration.
    pub epoch: i64,
    /// The unique ID of the broker process which registered.
    pub incarnation_id: Uuid,
    /// The broker's listeners, keyed by listener name.
    pub listeners: BTreeMap<String, Endpoint>,
    /// The broker's supported features, keyed by feature name.
    pub supported_features: BTreeMap<String, VersionRange>,
    /// The rack of the broker, if any.
    pub rack: Option<String>,
    /// Whether the broker is fenced, and thus not eligible to host data.
    pub fenced: bool,
}

impl BrokerRegistration {
    /// Build a registration from its record, along with the given fencing state.
    pub fn from_record(record: &RegisterBrokerRecord, fenced: bool) -> Self {
        Self {
            id: record.broker_id,
            epoch: record.broker_epoch,
            incarnation_id: record.incarnation_id,
            listeners: record.endpoints.iter().map(|endpoint| (endpoint.name.clone(), endpoint.clone())).collect(),
            supported_features: record.features.clone(),
            rack: record.rack.clone(),
            fenced,
        }
    }
}

/// A record which registers a broker, superseding any previous registration of its ID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBrokerRecord {
    pub broker_id: BrokerId,
    pub broker_epoch: i64,
    pub incarnation_id: Uuid,
    pub endpoints: Vec<Endpoint>,
    pub features: BTreeMap<String, VersionRange>,
    pub rack: Option<String>,
}

/// A record which unfences the registration of a broker with the given epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnfenceBrokerRecord {
    pub id: BrokerId,
    pub epoch: i64,
}

/// A record which fences the registration of a broker with the given epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceBrokerRecord {
    pub id: BrokerId,
    pub epoch: i64,
}

/// A record which removes a broker from the cluster entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterBrokerRecord {
    pub broker_id: BrokerId,
}

/// A cluster metadata log record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MetadataRecord {
    RegisterBroker(RegisterBrokerRecord),
    UnfenceBroker(UnfenceBrokerRecord),
    FenceBroker(FenceBrokerRecord),
    UnregisterBroker(UnregisterBrokerRecord),
}

impl MetadataRecord {
    /// The ID of the broker targeted by this record.
    pub fn broker_id(&self) -> BrokerId {
        match self {
            Self::RegisterBroker(record) => record.broker_id,
            Self::UnfenceBroker(record) => record.id,
            Self::FenceBroker(record) => record.id,
            Self::UnregisterBroker(record) => record.broker_id,
        }
    }
}

impl From<RegisterBrokerRecord> for MetadataRecord {
    fn from(record: RegisterBrokerRecord) -> Self {
        Self::RegisterBroker(record)
    }
}

impl From<UnfenceBrokerRecord> for MetadataRecord {
    fn from(record: UnfenceBrokerRecord) -> Self {
        Self::UnfenceBroker(record)
    }
}

impl From<FenceBrokerRecord> for MetadataRecord {
    fn from(record: FenceBrokerRecord) -> Self {
        Self::FenceBroker(record)
    }
}

impl From<UnregisterBrokerRecord> for MetadataRecord {
    fn from(record: UnregisterBrokerRecord) -> Self {
        Self::UnregisterBroker(record)
    }
}

/// The outcome of a single controller write operation.
///
/// Write operations never mutate state. They describe the state transition as records to be
/// appended to the log, and the response to be returned to the caller. State only changes once
/// those records are committed and replayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerResult<T> {
    /// The records describing the state transition, in order.
    pub records: Vec<MetadataRecord>,
    /// The response for the caller.
    pub response: T,
}

impl<T> ControllerResult<T> {
    /// Create a new instance.
    pub fn new(records: Vec<MetadataRecord>, response: T) -> Self {
        Self { records, response }
    }
}

/// A request from a broker to register with the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRegistrationRequest {
    /// The ID of the broker.
    pub broker_id: BrokerId,
    /// The unique ID of the broker process.
    pub incarnation_id: Uuid,
    /// The broker's listeners.
    pub listeners: Vec<Endpoint>,
    /// The broker's supported features.
    #[serde(default)]
    pub features: BTreeMap<String, VersionRange>,
    /// The rack of the broker, if any.
    #[serde(default)]
    pub rack: Option<String>,
}

/// The response to a successful broker registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRegistrationReply {
    /// The epoch assigned to the new registration.
    pub epoch: i64,
}

/// A periodic liveness signal from a broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerHeartbeatRequest {
    /// The ID of the broker.
    pub broker_id: BrokerId,
    /// The epoch of the broker's registration.
    pub broker_epoch: i64,
    /// The highest metadata offset which the broker has applied.
    pub current_metadata_offset: i64,
    /// Whether the broker wants to be fenced.
    pub want_fence: bool,
    /// Whether the broker wants to shut down.
    pub want_shut_down: bool,
}

/// The controller's response to a broker heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerHeartbeatReply {
    /// Whether the broker has caught up with the committed metadata log.
    pub is_caught_up: bool,
    /// Whether the broker is fenced after this heartbeat.
    pub is_fenced: bool,
    /// Whether the broker is in controlled shutdown after this heartbeat.
    pub in_controlled_shutdown: bool,
    /// Whether the broker should shut down now.
    pub should_shut_down: bool,
}

impl BrokerHeartbeatReply {
    /// Create a new instance.
    pub fn new(is_caught_up: bool, is_fenced: bool, in_controlled_shutdown: bool, should_shut_down: bool) -> Self {
        Self {
            is_caught_up,
            is_fenced,
            in_controlled_shutdown,
            should_shut_down,
        }
    }
}
