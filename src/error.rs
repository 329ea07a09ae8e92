//! Hadron cluster controller error abstractions.

use thiserror::Error;

use crate::versioned::StoreError;
use crate::BrokerId;

// Protocol error codes.
pub const CODE_UNKNOWN_SERVER_ERROR: i16 = -1;
pub const CODE_NOT_ENOUGH_REPLICAS: i16 = 19;
pub const CODE_INVALID_REPLICATION_FACTOR: i16 = 38;
pub const CODE_NOT_CONTROLLER: i16 = 41;
pub const CODE_INVALID_REQUEST: i16 = 42;
pub const CODE_STALE_BROKER_EPOCH: i16 = 77;
pub const CODE_DUPLICATE_BROKER_REGISTRATION: i16 = 101;

/// Controller error variants.
///
/// Every variant except `InvariantViolation` is returned to the caller of a write operation
/// before any record is produced, so none of them leave partial state behind.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The request referenced a broker epoch which is not the currently registered one.
    #[error("stale broker epoch: {0}")]
    StaleBrokerEpoch(String),
    /// More replicas were requested than there are unfenced brokers.
    #[error("unable to place {requested} replicas, only {available} usable brokers are available")]
    NotEnoughReplicas { requested: usize, available: usize },
    /// The requested replication factor is not a positive value.
    #[error("invalid replication factor {0}, must be greater than 0")]
    InvalidReplicationFactor(i16),
    /// The given input was invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Another live incarnation of the broker already holds the broker ID.
    #[error("broker {0} is already registered by another live incarnation")]
    DuplicateBrokerRegistration(BrokerId),
    /// A mutating operation was attempted before the manager was activated.
    #[error("the cluster control manager is not active")]
    NotActive,
    /// Replay hit a condition which indicates corrupted or misordered state.
    ///
    /// This is fatal for the controller instance.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ControllerError {
    /// Check if this error requires the controller to stop serving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Get the protocol error code for this error.
    pub fn error_code(&self) -> i16 {
        match self {
            Self::StaleBrokerEpoch(_) => CODE_STALE_BROKER_EPOCH,
            Self::NotEnoughReplicas { .. } => CODE_NOT_ENOUGH_REPLICAS,
            Self::InvalidReplicationFactor(_) => CODE_INVALID_REPLICATION_FACTOR,
            Self::InvalidRequest(_) => CODE_INVALID_REQUEST,
            Self::DuplicateBrokerRegistration(_) => CODE_DUPLICATE_BROKER_REGISTRATION,
            Self::NotActive => CODE_NOT_CONTROLLER,
            Self::InvariantViolation(_) => CODE_UNKNOWN_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        Self::InvariantViolation(err.to_string())
    }
}

/// A result type where the error is a `ControllerError`.
pub type CtlResult<T> = ::std::result::Result<T, ControllerError>;

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

impl From<ControllerError> for ShutdownError {
    fn from(err: ControllerError) -> Self {
        Self(anyhow::Error::from(err))
    }
}
