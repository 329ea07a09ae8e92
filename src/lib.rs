//! The Hadron cluster controller.
//!
//! Tracks broker membership, registration epochs and fencing as a replicated state machine, and
//! places the replicas of new partitions over the brokers which are eligible to host them.

pub mod app;
pub mod clock;
pub mod cluster;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod ctl;
#[cfg(test)]
mod ctl_test;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod log;
pub mod models;
pub mod placement;
#[cfg(test)]
mod placement_test;
pub mod versioned;

/// The ID of a broker.
pub type BrokerId = i32;
