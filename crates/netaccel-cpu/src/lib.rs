//! netaccel CPU - topology, isolation and core groups
//!
//! Packet workers run on isolated cores collected in the exclusive
//! `packet` group; everything else shares the `system` group. The two sets
//! never overlap.

#![warn(clippy::all)]

mod config;
mod groups;
mod load;
mod manager;
mod topology;

pub use config::CpuAffinityConfig;
pub use groups::{CoreGroup, CoreGroupStats, PACKET_GROUP, SYSTEM_GROUP};
pub use manager::{AffinityPhase, AffinityStats, CpuAffinityManager};
pub use topology::{CpuInfo, CpuTopology};

use thiserror::Error;

/// CPU affinity errors
#[derive(Error, Debug)]
pub enum AffinityError {
    #[error("CPU affinity management is disabled")]
    Disabled,

    #[error("CPU affinity manager already initialized")]
    AlreadyInitialized,

    #[error("CPU affinity manager not initialized")]
    NotInitialized,

    #[error("CPU topology unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("core group not found: {0}")]
    GroupNotFound(String),

    #[error("core {0} not found in topology")]
    CoreNotFound(usize),

    #[error("core {0} is already isolated")]
    AlreadyIsolated(usize),

    #[error("isolating core {0} would leave no CPUs for the system group")]
    LastSystemCore(usize),

    #[error("invalid isolation configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind {target} to CPUs {cpus:?}: {source}")]
    Bind {
        target: String,
        cpus: Vec<usize>,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, AffinityError>;
