//! netaccel SR-IOV - virtual function lifecycle
//!
//! Discovers SR-IOV capable physical functions, enables VFs within a
//! configured budget, applies per-VF MAC/VLAN/QoS/trust settings and keeps
//! per-VF traffic statistics.
//!
//! Invariant held by [`SriovManager`] at all times:
//! `pf.current_vfs == pf.vf_list.len() <= pf.max_vfs`.

#![warn(clippy::all)]

mod config;
mod manager;
mod model;
mod stats;

pub use config::{QosConfig, SriovConfig, VfConfig};
pub use manager::{SriovManager, SriovPhase};
pub use model::{LinkState, PhysicalFunction, VfStatistics, VirtualFunction};
pub use stats::SriovStats;

use thiserror::Error;

/// SR-IOV errors
#[derive(Error, Debug)]
pub enum SriovError {
    #[error("SR-IOV is disabled")]
    Disabled,

    #[error("SR-IOV manager already initialized")]
    AlreadyInitialized,

    #[error("SR-IOV manager not initialized")]
    NotInitialized,

    #[error("physical function not found: {0}")]
    PfNotFound(String),

    #[error("virtual function not found: {0}")]
    VfNotFound(String),

    #[error("{pf} supports at most {max} VFs, {requested} requested")]
    TooManyVfs { pf: String, requested: u32, max: u32 },

    #[error("physical function {0} has no network interface to configure VFs through")]
    NoNetdev(String),

    #[error("invalid VF configuration: {0}")]
    InvalidConfig(String),

    #[error("no unassigned virtual function available")]
    NoFreeVf,

    #[error("failed to read {path}: {source}")]
    Discovery {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write to {target} failed: {source}")]
    HardwareWrite {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SriovError>;
