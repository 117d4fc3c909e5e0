//! netaccel manager - acceleration orchestrator
//!
//! [`AccelerationManager`] detects what the host supports, brings up every
//! enabled technology that the capability report allows and keeps one
//! aggregated statistics snapshot for all of them. A technology that fails
//! to come up is logged and left out; the rest keep running.
//!
//! ```text
//!            ┌──────────────────────────┐
//!            │   AccelerationManager    │
//!            └────────────┬─────────────┘
//!      ┌──────────┬───────┴──────┬─────────────┐
//!      ▼          ▼              ▼             ▼
//!   XDP fast   AF_XDP ◄─bridge─► slow path   SR-IOV / CPU
//!     path     sockets           processor    placement
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod manager;
pub mod stats;

pub use config::{AccelerationConfig, Accelerator, FallbackMode, PerformanceMode};
pub use manager::{AccelerationManager, ManagerPhase};
pub use stats::AccelerationStats;

use std::path::PathBuf;
use thiserror::Error;

/// Orchestrator errors
#[derive(Error, Debug)]
pub enum AccelError {
    #[error("acceleration manager already initialized")]
    AlreadyInitialized,

    #[error("acceleration manager not initialized")]
    NotInitialized,

    #[error("acceleration manager already running")]
    AlreadyRunning,

    #[error("operation not valid while {0:?}")]
    InvalidState(ManagerPhase),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("hardware detection failed: {0}")]
    Detection(#[from] netaccel_detect::DetectError),

    #[error("restart after configuration change failed: {0}")]
    Restart(#[source] Box<AccelError>),

    #[error("failed to access config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    ConfigFormat(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AccelError>;
