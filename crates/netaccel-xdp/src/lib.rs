//! netaccel XDP - kernel fast path and the zero-copy slow path
//!
//! This crate provides:
//! - [`XdpManager`]: loads and attaches the pre-compiled XDP object and
//!   keeps its `service_rules` map in sync with the control plane
//! - [`ZeroCopyManager`]: one AF_XDP socket and worker thread per queue
//! - [`SlowPathBridge`]: receives frames the fast path redirected, parses
//!   and classifies them, and hands them to the [`PacketProcessor`]
//!
//! Kernel access goes through [`ProgramLoader`]. [`BpftoolLoader`] drives
//! iproute2 and bpftool; tests use the in-memory loader from `testing`.

#![warn(clippy::all)]

mod bridge;
mod config;
mod fast_path;
mod loader;
mod rules;
mod zero_copy;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bridge::{BridgeStats, PacketClass, PacketProcessor, SlowPathBridge, SlowPathPacket};
pub use config::{AttachMode, XdpConfig, ZeroCopyConfig};
pub use fast_path::{XdpManager, XdpStats};
pub use loader::{BpftoolLoader, ProgramHandle, ProgramLoader, XskSocket};
pub use rules::{RuleAction, ServiceRule};
pub use zero_copy::{FrameSink, ZeroCopyManager, ZeroCopyStats};

use std::path::PathBuf;
use thiserror::Error;

/// Pinned map holding the service rule table
pub const SERVICE_RULES_MAP: &str = "service_rules";
/// Per-CPU array of fast-path counters
pub const STATS_MAP: &str = "stats_map";
/// Queue id to AF_XDP socket map used for `XDP_REDIRECT`
pub const XSKS_MAP: &str = "xsks_map";

/// XDP and AF_XDP errors
#[derive(Error, Debug)]
pub enum XdpError {
    #[error("XDP program already loaded")]
    AlreadyInitialized,

    #[error("XDP program not loaded")]
    NotInitialized,

    #[error("XDP program file not found: {0}")]
    ProgramNotFound(PathBuf),

    #[error("no interfaces to attach to")]
    NoInterfaces,

    #[error("failed to attach XDP program to {iface}: {reason}")]
    Attach { iface: String, reason: String },

    #[error("failed to run {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("map {map}: {reason}")]
    Map { map: String, reason: String },

    #[error("AF_XDP socket for queue {queue}: {reason}")]
    Socket { queue: u32, reason: String },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, XdpError>;
