//! netaccel detect - capability report for acceleration technologies
//!
//! [`HardwareDetector::detect`] scans CPU features, NUMA layout, hugepages
//! and every non-loopback interface, then evaluates which acceleration
//! technologies the host can run. Anything unavailable carries the concrete
//! prerequisites an operator has to fix.

#![warn(clippy::all)]

mod capability;
mod cpu;
mod detector;
mod drivers;
mod interface;

pub use capability::{AccelerationCapability, HardwareCapabilities, Technology};
pub use cpu::{CpuFeatures, KernelVersion};
pub use detector::HardwareDetector;
pub use interface::NetworkInterface;

use thiserror::Error;

/// Detection errors
#[derive(Error, Debug)]
pub enum DetectError {
    /// `/sys/class/net` could not be listed at all
    #[error("failed to enumerate network interfaces: {0}")]
    InterfaceScan(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DetectError>;
