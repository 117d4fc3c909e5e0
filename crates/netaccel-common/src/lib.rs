//! netaccel common - shared primitives for the acceleration subsystem
//!
//! This crate provides:
//! - [`HostProbe`]: every `/proc` and `/sys` read or write the managers perform
//! - [`MutationReport`]: outcome of best-effort hardware changes
//! - [`Collector`]: background statistics task with a running flag
//! - [`Service`]: control-plane service record pushed through `update_services`

#![warn(clippy::all)]

pub mod collector;
pub mod cpulist;
pub mod host;
pub mod mutation;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use collector::Collector;
pub use cpulist::parse_cpu_list;
pub use host::{cmdline_iommu_enabled, HostProbe, InterfaceCounters, SriovCapability, SysfsProbe, VfAttributes};
pub use mutation::{MutationFailure, MutationReport, Outcome};
pub use service::{Service, ServiceProtocol};

/// Serde adapter storing a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
