//! Core groups

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SYSTEM_GROUP: &str = "system";
pub const PACKET_GROUP: &str = "packet";

pub(crate) const SYSTEM_PRIORITY: u32 = 1;
pub(crate) const PACKET_PRIORITY: u32 = 10;

/// Rolling statistics of a core group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreGroupStats {
    pub average_load: f64,
    pub peak_load: f64,
    pub bindings: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// A named partition of CPUs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreGroup {
    pub name: String,
    pub cpus: Vec<usize>,
    pub purpose: String,
    pub priority: u32,
    /// Isolated and single-purpose
    pub exclusive: bool,
    pub stats: CoreGroupStats,
    pub assigned_services: Vec<u64>,
}

impl CoreGroup {
    pub(crate) fn system(cpus: Vec<usize>) -> Self {
        Self {
            name: SYSTEM_GROUP.to_string(),
            cpus,
            purpose: "System and background tasks".to_string(),
            priority: SYSTEM_PRIORITY,
            exclusive: false,
            stats: CoreGroupStats::default(),
            assigned_services: Vec::new(),
        }
    }

    pub(crate) fn packet(cpus: Vec<usize>) -> Self {
        Self {
            name: PACKET_GROUP.to_string(),
            cpus,
            purpose: "Dedicated packet processing".to_string(),
            priority: PACKET_PRIORITY,
            exclusive: true,
            stats: CoreGroupStats::default(),
            assigned_services: Vec::new(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.stats.last_activity = Some(Utc::now());
    }
}
