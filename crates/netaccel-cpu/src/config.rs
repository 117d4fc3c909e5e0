//! CPU affinity configuration

use netaccel_common::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuAffinityConfig {
    pub enabled: bool,
    pub enable_isolation: bool,
    /// Explicit isolated CPUs; empty selects automatically
    pub isolated_cores: Vec<usize>,
    #[serde(with = "duration_ms")]
    pub stats_interval: Duration,
    /// Group average load (0.0 - 1.0) above which a warning is logged
    pub load_threshold: f64,
}

impl Default for CpuAffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_isolation: true,
            isolated_cores: Vec::new(),
            stats_interval: Duration::from_secs(5),
            load_threshold: 0.8,
        }
    }
}
