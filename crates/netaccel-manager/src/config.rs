//! Orchestrator configuration

use crate::{AccelError, Result};
use netaccel_common::duration_ms;
use netaccel_cpu::CpuAffinityConfig;
use netaccel_sriov::SriovConfig;
use netaccel_xdp::{XdpConfig, ZeroCopyConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

const MAX_BATCH_SIZE: usize = 4096;

/// A technology the orchestrator can bring up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    /// XDP program on the interface
    Xdp,
    /// AF_XDP sockets feeding the slow path
    AfXdp,
    Sriov,
    CpuAffinity,
}

impl Accelerator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xdp => "xdp",
            Self::AfXdp => "af_xdp",
            Self::Sriov => "sriov",
            Self::CpuAffinity => "cpu_affinity",
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Where traffic goes when no acceleration handles it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Userspace proxy
    #[default]
    Proxy,
    /// Regular kernel stack
    Kernel,
    Drop,
}

/// Tuning hint applied to the AF_XDP workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    #[default]
    Balanced,
    /// Small batches
    Latency,
    /// Large batches
    Throughput,
    /// Longer poll timeouts, fewer wakeups
    Efficiency,
}

/// Acceleration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelerationConfig {
    /// Interface every technology attaches to
    pub interface: String,
    pub enabled: Vec<Accelerator>,
    pub fallback: FallbackMode,
    pub performance: PerformanceMode,
    /// Frames per AF_XDP receive batch before the performance mode is applied
    pub packet_batch_size: usize,
    #[serde(with = "duration_ms")]
    pub stats_interval: Duration,
    pub xdp: XdpConfig,
    pub zero_copy: ZeroCopyConfig,
    pub sriov: SriovConfig,
    pub cpu: CpuAffinityConfig,
}

impl Default for AccelerationConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            enabled: vec![Accelerator::Xdp, Accelerator::AfXdp, Accelerator::CpuAffinity],
            fallback: FallbackMode::Proxy,
            performance: PerformanceMode::Balanced,
            packet_batch_size: 64,
            stats_interval: Duration::from_secs(5),
            xdp: XdpConfig::default(),
            zero_copy: ZeroCopyConfig::default(),
            sriov: SriovConfig::default(),
            cpu: CpuAffinityConfig::default(),
        }
    }
}

impl AccelerationConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| AccelError::ConfigIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| AccelError::ConfigIo {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn is_enabled(&self, accelerator: Accelerator) -> bool {
        self.enabled.contains(&accelerator)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(AccelError::InvalidConfig("interface name is empty".to_string()));
        }
        if self.packet_batch_size == 0 || self.packet_batch_size > MAX_BATCH_SIZE {
            return Err(AccelError::InvalidConfig(format!(
                "packet batch size {} outside 1-{}",
                self.packet_batch_size, MAX_BATCH_SIZE
            )));
        }
        if self.stats_interval.is_zero() {
            return Err(AccelError::InvalidConfig("stats interval is zero".to_string()));
        }
        if self.is_enabled(Accelerator::Xdp) || self.is_enabled(Accelerator::AfXdp) {
            self.xdp
                .validate()
                .map_err(|e| AccelError::InvalidConfig(e.to_string()))?;
        }
        if self.is_enabled(Accelerator::AfXdp) {
            self.effective_zero_copy()
                .validate()
                .map_err(|e| AccelError::InvalidConfig(e.to_string()))?;
        }
        Ok(())
    }

    /// AF_XDP settings with the batch size and performance mode applied
    pub fn effective_zero_copy(&self) -> ZeroCopyConfig {
        let mut zc = self.zero_copy.clone();
        let batch = self.packet_batch_size.min(zc.frame_count as usize).max(1);

        zc.batch_size = match self.performance {
            PerformanceMode::Balanced | PerformanceMode::Efficiency => batch,
            PerformanceMode::Latency => batch.min(16),
            PerformanceMode::Throughput => (batch * 4).min(zc.frame_count as usize).max(1),
        };
        if self.performance == PerformanceMode::Efficiency {
            zc.poll_timeout = zc.poll_timeout.max(Duration::from_millis(10));
        }
        zc
    }
}
