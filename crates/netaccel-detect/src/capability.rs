//! Capability report types

use crate::cpu::{CpuFeatures, KernelVersion};
use crate::interface::NetworkInterface;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;

/// Acceleration technology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technology {
    /// Virtual functions carved out of the NIC
    Sriov,
    /// Kernel-bypass poll-mode drivers
    Dpdk,
    /// Zero-copy userspace sockets
    AfXdp,
    /// Driver-level fast path
    Xdp,
    /// Plain userspace processing
    None,
}

impl Technology {
    /// Canonical preference order, most hardware-offloaded first
    pub const PRIORITY: [Technology; 4] = [
        Technology::Sriov,
        Technology::Dpdk,
        Technology::AfXdp,
        Technology::Xdp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Technology::Sriov => "sriov",
            Technology::Dpdk => "dpdk",
            Technology::AfXdp => "af_xdp",
            Technology::Xdp => "xdp",
            Technology::None => "none",
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Whether a technology can run here, and if not, why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccelerationCapability {
    pub technology: Technology,
    pub available: bool,
    pub reason: String,
    /// Expected throughput tier
    pub performance: String,
    /// Unmet prerequisites, empty when available
    pub prerequisites: Vec<String>,
}

impl AccelerationCapability {
    pub fn available(technology: Technology, reason: impl Into<String>, performance: &str) -> Self {
        Self {
            technology,
            available: true,
            reason: reason.into(),
            performance: performance.to_string(),
            prerequisites: Vec::new(),
        }
    }

    pub fn unavailable(
        technology: Technology,
        reason: impl Into<String>,
        performance: &str,
        prerequisites: Vec<String>,
    ) -> Self {
        Self {
            technology,
            available: false,
            reason: reason.into(),
            performance: performance.to_string(),
            prerequisites,
        }
    }
}

/// Snapshot produced by one detection pass. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub cpu: CpuFeatures,
    pub kernel: Option<KernelVersion>,
    pub iommu_enabled: bool,
    pub interfaces: Vec<NetworkInterface>,
    pub xdp: AccelerationCapability,
    pub af_xdp: AccelerationCapability,
    pub sriov: AccelerationCapability,
    pub dpdk: AccelerationCapability,
    /// NUMA locality; not an acceleration path on its own
    pub numa: AccelerationCapability,
    pub detected_at: DateTime<Utc>,
}

impl HardwareCapabilities {
    pub fn capability(&self, technology: Technology) -> Option<&AccelerationCapability> {
        match technology {
            Technology::Sriov => Some(&self.sriov),
            Technology::Dpdk => Some(&self.dpdk),
            Technology::AfXdp => Some(&self.af_xdp),
            Technology::Xdp => Some(&self.xdp),
            Technology::None => None,
        }
    }

    pub fn is_available(&self, technology: Technology) -> bool {
        self.capability(technology).map(|c| c.available).unwrap_or(false)
    }

    /// Highest-priority available technology, `Technology::None` if nothing is
    pub fn best_acceleration(&self) -> Technology {
        Technology::PRIORITY
            .into_iter()
            .find(|t| self.is_available(*t))
            .unwrap_or(Technology::None)
    }

    /// Available technologies in priority order
    pub fn available_technologies(&self) -> Vec<Technology> {
        Technology::PRIORITY
            .into_iter()
            .filter(|t| self.is_available(*t))
            .collect()
    }

    pub fn interface(&self, name: &str) -> Option<&NetworkInterface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Operator hints derived from the report
    pub fn recommendations(&self) -> Vec<String> {
        let mut hints = Vec::new();

        match self.best_acceleration() {
            Technology::None => hints.push(
                "No acceleration available; traffic will use the userspace proxy path".to_string(),
            ),
            best => hints.push(format!(
                "Use {} for best performance ({})",
                best,
                self.capability(best).map(|c| c.performance.as_str()).unwrap_or("")
            )),
        }

        let dpdk_driver = self.interfaces.iter().any(|i| i.has("dpdk"));
        if dpdk_driver && !self.cpu.hugepages_configured() {
            hints.push("Configure hugepages (vm.nr_hugepages) to enable DPDK".to_string());
        }

        if self.sriov.available && !self.iommu_enabled {
            hints.push("Enable IOMMU (intel_iommu=on or amd_iommu=on) before assigning VFs".to_string());
        }

        if self.cpu.avx512 {
            hints.push("AVX-512 detected; prefer builds with AVX-512 packet parsing".to_string());
        }

        if self.cpu.numa_nodes > 1 {
            hints.push(format!(
                "Pin packet workers to the NIC's NUMA node ({} nodes present)",
                self.cpu.numa_nodes
            ));
        }

        if self.xdp.available && !self.interfaces.iter().any(|i| i.has("xdp_native")) {
            hints.push("Only generic XDP is available; a native-XDP NIC driver will be faster".to_string());
        }

        hints
    }

    /// Human-readable capability report
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Hardware acceleration capabilities");
        let _ = writeln!(
            out,
            "  CPU: {} ({} CPUs, {} NUMA nodes, hugepages: {})",
            if self.cpu.model_name.is_empty() { "unknown" } else { self.cpu.model_name.as_str() },
            self.cpu.num_cpus,
            self.cpu.numa_nodes,
            self.cpu.hugepages_total
        );
        if let Some(kernel) = self.kernel {
            let _ = writeln!(out, "  Kernel: {}", kernel);
        }

        for technology in Technology::PRIORITY {
            if let Some(cap) = self.capability(technology) {
                let mark = if cap.available { "available" } else { "unavailable" };
                let _ = writeln!(out, "  {:<7} {:<11} {} [{}]", technology, mark, cap.reason, cap.performance);
                for prerequisite in &cap.prerequisites {
                    let _ = writeln!(out, "          needs: {}", prerequisite);
                }
            }
        }

        for iface in &self.interfaces {
            let _ = writeln!(
                out,
                "  {} ({}, {} queues, numa {}): {}",
                iface.name,
                iface.driver,
                iface.max_queues,
                iface.numa_node,
                iface.features.join(", ")
            );
        }

        let _ = writeln!(out, "  Best: {}", self.best_acceleration());
        out
    }
}
