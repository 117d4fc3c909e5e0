//! Hardware detector

use crate::capability::{AccelerationCapability, HardwareCapabilities, Technology};
use crate::cpu::{CpuFeatures, KernelVersion};
use crate::interface::NetworkInterface;
use crate::{DetectError, Result};
use arc_swap::ArcSwapOption;
use netaccel_common::{cmdline_iommu_enabled, HostProbe};
use std::sync::Arc;
use tracing::{info, warn};

const XDP_PERFORMANCE: &str = "10-100 Gbps";
const AF_XDP_PERFORMANCE: &str = "20-40 Gbps with zero-copy";
const DPDK_PERFORMANCE: &str = "100+ Gbps with dedicated cores";
const SRIOV_PERFORMANCE: &str = "Near line-rate per VF";
const NUMA_PERFORMANCE: &str = "Lower memory latency with local placement";

const XDP_MIN_KERNEL: KernelVersion = KernelVersion::new(4, 8);
const AF_XDP_MIN_KERNEL: KernelVersion = KernelVersion::new(4, 18);

/// Produces [`HardwareCapabilities`] snapshots.
///
/// Every call to [`detect`](Self::detect) builds a new snapshot from scratch
/// and swaps it in as the latest one; earlier snapshots held by callers are
/// never touched.
pub struct HardwareDetector {
    host: Arc<dyn HostProbe>,
    latest: ArcSwapOption<HardwareCapabilities>,
}

impl HardwareDetector {
    pub fn new(host: Arc<dyn HostProbe>) -> Self {
        Self {
            host,
            latest: ArcSwapOption::empty(),
        }
    }

    /// Scan the host.
    ///
    /// Only a failure to list network interfaces is an error; every other
    /// unreadable source degrades the affected capability.
    pub fn detect(&self) -> Result<Arc<HardwareCapabilities>> {
        let cpu = self.detect_cpu();

        let kernel = match self.host.read_kernel_version() {
            Ok(raw) => KernelVersion::parse(&raw),
            Err(e) => {
                warn!(error = %e, "kernel version unreadable");
                None
            }
        };

        let iommu_enabled = self
            .host
            .read_cmdline()
            .map(|c| cmdline_iommu_enabled(&c))
            .unwrap_or(false);

        let names = self
            .host
            .list_network_interfaces()
            .map_err(DetectError::InterfaceScan)?;

        let zero_copy_kernel = kernel.map(|k| k >= AF_XDP_MIN_KERNEL).unwrap_or(false);
        let interfaces: Vec<NetworkInterface> = names
            .iter()
            .filter(|name| name.as_str() != "lo")
            .map(|name| NetworkInterface::probe(self.host.as_ref(), name, zero_copy_kernel))
            .collect();

        let xdp = evaluate_xdp(&interfaces, kernel);
        let af_xdp = evaluate_af_xdp(&interfaces, &xdp, kernel);
        let dpdk = evaluate_dpdk(&interfaces, &cpu);
        let sriov = evaluate_sriov(&interfaces);
        let numa = evaluate_numa(&cpu);

        let caps = Arc::new(HardwareCapabilities {
            cpu,
            kernel,
            iommu_enabled,
            interfaces,
            xdp,
            af_xdp,
            sriov,
            dpdk,
            numa,
            detected_at: chrono::Utc::now(),
        });

        info!(
            interfaces = caps.interfaces.len(),
            available = ?caps.available_technologies(),
            best = %caps.best_acceleration(),
            "hardware detection complete"
        );

        self.latest.store(Some(caps.clone()));
        Ok(caps)
    }

    /// Snapshot from the most recent successful detection
    pub fn latest(&self) -> Option<Arc<HardwareCapabilities>> {
        self.latest.load_full()
    }

    /// Best technology of the latest snapshot, `Technology::None` before any detection
    pub fn get_best_acceleration(&self) -> Technology {
        self.latest
            .load()
            .as_ref()
            .map(|caps| caps.best_acceleration())
            .unwrap_or(Technology::None)
    }

    fn detect_cpu(&self) -> CpuFeatures {
        let mut cpu = CpuFeatures::default();

        match self.host.read_cpuinfo() {
            Ok(cpuinfo) => cpu.apply_cpuinfo(&cpuinfo),
            Err(e) => warn!(error = %e, "cpuinfo unreadable"),
        }
        match self.host.read_meminfo() {
            Ok(meminfo) => cpu.apply_meminfo(&meminfo),
            Err(e) => warn!(error = %e, "meminfo unreadable, assuming no hugepages"),
        }

        cpu.numa_nodes = self.host.list_numa_nodes().len().max(1);
        cpu
    }
}

fn names_with<'a>(interfaces: &'a [NetworkInterface], capability: &str) -> Vec<&'a str> {
    interfaces
        .iter()
        .filter(|i| i.has(capability))
        .map(|i| i.name.as_str())
        .collect()
}

fn kernel_gate(kernel: Option<KernelVersion>, min: KernelVersion) -> Option<String> {
    match kernel {
        None => Some("kernel version could not be determined".to_string()),
        Some(k) if k < min => Some(format!("kernel {} is older than {}", k, min)),
        Some(_) => None,
    }
}

fn evaluate_xdp(interfaces: &[NetworkInterface], kernel: Option<KernelVersion>) -> AccelerationCapability {
    let mut prerequisites = Vec::new();
    let mut reasons = Vec::new();

    if interfaces.is_empty() {
        reasons.push("no network interfaces found".to_string());
        prerequisites.push("XDP-capable network driver".to_string());
    }
    if let Some(reason) = kernel_gate(kernel, XDP_MIN_KERNEL) {
        reasons.push(reason);
        prerequisites.push("Linux kernel 4.8+".to_string());
    }

    if !prerequisites.is_empty() {
        return AccelerationCapability::unavailable(
            Technology::Xdp,
            reasons.join("; "),
            XDP_PERFORMANCE,
            prerequisites,
        );
    }

    let native = names_with(interfaces, "xdp_native");
    let reason = if native.is_empty() {
        "generic XDP only (no native driver support)".to_string()
    } else {
        format!("native XDP on {}", native.join(", "))
    };
    AccelerationCapability::available(Technology::Xdp, reason, XDP_PERFORMANCE)
}

fn evaluate_af_xdp(
    interfaces: &[NetworkInterface],
    xdp: &AccelerationCapability,
    kernel: Option<KernelVersion>,
) -> AccelerationCapability {
    let mut prerequisites = Vec::new();
    let mut reasons = Vec::new();

    if !xdp.available {
        reasons.push("requires XDP".to_string());
        prerequisites.extend(
            xdp.prerequisites
                .iter()
                .filter(|p| !p.starts_with("Linux kernel"))
                .cloned(),
        );
    }
    if let Some(reason) = kernel_gate(kernel, AF_XDP_MIN_KERNEL) {
        reasons.push(reason);
        prerequisites.push("Linux kernel 4.18+".to_string());
    }

    if !prerequisites.is_empty() {
        return AccelerationCapability::unavailable(
            Technology::AfXdp,
            reasons.join("; "),
            AF_XDP_PERFORMANCE,
            prerequisites,
        );
    }

    let native = names_with(interfaces, "xdp_native");
    let reason = if native.is_empty() {
        "copy mode only (no zero-copy driver)".to_string()
    } else {
        format!("zero-copy on {}", native.join(", "))
    };
    AccelerationCapability::available(Technology::AfXdp, reason, AF_XDP_PERFORMANCE)
}

fn evaluate_dpdk(interfaces: &[NetworkInterface], cpu: &CpuFeatures) -> AccelerationCapability {
    let drivers = names_with(interfaces, "dpdk");
    let mut prerequisites = Vec::new();
    let mut reasons = Vec::new();

    if drivers.is_empty() {
        reasons.push("no DPDK-compatible NIC driver".to_string());
        prerequisites.push("DPDK-compatible NIC".to_string());
    }
    if !cpu.hugepages_configured() {
        reasons.push("hugepages not configured".to_string());
        prerequisites.push("Hugepages configured".to_string());
    }

    if prerequisites.is_empty() {
        AccelerationCapability::available(
            Technology::Dpdk,
            format!(
                "compatible driver on {} with {} hugepages",
                drivers.join(", "),
                cpu.hugepages_total
            ),
            DPDK_PERFORMANCE,
        )
    } else {
        prerequisites.push("IOMMU/VFIO support".to_string());
        prerequisites.push("Dedicated CPU cores".to_string());
        AccelerationCapability::unavailable(Technology::Dpdk, reasons.join("; "), DPDK_PERFORMANCE, prerequisites)
    }
}

fn evaluate_sriov(interfaces: &[NetworkInterface]) -> AccelerationCapability {
    let capable: Vec<String> = interfaces
        .iter()
        .filter(|i| i.sriov_total_vfs > 0)
        .map(|i| format!("{} ({} VFs)", i.name, i.sriov_total_vfs))
        .collect();

    if capable.is_empty() {
        AccelerationCapability::unavailable(
            Technology::Sriov,
            "no SR-IOV capable NIC",
            SRIOV_PERFORMANCE,
            vec![
                "SR-IOV capable NIC".to_string(),
                "IOMMU enabled".to_string(),
                "VT-d/AMD-Vi support".to_string(),
            ],
        )
    } else {
        AccelerationCapability::available(
            Technology::Sriov,
            format!("SR-IOV on {}", capable.join(", ")),
            SRIOV_PERFORMANCE,
        )
    }
}

fn evaluate_numa(cpu: &CpuFeatures) -> AccelerationCapability {
    if cpu.numa_nodes > 1 {
        AccelerationCapability::available(
            Technology::None,
            format!("{} NUMA nodes", cpu.numa_nodes),
            NUMA_PERFORMANCE,
        )
    } else {
        AccelerationCapability::unavailable(
            Technology::None,
            "single NUMA node",
            NUMA_PERFORMANCE,
            vec!["Multi-socket system".to_string()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netaccel_common::testing::{FakeHost, FakeInterface};

    fn base_host(kernel: &str) -> FakeHost {
        FakeHost::new()
            .with_cpu_layout(1, 4, 1)
            .with_meminfo("HugePages_Total:       0\nHugepagesize:       2048 kB\n")
            .with_kernel_version(kernel)
            .with_cmdline("ro quiet")
    }

    #[test]
    fn test_native_xdp_and_zero_copy() {
        let host = base_host("Linux version 5.15.0-91-generic")
            .with_interface("eth0", FakeInterface::new("i40e").pci("0000:03:00.0").queues(8).numa(0));
        let detector = HardwareDetector::new(Arc::new(host));

        let caps = detector.detect().unwrap();
        assert!(caps.xdp.available);
        assert!(caps.af_xdp.available);
        assert!(caps.af_xdp.reason.contains("eth0"));
        assert!(!caps.sriov.available);
        assert_eq!(caps.best_acceleration(), Technology::AfXdp);
        assert_eq!(detector.get_best_acceleration(), Technology::AfXdp);

        let eth0 = caps.interface("eth0").unwrap();
        assert_eq!(eth0.max_queues, 8);
        assert!(eth0.has("xdp_native"));
        assert!(caps.interface("lo").is_none());
    }

    #[test]
    fn test_old_kernel_blocks_zero_copy() {
        let host = base_host("Linux version 4.15.0-20-generic")
            .with_interface("eth0", FakeInterface::new("ixgbe"));
        let caps = HardwareDetector::new(Arc::new(host)).detect().unwrap();

        assert!(caps.xdp.available);
        assert!(!caps.af_xdp.available);
        assert!(caps.af_xdp.reason.contains("older than 4.18"));
        assert_eq!(caps.af_xdp.prerequisites, vec!["Linux kernel 4.18+".to_string()]);
        assert_eq!(caps.best_acceleration(), Technology::Xdp);
    }

    #[test]
    fn test_generic_only_driver() {
        let host = base_host("Linux version 6.1.0")
            .with_interface("enp1s0", FakeInterface::new("r8169"));
        let caps = HardwareDetector::new(Arc::new(host)).detect().unwrap();

        assert!(caps.xdp.available);
        assert!(caps.xdp.reason.starts_with("generic XDP only"));
        assert!(caps.recommendations().iter().any(|r| r.contains("native-XDP")));
    }

    #[test]
    fn test_dpdk_needs_hugepages() {
        let host = base_host("Linux version 5.4.0")
            .with_interface("eth0", FakeInterface::new("mlx5_core"));
        let caps = HardwareDetector::new(Arc::new(host)).detect().unwrap();

        assert!(!caps.dpdk.available);
        assert!(caps.dpdk.prerequisites.contains(&"Hugepages configured".to_string()));
        assert!(caps.recommendations().iter().any(|r| r.contains("hugepages")));

        let host = base_host("Linux version 5.4.0")
            .with_meminfo("HugePages_Total:    512\nHugepagesize:       2048 kB\n")
            .with_interface("eth0", FakeInterface::new("mlx5_core"));
        let caps = HardwareDetector::new(Arc::new(host)).detect().unwrap();
        assert!(caps.dpdk.available);
        assert_eq!(caps.best_acceleration(), Technology::Dpdk);
    }

    #[test]
    fn test_sriov_detected_from_pf() {
        let host = base_host("Linux version 5.15.0")
            .with_sriov_pf("0000:03:00.0", "i40e", "eth0", 64)
            .with_cmdline("intel_iommu=on");
        let caps = HardwareDetector::new(Arc::new(host)).detect().unwrap();

        assert!(caps.sriov.available);
        assert!(caps.iommu_enabled);
        assert_eq!(caps.best_acceleration(), Technology::Sriov);
        assert_eq!(caps.interface("eth0").unwrap().sriov_total_vfs, 64);
    }

    #[test]
    fn test_missing_sources_degrade() {
        // No cpuinfo, meminfo or kernel version
        let host = FakeHost::new().with_interface("eth0", FakeInterface::new("i40e"));
        let caps = HardwareDetector::new(Arc::new(host)).detect().unwrap();

        assert_eq!(caps.cpu.num_cpus, 0);
        assert!(caps.kernel.is_none());
        assert!(!caps.xdp.available);
        assert!(caps.xdp.reason.contains("could not be determined"));
        assert!(!caps.af_xdp.available);
        assert_eq!(caps.best_acceleration(), Technology::None);
    }

    #[test]
    fn test_no_interfaces() {
        let host = base_host("Linux version 5.15.0");
        let caps = HardwareDetector::new(Arc::new(host)).detect().unwrap();

        assert!(caps.interfaces.is_empty());
        assert!(!caps.xdp.available);
        assert!(caps.xdp.reason.contains("no network interfaces"));
        assert!(caps.af_xdp.prerequisites.contains(&"XDP-capable network driver".to_string()));
    }

    #[test]
    fn test_interface_scan_failure_is_error() {
        let host = base_host("Linux version 5.15.0").fail_interface_scan();
        let detector = HardwareDetector::new(Arc::new(host));

        assert!(matches!(detector.detect(), Err(DetectError::InterfaceScan(_))));
        assert!(detector.latest().is_none());
        assert_eq!(detector.get_best_acceleration(), Technology::None);
    }

    #[test]
    fn test_each_detect_is_fresh_snapshot() {
        let host = base_host("Linux version 5.15.0").with_interface("eth0", FakeInterface::new("veth"));
        let detector = HardwareDetector::new(Arc::new(host));

        let first = detector.detect().unwrap();
        let second = detector.detect().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &detector.latest().unwrap()));
        assert_eq!(first.xdp, second.xdp);
    }

    #[test]
    fn test_numa_nodes() {
        let host = FakeHost::new()
            .with_cpu_layout(2, 4, 1)
            .with_kernel_version("Linux version 5.15.0")
            .with_interface("eth0", FakeInterface::new("ice").numa(1));
        let caps = HardwareDetector::new(Arc::new(host)).detect().unwrap();

        assert_eq!(caps.cpu.num_cpus, 8);
        assert_eq!(caps.cpu.numa_nodes, 2);
        assert!(caps.numa.available);
        assert_eq!(caps.interface("eth0").unwrap().numa_node, 1);
    }
}
