//! Per-interface capability probing

use crate::drivers::{supports_dpdk, supports_native_xdp, OFFLOAD_FEATURES};
use netaccel_common::HostProbe;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A network interface and what it can accelerate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub driver: String,
    pub pci_address: Option<String>,
    /// `-1` when the device reports no NUMA affinity
    pub numa_node: i32,
    pub max_queues: usize,
    /// `xdp`, `xdp_native`, `af_xdp`, `dpdk`, `sriov` plus offload names
    pub capabilities: BTreeMap<String, bool>,
    /// Human-readable notes
    pub features: Vec<String>,
    pub sriov_total_vfs: u32,
}

impl NetworkInterface {
    pub fn has(&self, capability: &str) -> bool {
        self.capabilities.get(capability).copied().unwrap_or(false)
    }

    /// Probe one interface. `zero_copy_kernel` is whether the kernel supports AF_XDP.
    pub(crate) fn probe(host: &dyn HostProbe, name: &str, zero_copy_kernel: bool) -> Self {
        let driver = host.interface_driver(name).unwrap_or_else(|| "unknown".to_string());
        let pci_address = host.interface_pci_address(name);
        let numa_node = host.interface_numa_node(name).unwrap_or(-1);
        let max_queues = host.interface_queue_count(name).max(1);

        let mut capabilities = BTreeMap::new();
        let mut features = Vec::new();

        // Generic XDP works on any netdev
        let native = supports_native_xdp(&driver);
        capabilities.insert("xdp".to_string(), true);
        capabilities.insert("xdp_native".to_string(), native);
        if native {
            features.push("XDP native mode".to_string());
        } else {
            features.push("XDP generic mode only".to_string());
        }

        capabilities.insert("af_xdp".to_string(), zero_copy_kernel);
        if zero_copy_kernel {
            if native {
                features.push("AF_XDP zero-copy".to_string());
            } else {
                features.push("AF_XDP copy mode".to_string());
            }
        }

        let dpdk = supports_dpdk(&driver);
        capabilities.insert("dpdk".to_string(), dpdk);
        if dpdk {
            features.push("DPDK compatible driver".to_string());
        }

        let sriov_total_vfs = pci_address
            .as_deref()
            .and_then(|addr| host.read_sriov_capability(addr))
            .map(|cap| cap.total_vfs)
            .unwrap_or(0);
        capabilities.insert("sriov".to_string(), sriov_total_vfs > 0);
        if sriov_total_vfs > 0 {
            features.push(format!("SR-IOV ({} VFs)", sriov_total_vfs));
        }

        for &offload in OFFLOAD_FEATURES {
            let on = host.interface_feature(name, offload).unwrap_or(false);
            capabilities.insert(offload.to_string(), on);
            if on {
                features.push(format!("offload: {}", offload));
            }
        }

        tracing::debug!(
            interface = name,
            driver = %driver,
            queues = max_queues,
            numa_node = numa_node,
            "probed interface"
        );

        Self {
            name: name.to_string(),
            driver,
            pci_address,
            numa_node,
            max_queues,
            capabilities,
            features,
            sriov_total_vfs,
        }
    }
}
