//! Driver support tables

/// Drivers with native (driver-mode) XDP
pub const NATIVE_XDP_DRIVERS: &[&str] = &[
    "i40e",
    "ice",
    "ixgbe",
    "mlx4_en",
    "mlx5_core",
    "nfp",
    "qede",
    "bnxt_en",
    "thunderx_nicvf",
    "virtio_net",
    "tun",
    "veth",
];

/// Drivers a DPDK poll-mode driver can bind to
pub const DPDK_DRIVERS: &[&str] = &[
    "igb_uio",
    "vfio-pci",
    "uio_pci_generic",
    "i40e",
    "ixgbe",
    "e1000",
    "e1000e",
    "mlx4_core",
    "mlx5_core",
    "bnxt_en",
    "virtio-pci",
    "vmxnet3",
];

/// ethtool feature names recorded per interface
pub const OFFLOAD_FEATURES: &[&str] = &[
    "rx-checksumming",
    "tx-checksumming",
    "scatter-gather",
    "tcp-segmentation-offload",
    "generic-segmentation-offload",
    "generic-receive-offload",
    "large-receive-offload",
    "rx-vlan-offload",
    "tx-vlan-offload",
];

pub fn supports_native_xdp(driver: &str) -> bool {
    NATIVE_XDP_DRIVERS.contains(&driver)
}

pub fn supports_dpdk(driver: &str) -> bool {
    DPDK_DRIVERS.contains(&driver)
}
