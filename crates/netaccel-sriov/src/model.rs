//! Physical and virtual function model

use crate::config::QosConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// VF link state as exposed by `ip link ... vf N state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Auto,
    Enable,
    Disable,
}

/// Traffic counters of a VF (or of a PF netdev)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfStatistics {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub dropped: u64,
}

impl VfStatistics {
    pub fn packets(&self) -> u64 {
        self.rx_packets + self.tx_packets
    }

    pub fn errors(&self) -> u64 {
        self.rx_errors + self.tx_errors
    }
}

impl From<netaccel_common::InterfaceCounters> for VfStatistics {
    fn from(c: netaccel_common::InterfaceCounters) -> Self {
        Self {
            rx_packets: c.rx_packets,
            tx_packets: c.tx_packets,
            rx_bytes: c.rx_bytes,
            tx_bytes: c.tx_bytes,
            rx_errors: c.rx_errors,
            tx_errors: c.tx_errors,
            dropped: c.rx_dropped + c.tx_dropped,
        }
    }
}

/// A hardware-virtualized partition of a PF
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualFunction {
    pub pci_address: String,
    pub interface_name: Option<String>,
    /// PCI address of the owning PF
    pub parent_pf: String,
    pub vf_index: u32,
    pub mac_address: String,
    pub vlan_tag: Option<u16>,
    pub qos: QosConfig,
    pub trust_mode: bool,
    pub spoof_check: bool,
    pub link_state: LinkState,
    pub statistics: VfStatistics,
    pub assigned_service: Option<u64>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// An SR-IOV capable PCI network function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalFunction {
    pub pci_address: String,
    pub interface_name: Option<String>,
    pub driver: String,
    pub vendor_id: u16,
    pub device_id: u16,
    /// `sriov_totalvfs`
    pub max_vfs: u32,
    pub current_vfs: u32,
    pub vf_list: Vec<VirtualFunction>,
    pub supported_features: Vec<String>,
    pub statistics: VfStatistics,
}

impl PhysicalFunction {
    pub fn vf(&self, pci_address: &str) -> Option<&VirtualFunction> {
        self.vf_list.iter().find(|vf| vf.pci_address == pci_address)
    }

    pub(crate) fn vf_mut(&mut self, pci_address: &str) -> Option<&mut VirtualFunction> {
        self.vf_list.iter_mut().find(|vf| vf.pci_address == pci_address)
    }

    /// Matches a PCI address or interface name from configuration
    pub fn matches(&self, selector: &str) -> bool {
        self.pci_address == selector || self.interface_name.as_deref() == Some(selector)
    }
}

/// Locally administered unicast MAC unique per (PF, VF index).
///
/// Layout: `02:00:<bus>:<dev<<3|fn>:<index hi>:<index lo>`.
pub(crate) fn derive_vf_mac(pf_address: &str, vf_index: u32) -> String {
    let (bus, devfn) = parse_bdf(pf_address).unwrap_or((0, 0));
    format!(
        "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
        bus,
        devfn,
        (vf_index >> 8) & 0xff,
        vf_index & 0xff
    )
}

/// `(bus, dev<<3 | fn)` of `dddd:bb:dd.f`
fn parse_bdf(address: &str) -> Option<(u8, u8)> {
    let mut parts = address.rsplitn(3, ':');
    let dev_fn = parts.next()?;
    let bus = parts.next()?;
    let (dev, func) = dev_fn.split_once('.')?;

    let bus = u8::from_str_radix(bus, 16).ok()?;
    let dev = u8::from_str_radix(dev, 16).ok()?;
    let func = u8::from_str_radix(func, 16).ok()?;
    Some((bus, (dev << 3) | (func & 0x7)))
}
