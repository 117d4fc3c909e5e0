//! SR-IOV configuration

use netaccel_common::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bandwidth shaping for one VF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    pub min_bandwidth_mbps: u32,
    pub max_bandwidth_mbps: u32,
    /// 802.1p priority carried with the VLAN tag
    pub priority: u8,
    pub weight: u32,
    pub rate_limit_enabled: bool,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            min_bandwidth_mbps: 100,
            max_bandwidth_mbps: 1000,
            priority: 0,
            weight: 1,
            rate_limit_enabled: true,
        }
    }
}

/// SR-IOV manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SriovConfig {
    pub enabled: bool,
    /// VF budget per PF; the PF's own maximum still applies
    pub max_vfs_per_pf: u32,
    /// PCI addresses or interface names to configure; empty means all
    pub enabled_pfs: Vec<String>,
    pub default_qos: QosConfig,
    pub spoof_check: bool,
    pub trust_mode: bool,
    #[serde(with = "duration_ms")]
    pub stats_interval: Duration,
    /// Wait after writing `sriov_numvfs` for VF devices to appear
    #[serde(with = "duration_ms")]
    pub vf_settle_delay: Duration,
}

impl Default for SriovConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_vfs_per_pf: 8,
            enabled_pfs: Vec::new(),
            default_qos: QosConfig::default(),
            spoof_check: true,
            trust_mode: false,
            stats_interval: Duration::from_secs(5),
            vf_settle_delay: Duration::from_secs(2),
        }
    }
}

/// Partial VF update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfConfig {
    pub mac_address: Option<String>,
    pub vlan_tag: Option<u16>,
    pub qos: Option<QosConfig>,
    pub trust_mode: Option<bool>,
    pub spoof_check: Option<bool>,
}

impl VfConfig {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if let Some(mac) = &self.mac_address {
            if !is_valid_mac(mac) {
                return Err(crate::SriovError::InvalidConfig(format!("malformed MAC address {}", mac)));
            }
        }
        if let Some(vlan) = self.vlan_tag {
            if vlan > 4094 {
                return Err(crate::SriovError::InvalidConfig(format!("VLAN {} out of range 0-4094", vlan)));
            }
        }
        if let Some(qos) = &self.qos {
            if qos.priority > 7 {
                return Err(crate::SriovError::InvalidConfig(format!("priority {} out of range 0-7", qos.priority)));
            }
            if qos.max_bandwidth_mbps != 0 && qos.min_bandwidth_mbps > qos.max_bandwidth_mbps {
                return Err(crate::SriovError::InvalidConfig(
                    "minimum bandwidth exceeds maximum".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}
