//! Aggregated acceleration statistics

use crate::config::Accelerator;
use chrono::{DateTime, Utc};
use netaccel_cpu::AffinityStats;
use netaccel_sriov::SriovStats;
use netaccel_xdp::{BridgeStats, XdpStats, ZeroCopyStats};
use serde::{Deserialize, Serialize};

/// Snapshot of every active technology.
///
/// A technology that is not active has `None` for its section and
/// contributes nothing to the totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccelerationStats {
    pub active: Vec<Accelerator>,
    /// Packets seen by the XDP program
    pub xdp_packets: u64,
    /// Frames received on AF_XDP sockets
    pub zero_copy_packets: u64,
    /// Frames handed to the packet processor
    pub slow_path_packets: u64,
    /// RX + TX across all VFs
    pub sriov_packets: u64,
    /// XDP packets plus VF traffic. AF_XDP frames count only when XDP is
    /// not active, since otherwise the XDP program already saw them.
    pub total_packets: u64,
    /// Growth of `total_packets` since the previous snapshot
    pub packets_per_second: f64,
    pub xdp: Option<XdpStats>,
    pub zero_copy: Option<ZeroCopyStats>,
    pub bridge: Option<BridgeStats>,
    pub sriov: Option<SriovStats>,
    pub cpu: Option<AffinityStats>,
    pub last_update: Option<DateTime<Utc>>,
}

impl AccelerationStats {
    pub(crate) fn recompute_totals(&mut self) {
        self.xdp_packets = self.xdp.as_ref().map(|s| s.total_packets).unwrap_or(0);
        self.zero_copy_packets = self.zero_copy.as_ref().map(|s| s.rx_packets).unwrap_or(0);
        self.slow_path_packets = self.bridge.as_ref().map(|s| s.slow_path_packets).unwrap_or(0);
        self.sriov_packets = self.sriov.as_ref().map(|s| s.total_packets()).unwrap_or(0);
        let kernel_path = match self.xdp {
            Some(_) => self.xdp_packets,
            None => self.zero_copy_packets,
        };
        self.total_packets = kernel_path + self.sriov_packets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_skip_inactive_sections() {
        let mut stats = AccelerationStats {
            xdp: Some(XdpStats {
                total_packets: 1000,
                ..Default::default()
            }),
            bridge: Some(BridgeStats {
                slow_path_packets: 40,
                ..Default::default()
            }),
            zero_copy: Some(ZeroCopyStats {
                rx_packets: 42,
                ..Default::default()
            }),
            ..Default::default()
        };
        stats.recompute_totals();

        assert_eq!(stats.xdp_packets, 1000);
        assert_eq!(stats.zero_copy_packets, 42);
        assert_eq!(stats.sriov_packets, 0);
        assert_eq!(stats.slow_path_packets, 40);
        assert_eq!(stats.total_packets, 1000);
    }

    #[test]
    fn test_zero_copy_counts_without_fast_path() {
        let mut stats = AccelerationStats {
            zero_copy: Some(ZeroCopyStats {
                rx_packets: 42,
                ..Default::default()
            }),
            sriov: Some(SriovStats::default()),
            ..Default::default()
        };
        stats.recompute_totals();

        assert_eq!(stats.xdp_packets, 0);
        assert_eq!(stats.zero_copy_packets, 42);
        assert_eq!(stats.total_packets, 42);
    }
}
