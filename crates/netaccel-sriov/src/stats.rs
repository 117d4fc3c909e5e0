//! Aggregated SR-IOV statistics

use crate::model::PhysicalFunction;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// VFs with traffic inside this window count as active
pub(crate) const ACTIVITY_WINDOW_SECS: i64 = 300;

/// Snapshot of SR-IOV statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SriovStats {
    pub total_pfs: usize,
    pub total_vfs: usize,
    pub active_vfs: usize,
    pub assigned_vfs: usize,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub total_errors: u64,
    /// `total_errors / total_packets` across all VFs
    pub error_rate: f64,
    pub last_update: Option<DateTime<Utc>>,
}

impl SriovStats {
    pub fn total_packets(&self) -> u64 {
        self.rx_packets + self.tx_packets
    }

    pub(crate) fn aggregate<'a>(pfs: impl Iterator<Item = &'a PhysicalFunction>, now: DateTime<Utc>) -> Self {
        let mut stats = SriovStats {
            last_update: Some(now),
            ..Default::default()
        };
        let window = Duration::seconds(ACTIVITY_WINDOW_SECS);

        for pf in pfs {
            stats.total_pfs += 1;
            for vf in &pf.vf_list {
                stats.total_vfs += 1;
                stats.rx_packets += vf.statistics.rx_packets;
                stats.tx_packets += vf.statistics.tx_packets;
                stats.rx_bytes += vf.statistics.rx_bytes;
                stats.tx_bytes += vf.statistics.tx_bytes;
                stats.total_errors += vf.statistics.errors();

                if vf.assigned_service.is_some() {
                    stats.assigned_vfs += 1;
                }
                if vf.last_activity.map(|t| now - t <= window).unwrap_or(false) {
                    stats.active_vfs += 1;
                }
            }
        }

        let packets = stats.total_packets();
        if packets > 0 {
            stats.error_rate = stats.total_errors as f64 / packets as f64;
        }
        stats
    }
}
