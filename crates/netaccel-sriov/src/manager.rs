//! SR-IOV manager

use crate::config::{SriovConfig, VfConfig};
use crate::model::{derive_vf_mac, LinkState, PhysicalFunction, VfStatistics, VirtualFunction};
use crate::stats::SriovStats;
use crate::{Result, SriovError};
use chrono::Utc;
use netaccel_common::{cmdline_iommu_enabled, Collector, HostProbe, MutationReport, VfAttributes};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// PCI attribute files mapped to the feature they advertise
const PF_FEATURE_FILES: &[(&str, &str)] = &[
    ("sriov_vf_device", "vf_device_id"),
    ("sriov_drivers_autoprobe", "drivers_autoprobe"),
    ("sriov_vf_total_msix", "msix_distribution"),
    ("sriov_offset", "routing_offset"),
];

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SriovPhase {
    Disabled,
    Uninitialized,
    Discovering,
    Initialized,
}

struct SriovState {
    phase: SriovPhase,
    pfs: BTreeMap<String, PhysicalFunction>,
    stats: SriovStats,
}

/// Owns every PF/VF it enables and releases them on [`stop`](Self::stop).
pub struct SriovManager {
    config: SriovConfig,
    host: Arc<dyn HostProbe>,
    state: Arc<RwLock<SriovState>>,
    /// Serializes hardware mutations that span an await
    mutation: tokio::sync::Mutex<()>,
    collector: tokio::sync::Mutex<Option<Collector>>,
}

impl SriovManager {
    pub fn new(config: SriovConfig, host: Arc<dyn HostProbe>) -> Self {
        let phase = if config.enabled {
            SriovPhase::Uninitialized
        } else {
            SriovPhase::Disabled
        };

        Self {
            config,
            host,
            state: Arc::new(RwLock::new(SriovState {
                phase,
                pfs: BTreeMap::new(),
                stats: SriovStats::default(),
            })),
            mutation: tokio::sync::Mutex::new(()),
            collector: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SriovConfig {
        &self.config
    }

    pub fn phase(&self) -> SriovPhase {
        self.state.read().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == SriovPhase::Initialized
    }

    /// Discover PFs, enable VFs on the selected ones and start the collector.
    ///
    /// PFs that fail to configure are reported in the returned report; the
    /// manager still reaches `Initialized`.
    pub async fn initialize(&self) -> Result<MutationReport> {
        {
            let mut state = self.state.write();
            match state.phase {
                SriovPhase::Disabled => return Err(SriovError::Disabled),
                SriovPhase::Discovering | SriovPhase::Initialized => {
                    return Err(SriovError::AlreadyInitialized)
                }
                SriovPhase::Uninitialized => state.phase = SriovPhase::Discovering,
            }
        }

        self.check_iommu();

        let pfs = match self.discover_pfs() {
            Ok(pfs) => pfs,
            Err(e) => {
                self.state.write().phase = SriovPhase::Uninitialized;
                return Err(e);
            }
        };

        let targets: Vec<String> = pfs
            .values()
            .filter(|pf| {
                self.config.enabled_pfs.is_empty()
                    || self.config.enabled_pfs.iter().any(|s| pf.matches(s))
            })
            .map(|pf| pf.pci_address.clone())
            .collect();

        info!(pfs = pfs.len(), selected = targets.len(), "discovered SR-IOV physical functions");
        self.state.write().pfs = pfs;

        let mut report = MutationReport::new();
        for addr in &targets {
            match self.configure_pf(addr).await {
                Ok(pf_report) => report.merge(pf_report),
                Err(e) => {
                    warn!(pf = %addr, error = %e, "failed to configure physical function");
                    report.record_failure(addr.clone(), e);
                }
            }
        }

        {
            let mut state = self.state.write();
            state.phase = SriovPhase::Initialized;
            let stats = SriovStats::aggregate(state.pfs.values(), Utc::now());
            state.stats = stats;
        }

        self.start_collector().await;

        info!(
            vfs = self.state.read().stats.total_vfs,
            outcome = ?report.outcome(),
            "SR-IOV manager initialized"
        );
        Ok(report)
    }

    fn check_iommu(&self) {
        match self.host.read_cmdline() {
            Ok(cmdline) if cmdline_iommu_enabled(&cmdline) => debug!("IOMMU enabled on kernel command line"),
            Ok(_) => warn!("IOMMU not enabled on kernel command line; VF passthrough may not be isolated"),
            Err(e) => warn!(error = %e, "could not read kernel command line for IOMMU check"),
        }
    }

    fn discover_pfs(&self) -> Result<BTreeMap<String, PhysicalFunction>> {
        let devices = self.host.list_pci_devices().map_err(|e| SriovError::Discovery {
            path: "/sys/bus/pci/devices".to_string(),
            source: e,
        })?;

        let mut pfs = BTreeMap::new();
        for addr in devices {
            let Some(cap) = self.host.read_sriov_capability(&addr) else {
                continue;
            };
            if cap.total_vfs == 0 {
                continue;
            }

            let (vendor_id, device_id) = self.host.pci_ids(&addr).unwrap_or((0, 0));
            let supported_features = PF_FEATURE_FILES
                .iter()
                .filter(|(file, _)| self.host.pci_has_attribute(&addr, file))
                .map(|(_, feature)| feature.to_string())
                .collect();

            let mut pf = PhysicalFunction {
                pci_address: addr.clone(),
                interface_name: self.host.pci_net_interface(&addr),
                driver: self.host.pci_driver(&addr).unwrap_or_else(|| "unknown".to_string()),
                vendor_id,
                device_id,
                max_vfs: cap.total_vfs,
                current_vfs: 0,
                vf_list: Vec::new(),
                supported_features,
                statistics: VfStatistics::default(),
            };

            pf.vf_list = self.discover_vfs(&pf);
            pf.current_vfs = pf.vf_list.len() as u32;
            if pf.current_vfs != cap.num_vfs {
                warn!(
                    pf = %addr,
                    numvfs = cap.num_vfs,
                    found = pf.current_vfs,
                    "sriov_numvfs disagrees with virtfn links"
                );
            }

            debug!(pf = %addr, driver = %pf.driver, max_vfs = pf.max_vfs, vfs = pf.current_vfs, "found physical function");
            pfs.insert(addr, pf);
        }

        Ok(pfs)
    }

    /// Build the VF table of `pf` from its `virtfnN` links.
    ///
    /// Runtime VF settings cannot be read back reliably, so each VF starts
    /// from the configured defaults and a derived MAC.
    fn discover_vfs(&self, pf: &PhysicalFunction) -> Vec<VirtualFunction> {
        self.host
            .list_virtfns(&pf.pci_address)
            .into_iter()
            .take(pf.max_vfs as usize)
            .map(|(index, addr)| VirtualFunction {
                interface_name: self.host.pci_net_interface(&addr),
                pci_address: addr,
                parent_pf: pf.pci_address.clone(),
                vf_index: index,
                mac_address: derive_vf_mac(&pf.pci_address, index),
                vlan_tag: None,
                qos: self.config.default_qos,
                trust_mode: self.config.trust_mode,
                spoof_check: self.config.spoof_check,
                link_state: LinkState::Auto,
                statistics: VfStatistics::default(),
                assigned_service: None,
                last_activity: None,
            })
            .collect()
    }

    /// Enable the configured VF budget on a PF that has no VFs yet
    pub async fn configure_pf(&self, pci_address: &str) -> Result<MutationReport> {
        let (current, max) = {
            let state = self.state.read();
            let pf = state
                .pfs
                .get(pci_address)
                .ok_or_else(|| SriovError::PfNotFound(pci_address.to_string()))?;
            (pf.current_vfs, pf.max_vfs)
        };

        if current > 0 {
            debug!(pf = %pci_address, vfs = current, "VFs already present, leaving as is");
            return Ok(MutationReport::new());
        }
        if self.config.max_vfs_per_pf == 0 {
            return Ok(MutationReport::new());
        }

        self.enable_vfs(pci_address, max.min(self.config.max_vfs_per_pf)).await
    }

    /// Set the PF's VF count to `count`.
    ///
    /// The count is zeroed first, then set, then the VF table is rebuilt from
    /// what the kernel actually materialized. Default attributes that fail to
    /// apply make the report partial.
    pub async fn enable_vfs(&self, pci_address: &str, count: u32) -> Result<MutationReport> {
        let _guard = self.mutation.lock().await;

        let max = {
            let state = self.state.read();
            let pf = state
                .pfs
                .get(pci_address)
                .ok_or_else(|| SriovError::PfNotFound(pci_address.to_string()))?;
            pf.max_vfs
        };
        if count > max {
            return Err(SriovError::TooManyVfs {
                pf: pci_address.to_string(),
                requested: count,
                max,
            });
        }

        let write_target = format!("{}/sriov_numvfs", pci_address);
        let addr = pci_address.to_string();
        blocking(&self.host, move |host| host.write_sriov_num_vfs(&addr, 0))
            .await
            .map_err(|e| SriovError::HardwareWrite {
                target: write_target.clone(),
                source: e,
            })?;
        self.reset_vf_table(pci_address);

        if count == 0 {
            info!(pf = %pci_address, "disabled virtual functions");
            return Ok(MutationReport::applied(write_target));
        }

        let addr = pci_address.to_string();
        blocking(&self.host, move |host| host.write_sriov_num_vfs(&addr, count))
            .await
            .map_err(|e| SriovError::HardwareWrite {
                target: write_target.clone(),
                source: e,
            })?;

        if !self.config.vf_settle_delay.is_zero() {
            tokio::time::sleep(self.config.vf_settle_delay).await;
        }

        let mut report = MutationReport::applied(write_target);

        let (pf_iface, vfs) = {
            let state = self.state.read();
            let pf = state
                .pfs
                .get(pci_address)
                .ok_or_else(|| SriovError::PfNotFound(pci_address.to_string()))?;
            (pf.interface_name.clone(), self.discover_vfs(pf))
        };

        if vfs.len() as u32 != count {
            warn!(pf = %pci_address, requested = count, found = vfs.len(), "kernel materialized a different VF count");
        }

        if let Some(iface) = &pf_iface {
            for vf in &vfs {
                let attrs = self.default_attributes(vf);
                let target = format!("{}/defaults", vf.pci_address);
                let (iface, index) = (iface.clone(), vf.vf_index);
                match blocking(&self.host, move |host| host.set_vf_attributes(&iface, index, &attrs)).await {
                    Ok(()) => report.record_applied(target),
                    Err(e) => {
                        warn!(vf = %vf.pci_address, error = %e, "failed to apply VF defaults");
                        report.record_failure(target, e);
                    }
                }
            }
        }

        {
            let mut state = self.state.write();
            if let Some(pf) = state.pfs.get_mut(pci_address) {
                pf.current_vfs = vfs.len() as u32;
                pf.vf_list = vfs;
            }
        }

        info!(pf = %pci_address, vfs = count, outcome = ?report.outcome(), "enabled virtual functions");
        Ok(report)
    }

    fn reset_vf_table(&self, pci_address: &str) {
        if let Some(pf) = self.state.write().pfs.get_mut(pci_address) {
            pf.vf_list.clear();
            pf.current_vfs = 0;
        }
    }

    fn default_attributes(&self, vf: &VirtualFunction) -> VfAttributes {
        let mut attrs = VfAttributes {
            mac: Some(vf.mac_address.clone()),
            spoof_check: Some(vf.spoof_check),
            trust: Some(vf.trust_mode),
            ..Default::default()
        };
        if vf.qos.rate_limit_enabled {
            attrs.min_tx_rate_mbps = Some(vf.qos.min_bandwidth_mbps);
            attrs.max_tx_rate_mbps = Some(vf.qos.max_bandwidth_mbps);
        }
        attrs
    }

    /// Apply only the fields present in `update`.
    ///
    /// Each field is written separately; fields that fail stay unchanged in
    /// the table and are listed in the report. If nothing could be written
    /// the call fails.
    pub async fn configure_vf(&self, vf_address: &str, update: &VfConfig) -> Result<MutationReport> {
        update.validate()?;

        let (pf_iface, vf_index, parent) = {
            let state = self.state.read();
            let vf = state
                .pfs
                .values()
                .find_map(|pf| pf.vf(vf_address))
                .ok_or_else(|| SriovError::VfNotFound(vf_address.to_string()))?;
            let pf_iface = state
                .pfs
                .get(&vf.parent_pf)
                .and_then(|pf| pf.interface_name.clone());
            (pf_iface, vf.vf_index, vf.parent_pf.clone())
        };

        if update.is_empty() {
            return Ok(MutationReport::new());
        }
        let pf_iface = pf_iface.ok_or(SriovError::NoNetdev(parent.clone()))?;

        let mut steps: Vec<(&str, VfAttributes)> = Vec::new();
        if let Some(mac) = &update.mac_address {
            steps.push(("mac", VfAttributes { mac: Some(mac.clone()), ..Default::default() }));
        }
        if let Some(vlan) = update.vlan_tag {
            let qos = update.qos.map(|q| q.priority);
            steps.push(("vlan", VfAttributes { vlan: Some(vlan), vlan_qos: qos, ..Default::default() }));
        }
        if let Some(qos) = update.qos {
            let (min, max) = if qos.rate_limit_enabled {
                (qos.min_bandwidth_mbps, qos.max_bandwidth_mbps)
            } else {
                (0, 0)
            };
            steps.push((
                "qos",
                VfAttributes {
                    min_tx_rate_mbps: Some(min),
                    max_tx_rate_mbps: Some(max),
                    ..Default::default()
                },
            ));
        }
        if let Some(trust) = update.trust_mode {
            steps.push(("trust", VfAttributes { trust: Some(trust), ..Default::default() }));
        }
        if let Some(spoof) = update.spoof_check {
            steps.push(("spoof_check", VfAttributes { spoof_check: Some(spoof), ..Default::default() }));
        }

        let mut report = MutationReport::new();
        let mut applied = Vec::new();
        for (field, attrs) in steps {
            let target = format!("{}/{}", vf_address, field);
            let iface = pf_iface.clone();
            match blocking(&self.host, move |host| host.set_vf_attributes(&iface, vf_index, &attrs)).await {
                Ok(()) => {
                    report.record_applied(target);
                    applied.push(field);
                }
                Err(e) => {
                    warn!(vf = %vf_address, field, error = %e, "failed to set VF attribute");
                    report.record_failure(target, e);
                }
            }
        }

        if applied.is_empty() {
            let reason = report
                .failures()
                .first()
                .map(|f| f.reason.clone())
                .unwrap_or_default();
            return Err(SriovError::HardwareWrite {
                target: vf_address.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, reason),
            });
        }

        {
            let mut state = self.state.write();
            if let Some(vf) = state.pfs.get_mut(&parent).and_then(|pf| pf.vf_mut(vf_address)) {
                for field in &applied {
                    match *field {
                        "mac" => vf.mac_address = update.mac_address.clone().unwrap_or_default(),
                        "vlan" => vf.vlan_tag = update.vlan_tag,
                        "qos" => vf.qos = update.qos.unwrap_or(vf.qos),
                        "trust" => vf.trust_mode = update.trust_mode.unwrap_or(vf.trust_mode),
                        "spoof_check" => vf.spoof_check = update.spoof_check.unwrap_or(vf.spoof_check),
                        _ => {}
                    }
                }
            }
        }

        info!(vf = %vf_address, fields = ?applied, outcome = ?report.outcome(), "configured virtual function");
        Ok(report)
    }

    /// Reserve a VF for `service_id`; returns the existing one if already assigned
    pub fn assign_vf(&self, service_id: u64) -> Result<VirtualFunction> {
        let mut state = self.state.write();
        if state.phase != SriovPhase::Initialized {
            return Err(SriovError::NotInitialized);
        }

        let mut free: Option<&mut VirtualFunction> = None;
        for vf in state.pfs.values_mut().flat_map(|pf| pf.vf_list.iter_mut()) {
            if vf.assigned_service == Some(service_id) {
                return Ok(vf.clone());
            }
            if free.is_none() && vf.assigned_service.is_none() {
                free = Some(vf);
            }
        }

        let vf = free.ok_or(SriovError::NoFreeVf)?;
        vf.assigned_service = Some(service_id);
        debug!(vf = %vf.pci_address, service_id, "assigned virtual function");
        Ok(vf.clone())
    }

    /// Release the VF held by `service_id`; false when it held none
    pub fn release_vf(&self, service_id: u64) -> bool {
        let mut state = self.state.write();
        for vf in state.pfs.values_mut().flat_map(|pf| pf.vf_list.iter_mut()) {
            if vf.assigned_service == Some(service_id) {
                vf.assigned_service = None;
                return true;
            }
        }
        false
    }

    /// Make VF assignments match `service_ids`: release VFs of services no
    /// longer listed, then assign one VF to each new service.
    pub fn sync_assignments(&self, service_ids: &[u64]) -> Result<MutationReport> {
        if !self.is_running() {
            return Err(SriovError::NotInitialized);
        }

        let stale: Vec<u64> = {
            let state = self.state.read();
            state
                .pfs
                .values()
                .flat_map(|pf| pf.vf_list.iter())
                .filter_map(|vf| vf.assigned_service)
                .filter(|id| !service_ids.contains(id))
                .collect()
        };
        for id in stale {
            self.release_vf(id);
        }

        let mut report = MutationReport::new();
        for &id in service_ids {
            let target = format!("service/{}", id);
            match self.assign_vf(id) {
                Ok(_) => report.record_applied(target),
                Err(e) => report.record_failure(target, e),
            }
        }
        Ok(report)
    }

    pub fn get_physical_functions(&self) -> Vec<PhysicalFunction> {
        self.state.read().pfs.values().cloned().collect()
    }

    pub fn get_virtual_functions(&self) -> Vec<VirtualFunction> {
        self.state
            .read()
            .pfs
            .values()
            .flat_map(|pf| pf.vf_list.iter().cloned())
            .collect()
    }

    pub fn get_stats(&self) -> SriovStats {
        self.state.read().stats.clone()
    }

    async fn start_collector(&self) {
        let mut slot = self.collector.lock().await;
        if slot.is_some() {
            return;
        }

        let host = self.host.clone();
        let state = self.state.clone();
        *slot = Some(Collector::spawn("sriov", self.config.stats_interval, move || {
            let host = host.clone();
            let state = state.clone();
            async move { collect(host.as_ref(), &state) }
        }));
    }

    /// Refresh statistics now instead of waiting for the next tick
    pub fn refresh_stats(&self) {
        collect(self.host.as_ref(), &self.state);
    }

    /// Disable every VF this manager enabled and clear state.
    ///
    /// Best-effort: a failed write is logged and reported, the remaining
    /// PFs are still released. Calling it again is a no-op.
    pub async fn stop(&self) -> MutationReport {
        if let Some(mut collector) = self.collector.lock().await.take() {
            collector.stop().await;
        }

        let _guard = self.mutation.lock().await;
        let pfs: Vec<(String, u32)> = {
            let state = self.state.read();
            if state.phase != SriovPhase::Initialized {
                return MutationReport::new();
            }
            state
                .pfs
                .values()
                .filter(|pf| pf.current_vfs > 0)
                .map(|pf| (pf.pci_address.clone(), pf.current_vfs))
                .collect()
        };

        let mut report = MutationReport::new();
        for (addr, vfs) in pfs {
            let target = format!("{}/sriov_numvfs", addr);
            let pf = addr.clone();
            match blocking(&self.host, move |host| host.write_sriov_num_vfs(&pf, 0)).await {
                Ok(()) => {
                    debug!(pf = %addr, vfs, "released virtual functions");
                    report.record_applied(target);
                }
                Err(e) => {
                    error!(pf = %addr, error = %e, "failed to release virtual functions");
                    report.record_failure(target, e);
                }
            }
        }

        {
            let mut state = self.state.write();
            state.pfs.clear();
            state.stats = SriovStats::default();
            state.phase = SriovPhase::Uninitialized;
        }

        info!(outcome = ?report.outcome(), "SR-IOV manager stopped");
        report
    }
}

/// Run a host mutation on the blocking pool. Sysfs VF writes and `ip link`
/// do not return until the driver has reconfigured the device.
async fn blocking<T, F>(host: &Arc<dyn HostProbe>, op: F) -> std::io::Result<T>
where
    F: FnOnce(&dyn HostProbe) -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let host = Arc::clone(host);
    tokio::task::spawn_blocking(move || op(host.as_ref()))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// One collector tick: read counters outside the lock, then publish.
fn collect(host: &dyn HostProbe, state: &RwLock<SriovState>) {
    let targets: Vec<(String, Option<String>, Vec<(String, Option<String>)>)> = {
        let state = state.read();
        if state.phase != SriovPhase::Initialized {
            return;
        }
        state
            .pfs
            .values()
            .map(|pf| {
                let vfs = pf
                    .vf_list
                    .iter()
                    .map(|vf| (vf.pci_address.clone(), vf.interface_name.clone()))
                    .collect();
                (pf.pci_address.clone(), pf.interface_name.clone(), vfs)
            })
            .collect()
    };

    let read = |iface: &Option<String>| -> Option<VfStatistics> {
        let iface = iface.as_ref()?;
        host.interface_counters(iface).ok().map(VfStatistics::from)
    };

    let readings: Vec<(String, Option<VfStatistics>, Vec<(String, Option<VfStatistics>)>)> = targets
        .iter()
        .map(|(pf, pf_iface, vfs)| {
            let vf_readings = vfs.iter().map(|(addr, iface)| (addr.clone(), read(iface))).collect();
            (pf.clone(), read(pf_iface), vf_readings)
        })
        .collect();

    let now = Utc::now();
    let mut state = state.write();
    if state.phase != SriovPhase::Initialized {
        return;
    }

    for (pf_addr, pf_stats, vf_readings) in readings {
        let Some(pf) = state.pfs.get_mut(&pf_addr) else {
            continue;
        };
        if let Some(stats) = pf_stats {
            pf.statistics = stats;
        }
        for (vf_addr, reading) in vf_readings {
            let (Some(vf), Some(stats)) = (pf.vf_mut(&vf_addr), reading) else {
                continue;
            };
            if stats.packets() > vf.statistics.packets() {
                vf.last_activity = Some(now);
            }
            vf.statistics = stats;
        }
    }

    let stats = SriovStats::aggregate(state.pfs.values(), now);
    state.stats = stats;
    metrics::gauge!("netaccel_sriov_vfs").set(state.stats.total_vfs as f64);
    metrics::gauge!("netaccel_sriov_active_vfs").set(state.stats.active_vfs as f64);
    metrics::gauge!("netaccel_sriov_error_rate").set(state.stats.error_rate);
    debug!(vfs = state.stats.total_vfs, active = state.stats.active_vfs, "SR-IOV statistics refreshed");
}
