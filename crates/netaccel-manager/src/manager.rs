//! Acceleration orchestrator
//!
//! Owns one instance of every sub-manager that came up and talks to them
//! only through their public methods. Lifecycle operations are serialized;
//! statistics are read from a snapshot that the collector replaces whole.

use crate::config::{AccelerationConfig, Accelerator, FallbackMode};
use crate::stats::AccelerationStats;
use crate::{AccelError, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use netaccel_common::{Collector, HostProbe, MutationReport, Service};
use netaccel_cpu::CpuAffinityManager;
use netaccel_detect::{HardwareCapabilities, HardwareDetector, Technology};
use netaccel_sriov::SriovManager;
use netaccel_xdp::{PacketProcessor, ProgramLoader, SlowPathBridge, XdpManager, ZeroCopyManager};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerPhase {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// Sub-managers that came up during `initialize`
#[derive(Default, Clone)]
struct Components {
    xdp: Option<Arc<XdpManager>>,
    zero_copy: Option<Arc<ZeroCopyManager>>,
    bridge: Option<Arc<SlowPathBridge>>,
    sriov: Option<Arc<SriovManager>>,
    cpu: Option<Arc<CpuAffinityManager>>,
}

impl Components {
    fn active(&self) -> Vec<Accelerator> {
        let mut active = Vec::new();
        if self.xdp.as_ref().is_some_and(|m| m.is_loaded()) {
            active.push(Accelerator::Xdp);
        }
        if self.zero_copy.as_ref().is_some_and(|m| m.is_initialized()) {
            active.push(Accelerator::AfXdp);
        }
        if self.sriov.as_ref().is_some_and(|m| m.is_running()) {
            active.push(Accelerator::Sriov);
        }
        if self.cpu.as_ref().is_some_and(|m| m.is_running()) {
            active.push(Accelerator::CpuAffinity);
        }
        active
    }
}

#[derive(Default)]
struct StatsState {
    snapshot: AccelerationStats,
    last_sample: Option<(u64, Instant)>,
}

/// Brings up and coordinates every enabled acceleration technology
pub struct AccelerationManager {
    config: ArcSwap<AccelerationConfig>,
    host: Arc<dyn HostProbe>,
    loader: Arc<dyn ProgramLoader>,
    detector: HardwareDetector,
    phase: RwLock<ManagerPhase>,
    components: Arc<RwLock<Components>>,
    stats: Arc<RwLock<StatsState>>,
    processor: RwLock<Option<Arc<dyn PacketProcessor>>>,
    services: RwLock<Vec<Service>>,
    collector: tokio::sync::Mutex<Option<Collector>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl AccelerationManager {
    pub fn new(config: AccelerationConfig, host: Arc<dyn HostProbe>, loader: Arc<dyn ProgramLoader>) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            detector: HardwareDetector::new(host.clone()),
            host,
            loader,
            phase: RwLock::new(ManagerPhase::Uninitialized),
            components: Arc::new(RwLock::new(Components::default())),
            stats: Arc::new(RwLock::new(StatsState::default())),
            processor: RwLock::new(None),
            services: RwLock::new(Vec::new()),
            collector: tokio::sync::Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> Arc<AccelerationConfig> {
        self.config.load_full()
    }

    pub fn fallback_mode(&self) -> FallbackMode {
        self.config.load().fallback
    }

    pub fn phase(&self) -> ManagerPhase {
        *self.phase.read()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.phase(), ManagerPhase::Initialized | ManagerPhase::Running)
    }

    pub fn is_running(&self) -> bool {
        self.phase() == ManagerPhase::Running
    }

    /// Detect the host and bring up every enabled technology it supports.
    ///
    /// A technology that fails to come up is logged and left out; only an
    /// invalid config, a failed interface scan or a wrong phase is an error.
    pub async fn initialize(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.initialize_locked().await
    }

    async fn initialize_locked(&self) -> Result<()> {
        match self.phase() {
            ManagerPhase::Uninitialized => {}
            ManagerPhase::Stopped => return Err(AccelError::InvalidState(ManagerPhase::Stopped)),
            ManagerPhase::Initialized | ManagerPhase::Running => return Err(AccelError::AlreadyInitialized),
        }

        let config = self.config.load_full();
        config.validate()?;

        let caps = self.detector.detect()?;
        info!(
            iface = %config.interface,
            enabled = ?config.enabled,
            best = %caps.best_acceleration(),
            "initializing acceleration"
        );

        let mut components = Components::default();
        if config.is_enabled(Accelerator::CpuAffinity) {
            components.cpu = self.bring_up_cpu(&config).await;
        }
        if config.is_enabled(Accelerator::Sriov) && allowed(&caps, Technology::Sriov, Accelerator::Sriov) {
            components.sriov = self.bring_up_sriov(&config).await;
        }
        if config.is_enabled(Accelerator::Xdp) && allowed(&caps, Technology::Xdp, Accelerator::Xdp) {
            components.xdp = self.bring_up_xdp(&config).await;
        }
        if config.is_enabled(Accelerator::AfXdp) && allowed(&caps, Technology::AfXdp, Accelerator::AfXdp) {
            components.zero_copy = self.bring_up_zero_copy(&config, components.cpu.clone());
        }
        if let (Some(xdp), Some(zero_copy)) = (&components.xdp, &components.zero_copy) {
            components.bridge = self.wire_bridge(&config, xdp, zero_copy).await;
        }

        let active = components.active();
        *self.components.write() = components;
        *self.phase.write() = ManagerPhase::Initialized;

        if active.is_empty() {
            warn!(fallback = ?config.fallback, "no acceleration active, traffic stays on the fallback path");
        } else {
            info!(active = ?active, "acceleration initialized");
        }

        let services = self.services.read().clone();
        if !services.is_empty() {
            let report = self.push_services(&services).await;
            debug!(applied = report.applied_items().len(), failed = report.failures().len(), "replayed service hints");
        }

        collect(&self.components, &self.stats);
        self.start_collector(&config).await;
        Ok(())
    }

    async fn bring_up_cpu(&self, config: &AccelerationConfig) -> Option<Arc<CpuAffinityManager>> {
        let cpu = Arc::new(CpuAffinityManager::new(config.cpu.clone(), self.host.clone()));
        match cpu.initialize().await {
            Ok(()) => Some(cpu),
            Err(e) => {
                warn!(error = %e, "CPU affinity unavailable");
                None
            }
        }
    }

    async fn bring_up_sriov(&self, config: &AccelerationConfig) -> Option<Arc<SriovManager>> {
        let sriov = Arc::new(SriovManager::new(config.sriov.clone(), self.host.clone()));
        match sriov.initialize().await {
            Ok(report) => {
                for failure in report.failures() {
                    warn!(item = %failure.target, reason = %failure.reason, "SR-IOV change not applied");
                }
                Some(sriov)
            }
            Err(e) => {
                warn!(error = %e, "failed to initialize SR-IOV");
                None
            }
        }
    }

    async fn bring_up_xdp(&self, config: &AccelerationConfig) -> Option<Arc<XdpManager>> {
        let xdp = Arc::new(XdpManager::new(config.xdp.clone(), &config.interface, self.loader.clone()));
        match xdp.initialize().await {
            Ok(()) => Some(xdp),
            Err(e) => {
                warn!(error = %e, "failed to initialize XDP fast path");
                None
            }
        }
    }

    fn bring_up_zero_copy(
        &self,
        config: &AccelerationConfig,
        cpu: Option<Arc<CpuAffinityManager>>,
    ) -> Option<Arc<ZeroCopyManager>> {
        let zero_copy = Arc::new(ZeroCopyManager::new(config.effective_zero_copy(), &config.interface, self.loader.clone()));
        if let Err(e) = zero_copy.initialize() {
            warn!(error = %e, "failed to initialize AF_XDP sockets");
            return None;
        }

        // Workers pin themselves to the packet cores when they start
        if let Some(cpu) = cpu {
            let iface = config.interface.clone();
            let hook: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(move |queue: u32| {
                let group = cpu.get_optimal_core_group("packet_processing", 0);
                if let Err(e) = cpu.set_thread_affinity(&group, 0) {
                    warn!(iface = %iface, queue, group = %group, error = %e, "failed to pin AF_XDP worker");
                }
            });
            zero_copy.set_worker_hook(Some(hook));
        }
        Some(zero_copy)
    }

    async fn wire_bridge(
        &self,
        config: &AccelerationConfig,
        xdp: &XdpManager,
        zero_copy: &ZeroCopyManager,
    ) -> Option<Arc<SlowPathBridge>> {
        let bridge = Arc::new(SlowPathBridge::new(&config.interface));
        let processor = self.processor.read().clone();
        bridge.set_processor(processor);

        match bridge.wire(xdp, zero_copy).await {
            Ok(report) => {
                for failure in report.failures() {
                    warn!(item = %failure.target, reason = %failure.reason, "AF_XDP queue not bridged");
                }
                Some(bridge)
            }
            Err(e) => {
                warn!(error = %e, "failed to wire slow-path bridge");
                None
            }
        }
    }

    async fn start_collector(&self, config: &AccelerationConfig) {
        let mut slot = self.collector.lock().await;
        if slot.is_some() {
            return;
        }

        let components = self.components.clone();
        let stats = self.stats.clone();
        *slot = Some(Collector::spawn("acceleration", config.stats_interval, move || {
            let components = components.clone();
            let stats = stats.clone();
            async move { collect(&components, &stats) }
        }));
    }

    /// Set the consumer for slow-path packets. Takes effect immediately when
    /// the bridge is already wired, otherwise when it is.
    pub fn set_packet_processor(&self, processor: Option<Arc<dyn PacketProcessor>>) {
        *self.processor.write() = processor.clone();

        let bridge = self.components.read().bridge.clone();
        if let Some(bridge) = bridge {
            bridge.set_processor(processor);
            info!(processor = bridge.has_processor(), "slow-path bridge rewired");
        }
    }

    /// Start every technology that came up. One failing to start is logged.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<()> {
        match self.phase() {
            ManagerPhase::Initialized => {}
            ManagerPhase::Running => return Err(AccelError::AlreadyRunning),
            ManagerPhase::Uninitialized => return Err(AccelError::NotInitialized),
            ManagerPhase::Stopped => return Err(AccelError::InvalidState(ManagerPhase::Stopped)),
        }

        let components = self.components.read().clone();
        if let Some(xdp) = &components.xdp {
            if let Err(e) = xdp.start().await {
                warn!(error = %e, "failed to start XDP fast path");
            }
        }
        if let Some(zero_copy) = &components.zero_copy {
            if let Err(e) = zero_copy.start() {
                warn!(error = %e, "failed to start AF_XDP workers");
            }
        }

        *self.phase.write() = ManagerPhase::Running;
        info!(active = ?components.active(), "acceleration started");
        Ok(())
    }

    /// Tear everything down: bridge, fast path, zero-copy, then SR-IOV and
    /// CPU. Hardware release failures are logged and reported. Idempotent.
    pub async fn stop(&self) -> MutationReport {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> MutationReport {
        {
            let mut phase = self.phase.write();
            match *phase {
                ManagerPhase::Initialized | ManagerPhase::Running => *phase = ManagerPhase::Stopped,
                ManagerPhase::Uninitialized | ManagerPhase::Stopped => return MutationReport::new(),
            }
        }

        if let Some(mut collector) = self.collector.lock().await.take() {
            collector.stop().await;
        }

        let components = std::mem::take(&mut *self.components.write());
        if let (Some(bridge), Some(xdp), Some(zero_copy)) = (&components.bridge, &components.xdp, &components.zero_copy) {
            bridge.unwire(xdp, zero_copy).await;
        }
        if let Some(xdp) = &components.xdp {
            xdp.stop().await;
        }
        if let Some(zero_copy) = &components.zero_copy {
            zero_copy.set_worker_hook(None);
            zero_copy.stop();
        }

        let mut report = MutationReport::new();
        if let Some(sriov) = &components.sriov {
            report.merge(sriov.stop().await);
        }
        if let Some(cpu) = &components.cpu {
            cpu.stop().await;
        }

        *self.stats.write() = StatsState::default();
        info!(failures = report.failures().len(), "acceleration stopped");
        report
    }

    /// Replace the configuration; a running manager restarts with it
    pub async fn update_config(&self, config: AccelerationConfig) -> Result<()> {
        config.validate()?;

        let _lifecycle = self.lifecycle.lock().await;
        self.config.store(Arc::new(config));
        if self.phase() != ManagerPhase::Running {
            info!("configuration updated");
            return Ok(());
        }

        info!("configuration updated, restarting acceleration");
        let report = self.stop_locked().await;
        for failure in report.failures() {
            warn!(item = %failure.target, reason = %failure.reason, "release failed during restart");
        }

        *self.phase.write() = ManagerPhase::Uninitialized;
        self.initialize_locked()
            .await
            .map_err(|e| AccelError::Restart(Box::new(e)))?;
        self.start_locked()
            .await
            .map_err(|e| AccelError::Restart(Box::new(e)))
    }

    /// Push service hints to every active technology: XDP rules, the
    /// slow-path index, VF assignment and core group placement.
    ///
    /// Before `initialize` the list is only stored; it is applied once the
    /// technologies are up, and again after every restart.
    pub async fn update_services(&self, services: &[Service]) -> MutationReport {
        *self.services.write() = services.to_vec();
        if !self.is_initialized() {
            debug!(services = services.len(), "service hints stored until initialization");
            return MutationReport::new();
        }
        self.push_services(services).await
    }

    async fn push_services(&self, services: &[Service]) -> MutationReport {
        let components = self.components.read().clone();
        let mut report = MutationReport::new();

        if let Some(xdp) = &components.xdp {
            match xdp.update_services(services).await {
                Ok(r) => report.merge(r),
                Err(e) => report.record_failure(Accelerator::Xdp.as_str(), e),
            }
        }
        if let Some(bridge) = &components.bridge {
            bridge.update_services(services);
        }
        if let Some(sriov) = &components.sriov {
            let ids: Vec<u64> = services.iter().map(|s| s.id).collect();
            match sriov.sync_assignments(&ids) {
                Ok(r) => report.merge(r),
                Err(e) => report.record_failure(Accelerator::Sriov.as_str(), e),
            }
        }
        if let Some(cpu) = &components.cpu {
            let hints: Vec<(u64, &str)> = services.iter().map(|s| (s.id, s.workload_hint())).collect();
            report.merge(cpu.sync_services(&hints));
        }

        info!(
            services = services.len(),
            applied = report.applied_items().len(),
            failed = report.failures().len(),
            "service hints applied"
        );
        report
    }

    /// Copy of the latest statistics snapshot
    pub fn get_stats(&self) -> AccelerationStats {
        self.stats.read().snapshot.clone()
    }

    /// Re-read every technology's counters and rebuild the snapshot now
    /// instead of waiting for the next tick
    pub async fn refresh_stats(&self) {
        let components = self.components.read().clone();
        if let Some(xdp) = &components.xdp {
            xdp.refresh_stats().await;
        }
        if let Some(sriov) = &components.sriov {
            sriov.refresh_stats();
        }
        if let Some(cpu) = &components.cpu {
            cpu.refresh_stats();
        }
        collect(&self.components, &self.stats);
    }

    /// Technologies that are currently up
    pub fn get_active_technologies(&self) -> Vec<Accelerator> {
        let components = self.components.read().clone();
        components.active()
    }

    /// Capability report from the last detection
    pub fn get_capabilities(&self) -> Option<Arc<HardwareCapabilities>> {
        self.detector.latest()
    }

    pub fn capability_summary(&self) -> String {
        match self.detector.latest() {
            Some(caps) => caps.summary(),
            None => "hardware not detected yet".to_string(),
        }
    }

    pub fn sriov(&self) -> Option<Arc<SriovManager>> {
        self.components.read().sriov.clone()
    }

    pub fn cpu(&self) -> Option<Arc<CpuAffinityManager>> {
        self.components.read().cpu.clone()
    }

    pub fn bridge(&self) -> Option<Arc<SlowPathBridge>> {
        self.components.read().bridge.clone()
    }
}

/// Log why an enabled technology is skipped
fn allowed(caps: &HardwareCapabilities, technology: Technology, accelerator: Accelerator) -> bool {
    match caps.capability(technology) {
        Some(capability) if capability.available => true,
        Some(capability) => {
            warn!(
                technology = %accelerator,
                reason = %capability.reason,
                prerequisites = ?capability.prerequisites,
                "acceleration not supported on this host"
            );
            false
        }
        None => false,
    }
}

fn collect(components: &RwLock<Components>, stats: &RwLock<StatsState>) {
    let components = components.read().clone();

    let mut snapshot = AccelerationStats {
        active: components.active(),
        xdp: components.xdp.as_ref().map(|m| m.get_stats()),
        zero_copy: components.zero_copy.as_ref().map(|m| m.get_stats()),
        sriov: components.sriov.as_ref().map(|m| m.get_stats()),
        cpu: components.cpu.as_ref().map(|m| m.get_stats()),
        ..Default::default()
    };
    if let Some(bridge) = &components.bridge {
        if let Some(xdp) = &snapshot.xdp {
            bridge.sync_fast_path(xdp.passed_packets);
        }
        snapshot.bridge = Some(bridge.get_stats());
    }
    snapshot.recompute_totals();

    let now = Instant::now();
    let mut state = stats.write();
    if let Some((last_total, at)) = state.last_sample {
        let elapsed = now.duration_since(at).as_secs_f64();
        if elapsed > 0.0 {
            snapshot.packets_per_second = snapshot.total_packets.saturating_sub(last_total) as f64 / elapsed;
        }
    }
    snapshot.last_update = Some(Utc::now());
    state.last_sample = Some((snapshot.total_packets, now));

    metrics::gauge!("netaccel_packets_total").set(snapshot.total_packets as f64);
    metrics::gauge!("netaccel_packets_per_second").set(snapshot.packets_per_second);
    metrics::gauge!("netaccel_active_technologies").set(snapshot.active.len() as f64);

    debug!(
        total = snapshot.total_packets,
        pps = snapshot.packets_per_second,
        active = snapshot.active.len(),
        "acceleration statistics refreshed"
    );
    state.snapshot = snapshot;
}
