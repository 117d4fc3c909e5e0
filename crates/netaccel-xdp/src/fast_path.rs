//! XDP fast path

use crate::config::{AttachMode, XdpConfig};
use crate::loader::{ProgramHandle, ProgramLoader};
use crate::rules::{rule_table, ServiceRule};
use crate::{Result, XdpError, SERVICE_RULES_MAP, STATS_MAP, XSKS_MAP};
use chrono::{DateTime, Utc};
use netaccel_common::{Collector, MutationReport, Service};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Counter slots in `stats_map`
const STAT_TOTAL: u32 = 0;
const STAT_PASSED: u32 = 1;
const STAT_DROPPED: u32 = 2;
const STAT_REDIRECTED: u32 = 3;
const STAT_TCP: u32 = 4;
const STAT_UDP: u32 = 5;
const STAT_OTHER: u32 = 6;
const STAT_MALFORMED: u32 = 7;
const STAT_SLOTS: u32 = 8;

/// Fast-path counters as read from `stats_map`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XdpStats {
    pub total_packets: u64,
    pub passed_packets: u64,
    pub dropped_packets: u64,
    pub redirected_packets: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub other_packets: u64,
    pub malformed_packets: u64,
    pub packets_per_second: f64,
    pub last_update: Option<DateTime<Utc>>,
}

impl XdpStats {
    fn from_slots(slots: &[u64; STAT_SLOTS as usize]) -> Self {
        Self {
            total_packets: slots[STAT_TOTAL as usize],
            passed_packets: slots[STAT_PASSED as usize],
            dropped_packets: slots[STAT_DROPPED as usize],
            redirected_packets: slots[STAT_REDIRECTED as usize],
            tcp_packets: slots[STAT_TCP as usize],
            udp_packets: slots[STAT_UDP as usize],
            other_packets: slots[STAT_OTHER as usize],
            malformed_packets: slots[STAT_MALFORMED as usize],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Attached,
    Running,
}

struct XdpState {
    phase: Phase,
    program: Option<ProgramHandle>,
    attached: BTreeMap<String, AttachMode>,
    rules: BTreeMap<u32, ServiceRule>,
    sockets: BTreeMap<u32, i32>,
    stats: XdpStats,
    last_sample: Option<(u64, Instant)>,
}

/// Loads the fast-path program, attaches it and owns its maps
pub struct XdpManager {
    config: XdpConfig,
    interfaces: Vec<String>,
    loader: Arc<dyn ProgramLoader>,
    state: Arc<RwLock<XdpState>>,
    collector: tokio::sync::Mutex<Option<Collector>>,
}

impl XdpManager {
    /// `interface` is used when the config names no interfaces
    pub fn new(config: XdpConfig, interface: &str, loader: Arc<dyn ProgramLoader>) -> Self {
        let interfaces = if config.interfaces.is_empty() {
            vec![interface.to_string()]
        } else {
            config.interfaces.clone()
        };

        Self {
            config,
            interfaces,
            loader,
            state: Arc::new(RwLock::new(XdpState {
                phase: Phase::Uninitialized,
                program: None,
                attached: BTreeMap::new(),
                rules: BTreeMap::new(),
                sockets: BTreeMap::new(),
                stats: XdpStats::default(),
                last_sample: None,
            })),
            collector: tokio::sync::Mutex::new(None),
        }
    }

    /// Load the object and attach it to every interface.
    ///
    /// All-or-nothing: interfaces attached before a failure are detached.
    pub async fn initialize(&self) -> Result<()> {
        if self.state.read().phase != Phase::Uninitialized {
            return Err(XdpError::AlreadyInitialized);
        }
        if self.interfaces.iter().all(|i| i.is_empty()) {
            return Err(XdpError::NoInterfaces);
        }

        info!(path = %self.config.program_path.display(), section = %self.config.section, "loading XDP program");
        let program = self
            .loader
            .load(&self.config.program_path, &self.config.section)
            .await?;

        let mut attached = BTreeMap::new();
        for iface in &self.interfaces {
            match self
                .loader
                .attach(&program, iface, self.config.attach_mode, self.config.force_replace)
                .await
            {
                Ok(mode) => {
                    if mode != self.config.attach_mode {
                        warn!(iface = %iface, requested = %self.config.attach_mode, actual = %mode, "XDP attached in fallback mode");
                    }
                    info!(iface = %iface, mode = %mode, "XDP program attached");
                    attached.insert(iface.clone(), mode);
                }
                Err(e) => {
                    self.detach_all(&attached).await;
                    return Err(e);
                }
            }
        }

        let mut state = self.state.write();
        state.program = Some(program);
        state.attached = attached;
        state.phase = Phase::Attached;
        Ok(())
    }

    async fn detach_all(&self, attached: &BTreeMap<String, AttachMode>) {
        for (iface, mode) in attached {
            match self.loader.detach(iface, *mode).await {
                Ok(()) => info!(iface = %iface, "XDP program detached"),
                Err(e) => error!(iface = %iface, error = %e, "failed to detach XDP program"),
            }
        }
    }

    /// Start the statistics collector
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match state.phase {
                Phase::Uninitialized => return Err(XdpError::NotInitialized),
                Phase::Running => return Ok(()),
                Phase::Attached => state.phase = Phase::Running,
            }
        }

        let mut slot = self.collector.lock().await;
        if slot.is_none() {
            let loader = self.loader.clone();
            let state = self.state.clone();
            *slot = Some(Collector::spawn("xdp", self.config.stats_interval, move || {
                let loader = loader.clone();
                let state = state.clone();
                async move { collect(loader.as_ref(), &state).await }
            }));
        }
        Ok(())
    }

    /// Detach from every interface and forget all rules. Idempotent.
    pub async fn stop(&self) {
        if let Some(mut collector) = self.collector.lock().await.take() {
            collector.stop().await;
        }

        let attached = {
            let mut state = self.state.write();
            if state.phase == Phase::Uninitialized {
                return;
            }
            state.phase = Phase::Uninitialized;
            state.program = None;
            state.rules.clear();
            state.sockets.clear();
            state.last_sample = None;
            std::mem::take(&mut state.attached)
        };

        self.detach_all(&attached).await;
        info!("XDP fast path stopped");
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().phase != Phase::Uninitialized
    }

    pub fn is_running(&self) -> bool {
        self.state.read().phase == Phase::Running
    }

    pub fn attached_interfaces(&self) -> BTreeMap<String, AttachMode> {
        self.state.read().attached.clone()
    }

    pub fn rules(&self) -> Vec<ServiceRule> {
        self.state.read().rules.values().copied().collect()
    }

    /// Sync `service_rules` with `services`: changed keys are written,
    /// keys no longer present are deleted
    pub async fn update_services(&self, services: &[Service]) -> Result<MutationReport> {
        let current = {
            let state = self.state.read();
            if state.phase == Phase::Uninitialized {
                return Err(XdpError::NotInitialized);
            }
            state.rules.clone()
        };

        let (desired, skipped) = rule_table(services);
        let mut report = MutationReport::new();
        for service in skipped {
            report.record_failure(
                format!("service/{}", service.id),
                format!("{} is not an IPv4 address", service.address),
            );
        }

        let mut applied = current.clone();
        for (key, rule) in &desired {
            if current.get(key) == Some(rule) {
                continue;
            }
            let target = format!("{}/{:08x}", SERVICE_RULES_MAP, key);
            match self
                .loader
                .update_map_entry(SERVICE_RULES_MAP, &rule.key_bytes(), &rule.encode())
                .await
            {
                Ok(()) => {
                    applied.insert(*key, *rule);
                    report.record_applied(target);
                }
                Err(e) => {
                    warn!(service = rule.service_id, error = %e, "failed to update service rule");
                    report.record_failure(target, e);
                }
            }
        }

        for (key, rule) in &current {
            if desired.contains_key(key) {
                continue;
            }
            let target = format!("{}/{:08x}", SERVICE_RULES_MAP, key);
            match self.loader.delete_map_entry(SERVICE_RULES_MAP, &rule.key_bytes()).await {
                Ok(()) => {
                    applied.remove(key);
                    report.record_applied(target);
                }
                Err(e) => {
                    warn!(service = rule.service_id, error = %e, "failed to delete service rule");
                    report.record_failure(target, e);
                }
            }
        }

        let mut state = self.state.write();
        if state.phase != Phase::Uninitialized {
            state.rules = applied;
        }
        info!(
            rules = state.rules.len(),
            changed = report.applied_items().len(),
            failed = report.failures().len(),
            "service rules synchronized"
        );
        Ok(report)
    }

    /// Point `XDP_REDIRECT` for `queue` at the AF_XDP socket `fd`
    pub async fn register_xsk(&self, queue: u32, fd: i32) -> Result<()> {
        if !self.is_loaded() {
            return Err(XdpError::NotInitialized);
        }
        self.loader
            .update_map_entry(XSKS_MAP, &queue.to_ne_bytes(), &fd.to_ne_bytes())
            .await?;
        self.state.write().sockets.insert(queue, fd);
        debug!(queue, fd, "registered AF_XDP socket");
        Ok(())
    }

    pub async fn unregister_xsk(&self, queue: u32) -> Result<()> {
        if self.state.write().sockets.remove(&queue).is_none() {
            return Ok(());
        }
        self.loader.delete_map_entry(XSKS_MAP, &queue.to_ne_bytes()).await
    }

    pub fn registered_sockets(&self) -> BTreeMap<u32, i32> {
        self.state.read().sockets.clone()
    }

    pub fn get_stats(&self) -> XdpStats {
        self.state.read().stats.clone()
    }

    /// Read the counters now instead of waiting for the next tick
    pub async fn refresh_stats(&self) {
        collect(self.loader.as_ref(), &self.state).await;
    }
}

async fn collect(loader: &dyn ProgramLoader, state: &RwLock<XdpState>) {
    if state.read().phase == Phase::Uninitialized {
        return;
    }

    let mut slots = [0u64; STAT_SLOTS as usize];
    for index in 0..STAT_SLOTS {
        match loader.read_stat(STATS_MAP, index).await {
            Ok(value) => slots[index as usize] = value,
            Err(e) => {
                debug!(index, error = %e, "failed to read XDP counter");
                return;
            }
        }
    }

    let mut stats = XdpStats::from_slots(&slots);
    let now = Instant::now();

    let mut state = state.write();
    if state.phase == Phase::Uninitialized {
        return;
    }

    if let Some((last_total, at)) = state.last_sample {
        let elapsed = now.duration_since(at).as_secs_f64();
        if elapsed > 0.0 {
            stats.packets_per_second = stats.total_packets.saturating_sub(last_total) as f64 / elapsed;
        }
    }
    stats.last_update = Some(Utc::now());
    state.last_sample = Some((stats.total_packets, now));

    metrics::gauge!("netaccel_xdp_packets_total").set(stats.total_packets as f64);
    metrics::gauge!("netaccel_xdp_packets_dropped").set(stats.dropped_packets as f64);
    metrics::gauge!("netaccel_xdp_packets_redirected").set(stats.redirected_packets as f64);
    metrics::gauge!("netaccel_xdp_packets_per_second").set(stats.packets_per_second);

    debug!(total = stats.total_packets, pps = stats.packets_per_second, "XDP statistics refreshed");
    state.stats = stats;
}
