//! CPU affinity manager

use crate::config::CpuAffinityConfig;
use crate::groups::{CoreGroup, PACKET_GROUP, PACKET_PRIORITY, SYSTEM_GROUP};
use crate::load::{utilization, CpuTimes, ProcStat};
use crate::topology::CpuTopology;
use crate::{AffinityError, Result};
use chrono::{DateTime, Duration, Utc};
use netaccel_common::{parse_cpu_list, Collector, HostProbe, MutationReport};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ACTIVITY_WINDOW_SECS: i64 = 300;

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityPhase {
    Disabled,
    Uninitialized,
    TopologyDiscovered,
    Initialized,
}

/// Manager-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AffinityStats {
    pub total_cpus: usize,
    pub isolated_cpus: usize,
    pub total_groups: usize,
    /// Groups with activity in the last five minutes
    pub active_groups: usize,
    pub average_load: f64,
    /// System-wide context switches during the last interval
    pub context_switches: u64,
    pub last_update: Option<DateTime<Utc>>,
}

struct AffinityState {
    phase: AffinityPhase,
    topology: Option<Arc<CpuTopology>>,
    isolated: BTreeSet<usize>,
    groups: BTreeMap<String, CoreGroup>,
    cpu_load: BTreeMap<usize, f64>,
    stats: AffinityStats,
    prev_times: HashMap<usize, CpuTimes>,
    prev_ctxt: Option<u64>,
}

/// Partitions CPUs into the `system` group and the exclusive `packet` group
pub struct CpuAffinityManager {
    config: CpuAffinityConfig,
    host: Arc<dyn HostProbe>,
    state: Arc<RwLock<AffinityState>>,
    collector: tokio::sync::Mutex<Option<Collector>>,
}

impl CpuAffinityManager {
    pub fn new(config: CpuAffinityConfig, host: Arc<dyn HostProbe>) -> Self {
        let phase = if config.enabled {
            AffinityPhase::Uninitialized
        } else {
            AffinityPhase::Disabled
        };

        Self {
            config,
            host,
            state: Arc::new(RwLock::new(AffinityState {
                phase,
                topology: None,
                isolated: BTreeSet::new(),
                groups: BTreeMap::new(),
                cpu_load: BTreeMap::new(),
                stats: AffinityStats::default(),
                prev_times: HashMap::new(),
                prev_ctxt: None,
            })),
            collector: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CpuAffinityConfig {
        &self.config
    }

    pub fn phase(&self) -> AffinityPhase {
        self.state.read().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == AffinityPhase::Initialized
    }

    /// Discover topology, choose isolated cores, build the default groups
    /// and start the collector
    pub async fn initialize(&self) -> Result<()> {
        {
            let state = self.state.read();
            match state.phase {
                AffinityPhase::Disabled => return Err(AffinityError::Disabled),
                AffinityPhase::Uninitialized => {}
                _ => return Err(AffinityError::AlreadyInitialized),
            }
        }

        let topology = Arc::new(CpuTopology::discover(self.host.as_ref())?);
        info!(
            cpus = topology.num_cpus,
            cores = topology.num_cores,
            sockets = topology.num_sockets,
            threads_per_core = topology.threads_per_core,
            "discovered CPU topology"
        );

        {
            let mut state = self.state.write();
            state.topology = Some(topology.clone());
            state.phase = AffinityPhase::TopologyDiscovered;
        }

        let isolated = match self.select_isolated(&topology) {
            Ok(isolated) => isolated,
            Err(e) => {
                let mut state = self.state.write();
                state.topology = None;
                state.phase = AffinityPhase::Uninitialized;
                return Err(e);
            }
        };

        if !isolated.is_empty() {
            self.check_kernel_isolation(&isolated);
        }

        let system: Vec<usize> = topology
            .all_cpus()
            .into_iter()
            .filter(|cpu| !isolated.contains(cpu))
            .collect();

        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            state.groups.insert(SYSTEM_GROUP.to_string(), CoreGroup::system(system));
            if !isolated.is_empty() {
                state
                    .groups
                    .insert(PACKET_GROUP.to_string(), CoreGroup::packet(isolated.iter().copied().collect()));
            }
            state.isolated = isolated;
            state.stats.total_cpus = topology.num_cpus;
            state.stats.isolated_cpus = state.isolated.len();
            state.stats.total_groups = state.groups.len();
            state.phase = AffinityPhase::Initialized;
        }

        self.start_collector().await;

        info!(isolated = ?self.isolated_cores(), "CPU affinity manager initialized");
        Ok(())
    }

    fn select_isolated(&self, topology: &CpuTopology) -> Result<BTreeSet<usize>> {
        if !self.config.enable_isolation {
            return Ok(BTreeSet::new());
        }

        if self.config.isolated_cores.is_empty() {
            return Ok(topology.auto_isolation());
        }

        let mut isolated = BTreeSet::new();
        for &cpu in &self.config.isolated_cores {
            if !topology.contains(cpu) {
                return Err(AffinityError::CoreNotFound(cpu));
            }
            isolated.insert(cpu);
        }
        if isolated.len() >= topology.num_cpus {
            return Err(AffinityError::InvalidConfig(
                "isolated cores cover every CPU".to_string(),
            ));
        }
        Ok(isolated)
    }

    /// Soft isolation only keeps our own threads off these cores; warn when
    /// the kernel was not told to keep everything else away too.
    fn check_kernel_isolation(&self, isolated: &BTreeSet<usize>) {
        let cmdline = match self.host.read_cmdline() {
            Ok(cmdline) => cmdline,
            Err(e) => {
                warn!(error = %e, "could not read kernel command line for isolcpus check");
                return;
            }
        };

        let kernel_isolated: BTreeSet<usize> = cmdline
            .split_whitespace()
            .filter_map(|p| p.strip_prefix("isolcpus="))
            .flat_map(|list| {
                // Drop flags such as `managed_irq,domain,`
                let cpus: String = list
                    .split(',')
                    .filter(|part| part.starts_with(|c: char| c.is_ascii_digit()))
                    .collect::<Vec<_>>()
                    .join(",");
                parse_cpu_list(&cpus)
            })
            .collect();

        let missing: Vec<usize> = isolated.difference(&kernel_isolated).copied().collect();
        if !missing.is_empty() {
            warn!(
                cpus = ?missing,
                "cores are not isolated by the kernel (isolcpus); other tasks may still be scheduled on them"
            );
        }
    }

    /// Bind a thread (`0` = calling thread) to the CPUs of `group`
    pub fn set_thread_affinity(&self, group: &str, thread_id: i32) -> Result<MutationReport> {
        self.bind(group, thread_id, "thread")
    }

    /// Bind a process to the CPUs of `group`
    pub fn set_process_affinity(&self, group: &str, process_id: i32) -> Result<MutationReport> {
        self.bind(group, process_id, "process")
    }

    fn bind(&self, group: &str, id: i32, kind: &str) -> Result<MutationReport> {
        let cpus = self.group_cpus(group)?;
        let target = format!("{} {}", kind, id);

        self.host
            .set_affinity(id, &cpus)
            .map_err(|e| AffinityError::Bind {
                target: target.clone(),
                cpus: cpus.clone(),
                source: e,
            })?;

        if let Some(g) = self.state.write().groups.get_mut(group) {
            g.stats.bindings += 1;
            g.touch();
        }

        debug!(group, id, kind, cpus = ?cpus, "bound to core group");
        Ok(MutationReport::applied(target))
    }

    /// Bind several threads; failures make the report partial
    pub fn bind_threads(&self, group: &str, thread_ids: &[i32]) -> Result<MutationReport> {
        self.group_cpus(group)?;

        let mut report = MutationReport::new();
        for &tid in thread_ids {
            match self.set_thread_affinity(group, tid) {
                Ok(r) => report.merge(r),
                Err(e) => report.record_failure(format!("thread {}", tid), e),
            }
        }
        Ok(report)
    }

    fn group_cpus(&self, group: &str) -> Result<Vec<usize>> {
        let state = self.state.read();
        if state.phase != AffinityPhase::Initialized {
            return Err(AffinityError::NotInitialized);
        }
        state
            .groups
            .get(group)
            .map(|g| g.cpus.clone())
            .ok_or_else(|| AffinityError::GroupNotFound(group.to_string()))
    }

    /// Move one more core from `system` into the isolated `packet` group
    pub fn isolate_core(&self, core_id: usize) -> Result<MutationReport> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.phase != AffinityPhase::Initialized {
            return Err(AffinityError::NotInitialized);
        }

        let known = state
            .topology
            .as_ref()
            .map(|t| t.contains(core_id))
            .unwrap_or(false);
        if !known {
            return Err(AffinityError::CoreNotFound(core_id));
        }
        if state.isolated.contains(&core_id) {
            return Err(AffinityError::AlreadyIsolated(core_id));
        }

        let system_len = state.groups.get(SYSTEM_GROUP).map(|g| g.cpus.len()).unwrap_or(0);
        if system_len <= 1 {
            return Err(AffinityError::LastSystemCore(core_id));
        }

        state.isolated.insert(core_id);
        if let Some(system) = state.groups.get_mut(SYSTEM_GROUP) {
            system.cpus.retain(|&cpu| cpu != core_id);
        }
        let packet = state
            .groups
            .entry(PACKET_GROUP.to_string())
            .or_insert_with(|| CoreGroup::packet(Vec::new()));
        packet.cpus.push(core_id);
        packet.cpus.sort_unstable();

        state.stats.isolated_cpus = state.isolated.len();
        state.stats.total_groups = state.groups.len();

        info!(core = core_id, "isolated core");
        Ok(MutationReport::applied(format!("cpu{}", core_id)))
    }

    /// Group for a workload hint; falls back to `system` and never fails.
    ///
    /// `packet_processing` and `high_priority` workloads, or anything at the
    /// packet group's priority, go to `packet` when it exists.
    pub fn get_optimal_core_group(&self, workload_type: &str, priority: u32) -> String {
        let wants_packet = matches!(workload_type, "packet_processing" | "high_priority")
            || priority >= PACKET_PRIORITY;

        if wants_packet && self.state.read().groups.contains_key(PACKET_GROUP) {
            PACKET_GROUP.to_string()
        } else {
            SYSTEM_GROUP.to_string()
        }
    }

    /// Record `service_id` in the group chosen for `workload_type`
    pub fn assign_service(&self, service_id: u64, workload_type: &str) -> String {
        let group = self.get_optimal_core_group(workload_type, 0);

        let mut state = self.state.write();
        for g in state.groups.values_mut() {
            g.assigned_services.retain(|&id| id != service_id);
        }
        if let Some(g) = state.groups.get_mut(&group) {
            g.assigned_services.push(service_id);
            g.touch();
        }
        group
    }

    /// Replace all service placements with `services` (`(id, workload)` pairs)
    pub fn sync_services(&self, services: &[(u64, &str)]) -> MutationReport {
        {
            let mut state = self.state.write();
            for g in state.groups.values_mut() {
                g.assigned_services.clear();
            }
        }

        let mut report = MutationReport::new();
        for &(id, workload) in services {
            let group = self.assign_service(id, workload);
            report.record_applied(format!("service/{} -> {}", id, group));
        }
        report
    }

    pub fn get_topology(&self) -> Option<Arc<CpuTopology>> {
        self.state.read().topology.clone()
    }

    pub fn get_core_groups(&self) -> Vec<CoreGroup> {
        self.state.read().groups.values().cloned().collect()
    }

    pub fn get_core_group(&self, name: &str) -> Option<CoreGroup> {
        self.state.read().groups.get(name).cloned()
    }

    pub fn isolated_cores(&self) -> Vec<usize> {
        self.state.read().isolated.iter().copied().collect()
    }

    /// Latest per-CPU utilization
    pub fn cpu_loads(&self) -> BTreeMap<usize, f64> {
        self.state.read().cpu_load.clone()
    }

    pub fn get_stats(&self) -> AffinityStats {
        self.state.read().stats.clone()
    }

    async fn start_collector(&self) {
        let mut slot = self.collector.lock().await;
        if slot.is_some() {
            return;
        }

        let host = self.host.clone();
        let state = self.state.clone();
        let threshold = self.config.load_threshold;
        *slot = Some(Collector::spawn("cpu", self.config.stats_interval, move || {
            let host = host.clone();
            let state = state.clone();
            async move { collect(host.as_ref(), &state, threshold) }
        }));
    }

    /// Refresh statistics now instead of waiting for the next tick
    pub fn refresh_stats(&self) {
        collect(self.host.as_ref(), &self.state, self.config.load_threshold);
    }

    /// Stop the collector and release all groups. Idempotent.
    pub async fn stop(&self) {
        if let Some(mut collector) = self.collector.lock().await.take() {
            collector.stop().await;
        }

        let mut state = self.state.write();
        if state.phase == AffinityPhase::Disabled || state.phase == AffinityPhase::Uninitialized {
            return;
        }

        state.groups.clear();
        state.isolated.clear();
        state.topology = None;
        state.cpu_load.clear();
        state.prev_times.clear();
        state.prev_ctxt = None;
        state.stats = AffinityStats::default();
        state.phase = AffinityPhase::Uninitialized;
        info!("CPU affinity manager stopped");
    }
}

fn collect(host: &dyn HostProbe, state: &RwLock<AffinityState>, threshold: f64) {
    if state.read().phase != AffinityPhase::Initialized {
        return;
    }

    let stat = match host.read_proc_stat() {
        Ok(raw) => ProcStat::parse(&raw),
        Err(e) => {
            debug!(error = %e, "proc stat unreadable, skipping CPU statistics");
            return;
        }
    };

    let now = Utc::now();
    let mut guard = state.write();
    let state = &mut *guard;
    if state.phase != AffinityPhase::Initialized {
        return;
    }

    for (&cpu, &times) in &stat.cpus {
        if let Some(prev) = state.prev_times.insert(cpu, times) {
            state.cpu_load.insert(cpu, utilization(prev, times));
        }
    }

    let context_switches = state
        .prev_ctxt
        .map(|prev| stat.context_switches.saturating_sub(prev))
        .unwrap_or(0);
    state.prev_ctxt = Some(stat.context_switches);

    let window = Duration::seconds(ACTIVITY_WINDOW_SECS);
    let mut active_groups = 0;
    for group in state.groups.values_mut() {
        let loads: Vec<f64> = group
            .cpus
            .iter()
            .filter_map(|cpu| state.cpu_load.get(cpu).copied())
            .collect();

        if !loads.is_empty() {
            group.stats.average_load = loads.iter().sum::<f64>() / loads.len() as f64;
            group.stats.peak_load = loads.iter().copied().fold(0.0, f64::max);
        }

        if group.stats.average_load > threshold {
            warn!(group = %group.name, load = group.stats.average_load, "core group above load threshold");
        }
        if group.stats.last_activity.map(|t| now - t <= window).unwrap_or(false) {
            active_groups += 1;
        }
        metrics::gauge!("netaccel_core_group_load", "group" => group.name.clone()).set(group.stats.average_load);
    }

    let overall = if state.cpu_load.is_empty() {
        0.0
    } else {
        state.cpu_load.values().sum::<f64>() / state.cpu_load.len() as f64
    };

    state.stats.active_groups = active_groups;
    state.stats.average_load = overall;
    state.stats.context_switches = context_switches;
    state.stats.total_groups = state.groups.len();
    state.stats.last_update = Some(now);
    debug!(load = overall, active_groups, "CPU statistics refreshed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use netaccel_common::testing::FakeHost;
    use netaccel_common::Outcome;
    use proptest::prelude::*;
    use std::time::Duration as StdDuration;

    fn config() -> CpuAffinityConfig {
        CpuAffinityConfig {
            stats_interval: StdDuration::from_secs(60),
            ..Default::default()
        }
    }

    fn host(sockets: usize, cores: usize, threads: usize) -> Arc<FakeHost> {
        Arc::new(
            FakeHost::new()
                .with_cmdline("BOOT_IMAGE=/vmlinuz isolcpus=2,3,6,7")
                .with_cpu_layout(sockets, cores, threads),
        )
    }

    fn assert_partition(manager: &CpuAffinityManager) {
        let topology = manager.get_topology().unwrap();
        let system = manager.get_core_group(SYSTEM_GROUP).unwrap().cpus;
        let packet = manager
            .get_core_group(PACKET_GROUP)
            .map(|g| g.cpus)
            .unwrap_or_default();

        let system_set: BTreeSet<usize> = system.iter().copied().collect();
        let packet_set: BTreeSet<usize> = packet.iter().copied().collect();
        assert!(system_set.is_disjoint(&packet_set));
        assert!(!system_set.is_empty());

        let union: Vec<usize> = system_set.union(&packet_set).copied().collect();
        assert_eq!(union, topology.all_cpus());
        assert_eq!(packet, manager.isolated_cores());
    }

    #[tokio::test]
    async fn test_two_socket_auto_isolation() {
        let manager = CpuAffinityManager::new(config(), host(2, 4, 1));
        manager.initialize().await.unwrap();

        assert_eq!(manager.phase(), AffinityPhase::Initialized);
        assert_eq!(manager.isolated_cores(), vec![2, 3, 6, 7]);

        let packet = manager.get_core_group(PACKET_GROUP).unwrap();
        assert_eq!(packet.cpus, vec![2, 3, 6, 7]);
        assert!(packet.exclusive);
        assert_eq!(packet.priority, 10);

        let system = manager.get_core_group(SYSTEM_GROUP).unwrap();
        assert_eq!(system.cpus, vec![0, 1, 4, 5]);
        assert!(!system.exclusive);

        assert_eq!(manager.get_optimal_core_group("packet_processing", 0), PACKET_GROUP);
        assert_eq!(manager.get_optimal_core_group("general", 0), SYSTEM_GROUP);

        let stats = manager.get_stats();
        assert_eq!(stats.total_cpus, 8);
        assert_eq!(stats.isolated_cpus, 4);
        assert_eq!(stats.total_groups, 2);
        assert_partition(&manager);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_isolate_core_twice() {
        let manager = CpuAffinityManager::new(config(), host(2, 4, 1));
        manager.initialize().await.unwrap();

        let report = manager.isolate_core(1).unwrap();
        assert_eq!(report.outcome(), Outcome::Applied);
        assert_eq!(manager.isolated_cores(), vec![1, 2, 3, 6, 7]);

        let err = manager.isolate_core(1).unwrap_err();
        assert!(matches!(err, AffinityError::AlreadyIsolated(1)));
        assert_eq!(manager.isolated_cores().len(), 5);
        assert_eq!(manager.get_core_group(PACKET_GROUP).unwrap().cpus, vec![1, 2, 3, 6, 7]);
        assert_partition(&manager);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_isolate_core_guards() {
        let manager = CpuAffinityManager::new(config(), host(1, 2, 1));
        assert!(matches!(manager.isolate_core(0), Err(AffinityError::NotInitialized)));

        manager.initialize().await.unwrap();
        // Two CPUs is below the auto-isolation minimum
        assert!(manager.isolated_cores().is_empty());
        assert!(manager.get_core_group(PACKET_GROUP).is_none());
        assert_eq!(manager.get_optimal_core_group("packet_processing", 0), SYSTEM_GROUP);

        assert!(matches!(manager.isolate_core(9), Err(AffinityError::CoreNotFound(9))));

        manager.isolate_core(1).unwrap();
        assert_eq!(manager.get_core_group(PACKET_GROUP).unwrap().cpus, vec![1]);
        assert_eq!(manager.get_optimal_core_group("packet_processing", 0), PACKET_GROUP);

        assert!(matches!(manager.isolate_core(0), Err(AffinityError::LastSystemCore(0))));
        assert_partition(&manager);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_explicit_isolated_cores() {
        let cfg = CpuAffinityConfig {
            isolated_cores: vec![5, 1],
            ..config()
        };
        let manager = CpuAffinityManager::new(cfg, host(2, 4, 1));
        manager.initialize().await.unwrap();

        assert_eq!(manager.isolated_cores(), vec![1, 5]);
        assert_eq!(manager.get_core_group(SYSTEM_GROUP).unwrap().cpus, vec![0, 2, 3, 4, 6, 7]);
        assert_partition(&manager);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_isolated_cores_revert_phase() {
        let unknown = CpuAffinityConfig {
            isolated_cores: vec![1, 42],
            ..config()
        };
        let manager = CpuAffinityManager::new(unknown, host(1, 4, 1));
        assert!(matches!(manager.initialize().await, Err(AffinityError::CoreNotFound(42))));
        assert_eq!(manager.phase(), AffinityPhase::Uninitialized);
        assert!(manager.get_topology().is_none());

        let everything = CpuAffinityConfig {
            isolated_cores: vec![0, 1, 2, 3],
            ..config()
        };
        let manager = CpuAffinityManager::new(everything, host(1, 4, 1));
        assert!(matches!(manager.initialize().await, Err(AffinityError::InvalidConfig(_))));
        assert_eq!(manager.phase(), AffinityPhase::Uninitialized);
    }

    #[tokio::test]
    async fn test_isolation_disabled() {
        let cfg = CpuAffinityConfig {
            enable_isolation: false,
            ..config()
        };
        let manager = CpuAffinityManager::new(cfg, host(2, 4, 1));
        manager.initialize().await.unwrap();

        assert!(manager.isolated_cores().is_empty());
        assert_eq!(manager.get_core_groups().len(), 1);
        assert_eq!(manager.get_core_group(SYSTEM_GROUP).unwrap().cpus.len(), 8);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_affinity_binding() {
        let host = host(2, 4, 1);
        let manager = CpuAffinityManager::new(config(), host.clone());
        manager.initialize().await.unwrap();

        let report = manager.set_thread_affinity(PACKET_GROUP, 0).unwrap();
        assert!(report.is_applied());
        manager.set_process_affinity(SYSTEM_GROUP, 4242).unwrap();

        assert_eq!(
            host.affinity_calls(),
            vec![(0, vec![2, 3, 6, 7]), (4242, vec![0, 1, 4, 5])]
        );

        let packet = manager.get_core_group(PACKET_GROUP).unwrap();
        assert_eq!(packet.stats.bindings, 1);
        assert!(packet.stats.last_activity.is_some());

        assert!(matches!(
            manager.set_thread_affinity("nope", 0),
            Err(AffinityError::GroupNotFound(_))
        ));

        host.fail_affinity(true);
        let err = manager.set_process_affinity(PACKET_GROUP, 7).unwrap_err();
        assert!(matches!(err, AffinityError::Bind { ref cpus, .. } if cpus == &vec![2, 3, 6, 7]));
        assert_eq!(manager.get_core_group(PACKET_GROUP).unwrap().stats.bindings, 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_bind_threads_partial() {
        let host = host(1, 4, 1);
        let manager = CpuAffinityManager::new(config(), host.clone());
        manager.initialize().await.unwrap();

        let report = manager.bind_threads(PACKET_GROUP, &[10, 11]).unwrap();
        assert_eq!(report.applied_items().len(), 2);

        host.fail_affinity(true);
        let report = manager.bind_threads(PACKET_GROUP, &[12]).unwrap();
        assert!(report.nothing_applied());

        assert!(manager.bind_threads("missing", &[1]).is_err());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_priority_routes_to_packet() {
        let manager = CpuAffinityManager::new(config(), host(1, 4, 1));
        manager.initialize().await.unwrap();

        assert_eq!(manager.get_optimal_core_group("high_priority", 0), PACKET_GROUP);
        assert_eq!(manager.get_optimal_core_group("batch", 10), PACKET_GROUP);
        assert_eq!(manager.get_optimal_core_group("batch", 9), SYSTEM_GROUP);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_service_placement() {
        let manager = CpuAffinityManager::new(config(), host(1, 4, 1));
        manager.initialize().await.unwrap();

        assert_eq!(manager.assign_service(1, "packet_processing"), PACKET_GROUP);
        assert_eq!(manager.assign_service(2, "general"), SYSTEM_GROUP);
        // Moving a service removes it from its previous group
        assert_eq!(manager.assign_service(1, "general"), SYSTEM_GROUP);
        assert!(manager.get_core_group(PACKET_GROUP).unwrap().assigned_services.is_empty());

        let report = manager.sync_services(&[(7, "packet_processing")]);
        assert!(report.is_applied());
        assert_eq!(manager.get_core_group(PACKET_GROUP).unwrap().assigned_services, vec![7]);
        assert!(manager.get_core_group(SYSTEM_GROUP).unwrap().assigned_services.is_empty());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_load_statistics() {
        let host = host(1, 4, 1);
        let manager = CpuAffinityManager::new(config(), host.clone());
        manager.initialize().await.unwrap();

        host.set_proc_stat(
            "cpu0 0 0 0 100 0 0 0 0\ncpu1 0 0 0 100 0 0 0 0\ncpu2 0 0 0 100 0 0 0 0\ncpu3 0 0 0 100 0 0 0 0\nctxt 500\n",
        );
        manager.refresh_stats();
        assert_eq!(manager.get_stats().context_switches, 0);

        host.set_proc_stat(
            "cpu0 50 0 0 150 0 0 0 0\ncpu1 0 0 0 200 0 0 0 0\ncpu2 100 0 0 100 0 0 0 0\ncpu3 50 0 0 150 0 0 0 0\nctxt 800\n",
        );
        manager.set_thread_affinity(PACKET_GROUP, 0).unwrap();
        manager.refresh_stats();

        let stats = manager.get_stats();
        assert_eq!(stats.context_switches, 300);
        assert!((stats.average_load - 0.5).abs() < 1e-9);
        assert_eq!(stats.active_groups, 1);
        assert!(stats.last_update.is_some());

        let packet = manager.get_core_group(PACKET_GROUP).unwrap();
        assert!((packet.stats.average_load - 0.75).abs() < 1e-9);
        assert!((packet.stats.peak_load - 1.0).abs() < 1e-9);

        let system = manager.get_core_group(SYSTEM_GROUP).unwrap();
        assert!((system.stats.average_load - 0.25).abs() < 1e-9);
        assert!((manager.cpu_loads()[&1]).abs() < 1e-9);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let disabled = CpuAffinityManager::new(
            CpuAffinityConfig {
                enabled: false,
                ..config()
            },
            host(1, 4, 1),
        );
        assert!(matches!(disabled.initialize().await, Err(AffinityError::Disabled)));
        assert_eq!(disabled.phase(), AffinityPhase::Disabled);
        disabled.stop().await;

        let manager = CpuAffinityManager::new(config(), host(1, 4, 1));
        manager.initialize().await.unwrap();
        assert!(matches!(manager.initialize().await, Err(AffinityError::AlreadyInitialized)));

        manager.stop().await;
        manager.stop().await;
        assert_eq!(manager.phase(), AffinityPhase::Uninitialized);
        assert!(manager.get_core_groups().is_empty());
        assert!(manager.isolated_cores().is_empty());
        assert!(matches!(
            manager.set_thread_affinity(SYSTEM_GROUP, 0),
            Err(AffinityError::NotInitialized)
        ));

        // Re-initialization after stop
        manager.initialize().await.unwrap();
        assert_eq!(manager.isolated_cores(), vec![2, 3]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_missing_topology() {
        let manager = CpuAffinityManager::new(config(), Arc::new(FakeHost::new()));
        assert!(matches!(
            manager.initialize().await,
            Err(AffinityError::TopologyUnavailable(_))
        ));
        assert_eq!(manager.phase(), AffinityPhase::Uninitialized);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_groups_partition_cpus(
            sockets in 1usize..4,
            cores in 1usize..6,
            threads in 1usize..3,
            extra in proptest::collection::vec(0usize..24, 0..6),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let manager = CpuAffinityManager::new(config(), host(sockets, cores, threads));
                manager.initialize().await.unwrap();
                assert_partition(&manager);

                for core in extra {
                    let _ = manager.isolate_core(core);
                    assert_partition(&manager);
                }
                manager.stop().await;
            });
        }
    }
}
