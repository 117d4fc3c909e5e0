//! CPU topology discovery

use crate::{AffinityError, Result};
use netaccel_common::{parse_cpu_list, HostProbe};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One logical CPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cpu_id: usize,
    pub core_id: u32,
    pub socket_id: u32,
    pub numa_node: Option<u32>,
    pub frequency_mhz: f64,
    pub governor: Option<String>,
    pub siblings: Vec<usize>,
    /// Utilization over the last collector interval (0.0 - 1.0)
    pub load: f64,
}

/// Immutable topology snapshot.
///
/// `threads_per_core` and `cores_per_socket` are derived by division and
/// are only approximate on hosts with mixed SMT settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub num_cpus: usize,
    /// Distinct core ids, which repeat across sockets
    pub num_cores: usize,
    pub num_sockets: usize,
    pub threads_per_core: usize,
    pub cores_per_socket: usize,
    pub cpus: BTreeMap<usize, CpuInfo>,
    pub socket_cpus: BTreeMap<u32, Vec<usize>>,
    pub numa_cpus: BTreeMap<u32, Vec<usize>>,
    pub sibling_map: BTreeMap<usize, Vec<usize>>,
}

struct CpuinfoEntry {
    cpu: usize,
    core_id: u32,
    socket_id: u32,
    mhz: f64,
}

fn parse_cpuinfo(cpuinfo: &str) -> Vec<CpuinfoEntry> {
    let mut entries = Vec::new();
    let mut current: Option<CpuinfoEntry> = None;

    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "processor" => {
                if let Some(done) = current.take() {
                    entries.push(done);
                }
                if let Ok(cpu) = value.parse() {
                    current = Some(CpuinfoEntry { cpu, core_id: cpu as u32, socket_id: 0, mhz: 0.0 });
                }
            }
            "core id" => {
                if let (Some(entry), Ok(id)) = (current.as_mut(), value.parse()) {
                    entry.core_id = id;
                }
            }
            "physical id" => {
                if let (Some(entry), Ok(id)) = (current.as_mut(), value.parse()) {
                    entry.socket_id = id;
                }
            }
            "cpu MHz" => {
                if let (Some(entry), Ok(mhz)) = (current.as_mut(), value.parse()) {
                    entry.mhz = mhz;
                }
            }
            _ => {}
        }
    }

    if let Some(done) = current {
        entries.push(done);
    }
    entries
}

impl CpuTopology {
    pub fn discover(host: &dyn HostProbe) -> Result<Self> {
        let cpuinfo = host
            .read_cpuinfo()
            .map_err(|e| AffinityError::TopologyUnavailable(e.to_string()))?;

        let entries = parse_cpuinfo(&cpuinfo);
        if entries.is_empty() {
            return Err(AffinityError::TopologyUnavailable(
                "no processors listed in cpuinfo".to_string(),
            ));
        }

        let mut cpus = BTreeMap::new();
        for entry in entries {
            let siblings = host
                .cpu_thread_siblings(entry.cpu)
                .map(|list| parse_cpu_list(&list))
                .filter(|list| !list.is_empty())
                .unwrap_or_else(|| vec![entry.cpu]);

            cpus.insert(
                entry.cpu,
                CpuInfo {
                    cpu_id: entry.cpu,
                    core_id: entry.core_id,
                    socket_id: entry.socket_id,
                    numa_node: host.cpu_numa_node(entry.cpu),
                    frequency_mhz: entry.mhz,
                    governor: host.cpu_governor(entry.cpu),
                    siblings,
                    load: 0.0,
                },
            );
        }

        Ok(Self::from_cpus(cpus))
    }

    pub(crate) fn from_cpus(cpus: BTreeMap<usize, CpuInfo>) -> Self {
        let mut socket_cpus: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        let mut numa_cpus: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        let mut sibling_map = BTreeMap::new();
        let mut cores = BTreeSet::new();

        for cpu in cpus.values() {
            socket_cpus.entry(cpu.socket_id).or_default().push(cpu.cpu_id);
            if let Some(node) = cpu.numa_node {
                numa_cpus.entry(node).or_default().push(cpu.cpu_id);
            }
            sibling_map.insert(cpu.cpu_id, cpu.siblings.clone());
            cores.insert(cpu.core_id);
        }

        let num_cpus = cpus.len();
        let num_cores = cores.len().max(1);
        let num_sockets = socket_cpus.len().max(1);

        Self {
            num_cpus,
            num_cores,
            num_sockets,
            threads_per_core: (num_cpus / num_cores).max(1),
            cores_per_socket: (num_cores / num_sockets).max(1),
            cpus,
            socket_cpus,
            numa_cpus,
            sibling_map,
        }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains_key(&cpu)
    }

    pub fn all_cpus(&self) -> Vec<usize> {
        self.cpus.keys().copied().collect()
    }

    /// Last two CPUs of every socket with at least four CPUs
    pub fn auto_isolation(&self) -> BTreeSet<usize> {
        self.socket_cpus
            .values()
            .filter(|cpus| cpus.len() >= 4)
            .flat_map(|cpus| cpus[cpus.len() - 2..].iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netaccel_common::testing::FakeHost;

    #[test]
    fn test_counts_are_derived() {
        let host = FakeHost::new().with_cpu_layout(2, 2, 2);
        let topo = CpuTopology::discover(&host).unwrap();

        // Core ids repeat on every socket, so only two distinct ones exist
        assert_eq!(topo.num_cpus, 8);
        assert_eq!(topo.num_cores, 2);
        assert_eq!(topo.num_sockets, 2);
        assert_eq!(topo.threads_per_core, 4);
        assert_eq!(topo.cores_per_socket, 1);
        assert_eq!(topo.sibling_map[&5], vec![4, 5]);
        assert_eq!(topo.numa_cpus[&1], vec![4, 5, 6, 7]);
        assert_eq!(topo.cpus[&3].governor.as_deref(), Some("performance"));
        assert!((topo.cpus[&0].frequency_mhz - 2400.0).abs() < 1e-9);
    }

    #[test]
    fn test_auto_isolation_skips_small_sockets() {
        let topo = CpuTopology::discover(&FakeHost::new().with_cpu_layout(2, 4, 1)).unwrap();
        assert_eq!(topo.auto_isolation().into_iter().collect::<Vec<_>>(), vec![2, 3, 6, 7]);

        let small = CpuTopology::discover(&FakeHost::new().with_cpu_layout(2, 3, 1)).unwrap();
        assert!(small.auto_isolation().is_empty());
    }

    #[test]
    fn test_missing_cpuinfo() {
        assert!(matches!(
            CpuTopology::discover(&FakeHost::new()),
            Err(AffinityError::TopologyUnavailable(_))
        ));
        assert!(CpuTopology::discover(&FakeHost::new().with_cpuinfo("garbage\n")).is_err());
    }

    #[test]
    fn test_sparse_sysfs_defaults() {
        let host = FakeHost::new().with_cpuinfo("processor\t: 0\n\nprocessor\t: 1\n");
        let topo = CpuTopology::discover(&host).unwrap();

        assert_eq!(topo.num_cpus, 2);
        assert_eq!(topo.num_sockets, 1);
        assert_eq!(topo.sibling_map[&1], vec![1]);
        assert!(topo.numa_cpus.is_empty());
    }
}
