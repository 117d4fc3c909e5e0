//! In-memory [`HostProbe`] for tests.
//!
//! Mimics the kernel behaviors the managers depend on: `sriov_numvfs` must be
//! zeroed before a new non-zero count is accepted, VF PCI functions and
//! netdevs appear once the count is written, and counters are readable only
//! for interfaces that exist.

use crate::host::{HostProbe, InterfaceCounters, SriovCapability, VfAttributes};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::thread::{self, ThreadId};

/// Fake network interface
#[derive(Debug, Clone, Default)]
pub struct FakeInterface {
    pub driver: Option<String>,
    pub pci_address: Option<String>,
    pub numa_node: Option<i32>,
    pub queues: usize,
    pub features: HashMap<String, bool>,
    pub counters: Option<InterfaceCounters>,
}

impl FakeInterface {
    pub fn new(driver: &str) -> Self {
        Self {
            driver: Some(driver.to_string()),
            queues: 1,
            counters: Some(InterfaceCounters::default()),
            ..Default::default()
        }
    }

    pub fn pci(mut self, addr: &str) -> Self {
        self.pci_address = Some(addr.to_string());
        self
    }

    pub fn numa(mut self, node: i32) -> Self {
        self.numa_node = Some(node);
        self
    }

    pub fn queues(mut self, queues: usize) -> Self {
        self.queues = queues;
        self
    }

    pub fn feature(mut self, name: &str, on: bool) -> Self {
        self.features.insert(name.to_string(), on);
        self
    }
}

/// Fake PCI function
#[derive(Debug, Clone, Default)]
pub struct FakePciDevice {
    pub driver: Option<String>,
    pub ids: Option<(u16, u16)>,
    pub net_iface: Option<String>,
    pub total_vfs: Option<u32>,
    pub num_vfs: u32,
    pub virtfns: Vec<(u32, String)>,
    pub attributes: HashSet<String>,
}

/// Fake per-CPU sysfs data
#[derive(Debug, Clone, Default)]
pub struct FakeCpu {
    pub siblings: Option<String>,
    pub node: Option<u32>,
    pub governor: Option<String>,
}

#[derive(Default)]
struct FakeState {
    cpuinfo: Option<String>,
    meminfo: Option<String>,
    kernel_version: Option<String>,
    cmdline: Option<String>,
    proc_stat: Option<String>,
    numa_nodes: Vec<u32>,
    interfaces: BTreeMap<String, FakeInterface>,
    pci: BTreeMap<String, FakePciDevice>,
    cpus: BTreeMap<usize, FakeCpu>,
    interface_scan_fails: bool,
    pci_scan_fails: bool,
    failing_num_vfs: HashSet<String>,
    fail_vf_attributes: bool,
    fail_affinity: bool,
    num_vfs_writes: Vec<(String, u32)>,
    vf_attribute_calls: Vec<(String, u32, VfAttributes)>,
    affinity_calls: Vec<(i32, Vec<usize>)>,
    mutation_threads: Vec<ThreadId>,
}

/// In-memory host
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

fn missing(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not present", what))
}

/// PCI address of VF `index` under `pf` (`0000:03:00.0` -> `0000:03:10.0`, ...)
pub fn vf_pci_address(pf: &str, index: u32) -> String {
    let bus = pf.rsplit_once(':').map(|(bus, _)| bus).unwrap_or(pf);
    format!("{}:{:02x}.{}", bus, 0x10 + index / 8, index % 8)
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpuinfo(self, cpuinfo: &str) -> Self {
        self.state.lock().cpuinfo = Some(cpuinfo.to_string());
        self
    }

    pub fn with_meminfo(self, meminfo: &str) -> Self {
        self.state.lock().meminfo = Some(meminfo.to_string());
        self
    }

    pub fn with_kernel_version(self, version: &str) -> Self {
        self.state.lock().kernel_version = Some(version.to_string());
        self
    }

    pub fn with_cmdline(self, cmdline: &str) -> Self {
        self.state.lock().cmdline = Some(cmdline.to_string());
        self
    }

    pub fn with_numa_nodes(self, nodes: &[u32]) -> Self {
        self.state.lock().numa_nodes = nodes.to_vec();
        self
    }

    pub fn with_interface(self, name: &str, iface: FakeInterface) -> Self {
        self.state.lock().interfaces.insert(name.to_string(), iface);
        self
    }

    pub fn with_pci_device(self, addr: &str, device: FakePciDevice) -> Self {
        self.state.lock().pci.insert(addr.to_string(), device);
        self
    }

    /// SR-IOV capable PF with no VFs enabled
    pub fn with_sriov_pf(self, addr: &str, driver: &str, net_iface: &str, total_vfs: u32) -> Self {
        let device = FakePciDevice {
            driver: Some(driver.to_string()),
            ids: Some((0x8086, 0x1572)),
            net_iface: Some(net_iface.to_string()),
            total_vfs: Some(total_vfs),
            attributes: ["sriov_vf_device", "sriov_drivers_autoprobe"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..Default::default()
        };
        let iface = FakeInterface::new(driver).pci(addr);
        self.with_pci_device(addr, device).with_interface(net_iface, iface)
    }

    pub fn with_cpu(self, cpu: usize, data: FakeCpu) -> Self {
        self.state.lock().cpus.insert(cpu, data);
        self
    }

    /// Uniform layout: CPUs numbered socket by socket, NUMA node == socket.
    ///
    /// Writes `/proc/cpuinfo` plus per-CPU sibling, node and governor data.
    pub fn with_cpu_layout(self, sockets: usize, cores_per_socket: usize, threads_per_core: usize) -> Self {
        let threads_per_core = threads_per_core.max(1);
        let cpus_per_socket = cores_per_socket * threads_per_core;
        let mut cpuinfo = String::new();

        {
            let mut state = self.state.lock();
            for socket in 0..sockets {
                for slot in 0..cpus_per_socket {
                    let cpu = socket * cpus_per_socket + slot;
                    let core = slot / threads_per_core;
                    cpuinfo.push_str(&format!(
                        "processor\t: {}\nmodel name\t: Fake Xeon @ 2.40GHz\nphysical id\t: {}\ncore id\t\t: {}\ncpu MHz\t\t: 2400.000\nflags\t\t: fpu sse sse2 avx avx2\n\n",
                        cpu, socket, core
                    ));

                    let first = socket * cpus_per_socket + core * threads_per_core;
                    let siblings = if threads_per_core == 1 {
                        first.to_string()
                    } else {
                        format!("{}-{}", first, first + threads_per_core - 1)
                    };
                    state.cpus.insert(
                        cpu,
                        FakeCpu {
                            siblings: Some(siblings),
                            node: Some(socket as u32),
                            governor: Some("performance".to_string()),
                        },
                    );
                }
            }
            state.cpuinfo = Some(cpuinfo);
            state.numa_nodes = (0..sockets as u32).collect();
        }
        self
    }

    pub fn set_proc_stat(&self, contents: &str) {
        self.state.lock().proc_stat = Some(contents.to_string());
    }

    pub fn set_counters(&self, iface: &str, counters: InterfaceCounters) {
        let mut state = self.state.lock();
        state
            .interfaces
            .entry(iface.to_string())
            .or_default()
            .counters = Some(counters);
    }

    pub fn fail_interface_scan(self) -> Self {
        self.set_interface_scan_failing(true);
        self
    }

    pub fn set_interface_scan_failing(&self, fail: bool) {
        self.state.lock().interface_scan_fails = fail;
    }

    pub fn fail_pci_scan(self) -> Self {
        self.state.lock().pci_scan_fails = true;
        self
    }

    pub fn fail_num_vfs_writes(&self, pci_addr: &str) {
        self.state.lock().failing_num_vfs.insert(pci_addr.to_string());
    }

    pub fn fail_vf_attributes(&self, fail: bool) {
        self.state.lock().fail_vf_attributes = fail;
    }

    pub fn fail_affinity(&self, fail: bool) {
        self.state.lock().fail_affinity = fail;
    }

    pub fn num_vfs(&self, pci_addr: &str) -> u32 {
        self.state.lock().pci.get(pci_addr).map(|d| d.num_vfs).unwrap_or(0)
    }

    /// Every `sriov_numvfs` write, in order
    pub fn num_vfs_writes(&self) -> Vec<(String, u32)> {
        self.state.lock().num_vfs_writes.clone()
    }

    pub fn vf_attribute_calls(&self) -> Vec<(String, u32, VfAttributes)> {
        self.state.lock().vf_attribute_calls.clone()
    }

    pub fn affinity_calls(&self) -> Vec<(i32, Vec<usize>)> {
        self.state.lock().affinity_calls.clone()
    }

    /// Threads that issued `sriov_numvfs` or VF attribute writes
    pub fn mutation_threads(&self) -> Vec<ThreadId> {
        self.state.lock().mutation_threads.clone()
    }
}

impl HostProbe for FakeHost {
    fn read_cpuinfo(&self) -> io::Result<String> {
        self.state.lock().cpuinfo.clone().ok_or_else(|| missing("/proc/cpuinfo"))
    }

    fn read_meminfo(&self) -> io::Result<String> {
        self.state.lock().meminfo.clone().ok_or_else(|| missing("/proc/meminfo"))
    }

    fn read_kernel_version(&self) -> io::Result<String> {
        self.state.lock().kernel_version.clone().ok_or_else(|| missing("/proc/version"))
    }

    fn read_cmdline(&self) -> io::Result<String> {
        self.state.lock().cmdline.clone().ok_or_else(|| missing("/proc/cmdline"))
    }

    fn read_proc_stat(&self) -> io::Result<String> {
        self.state.lock().proc_stat.clone().ok_or_else(|| missing("/proc/stat"))
    }

    fn list_numa_nodes(&self) -> Vec<u32> {
        self.state.lock().numa_nodes.clone()
    }

    fn list_network_interfaces(&self) -> io::Result<Vec<String>> {
        let state = self.state.lock();
        if state.interface_scan_fails {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "/sys/class/net unreadable"));
        }
        let mut names: Vec<String> = state.interfaces.keys().cloned().collect();
        names.push("lo".to_string());
        names.sort();
        Ok(names)
    }

    fn interface_driver(&self, iface: &str) -> Option<String> {
        self.state.lock().interfaces.get(iface)?.driver.clone()
    }

    fn interface_pci_address(&self, iface: &str) -> Option<String> {
        self.state.lock().interfaces.get(iface)?.pci_address.clone()
    }

    fn interface_numa_node(&self, iface: &str) -> Option<i32> {
        self.state.lock().interfaces.get(iface)?.numa_node
    }

    fn interface_queue_count(&self, iface: &str) -> usize {
        self.state.lock().interfaces.get(iface).map(|i| i.queues).unwrap_or(0)
    }

    fn interface_feature(&self, iface: &str, feature: &str) -> Option<bool> {
        self.state.lock().interfaces.get(iface)?.features.get(feature).copied()
    }

    fn interface_counters(&self, iface: &str) -> io::Result<InterfaceCounters> {
        self.state
            .lock()
            .interfaces
            .get(iface)
            .and_then(|i| i.counters)
            .ok_or_else(|| missing(iface))
    }

    fn list_pci_devices(&self) -> io::Result<Vec<String>> {
        let state = self.state.lock();
        if state.pci_scan_fails {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "/sys/bus/pci/devices unreadable"));
        }
        Ok(state.pci.keys().cloned().collect())
    }

    fn read_sriov_capability(&self, pci_addr: &str) -> Option<SriovCapability> {
        let state = self.state.lock();
        let device = state.pci.get(pci_addr)?;
        Some(SriovCapability {
            total_vfs: device.total_vfs?,
            num_vfs: device.num_vfs,
        })
    }

    fn pci_driver(&self, pci_addr: &str) -> Option<String> {
        self.state.lock().pci.get(pci_addr)?.driver.clone()
    }

    fn pci_ids(&self, pci_addr: &str) -> Option<(u16, u16)> {
        self.state.lock().pci.get(pci_addr)?.ids
    }

    fn pci_net_interface(&self, pci_addr: &str) -> Option<String> {
        self.state.lock().pci.get(pci_addr)?.net_iface.clone()
    }

    fn list_virtfns(&self, pci_addr: &str) -> Vec<(u32, String)> {
        self.state
            .lock()
            .pci
            .get(pci_addr)
            .map(|d| d.virtfns.clone())
            .unwrap_or_default()
    }

    fn pci_has_attribute(&self, pci_addr: &str, attribute: &str) -> bool {
        self.state
            .lock()
            .pci
            .get(pci_addr)
            .map(|d| d.attributes.contains(attribute))
            .unwrap_or(false)
    }

    fn write_sriov_num_vfs(&self, pci_addr: &str, count: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        state.num_vfs_writes.push((pci_addr.to_string(), count));
        state.mutation_threads.push(thread::current().id());

        if state.failing_num_vfs.contains(pci_addr) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "write to sriov_numvfs denied"));
        }

        let device = state.pci.get(pci_addr).ok_or_else(|| missing(pci_addr))?;
        let total = device.total_vfs.ok_or_else(|| missing("sriov_totalvfs"))?;
        if count > total {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "count exceeds sriov_totalvfs"));
        }
        if device.num_vfs != 0 && count != 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "Device or resource busy"));
        }

        let pf_iface = device.net_iface.clone();

        // Drop previously materialized VFs
        let old: Vec<String> = device.virtfns.iter().map(|(_, addr)| addr.clone()).collect();
        for addr in old {
            if let Some(vf) = state.pci.remove(&addr) {
                if let Some(iface) = vf.net_iface {
                    state.interfaces.remove(&iface);
                }
            }
        }

        let mut virtfns = Vec::with_capacity(count as usize);
        for index in 0..count {
            let addr = vf_pci_address(pci_addr, index);
            let vf_iface = pf_iface.as_ref().map(|pf| format!("{}v{}", pf, index));

            if let Some(name) = &vf_iface {
                state
                    .interfaces
                    .insert(name.clone(), FakeInterface::new("iavf").pci(&addr));
            }
            state.pci.insert(
                addr.clone(),
                FakePciDevice {
                    driver: Some("iavf".to_string()),
                    net_iface: vf_iface,
                    ..Default::default()
                },
            );
            virtfns.push((index, addr));
        }

        if let Some(device) = state.pci.get_mut(pci_addr) {
            device.num_vfs = count;
            device.virtfns = virtfns;
        }
        Ok(())
    }

    fn set_vf_attributes(&self, pf_iface: &str, vf_index: u32, attrs: &VfAttributes) -> io::Result<()> {
        let mut state = self.state.lock();
        state.mutation_threads.push(thread::current().id());
        if state.fail_vf_attributes {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "RTNETLINK answers: Operation not permitted"));
        }
        state
            .vf_attribute_calls
            .push((pf_iface.to_string(), vf_index, attrs.clone()));
        Ok(())
    }

    fn cpu_thread_siblings(&self, cpu: usize) -> Option<String> {
        self.state.lock().cpus.get(&cpu)?.siblings.clone()
    }

    fn cpu_numa_node(&self, cpu: usize) -> Option<u32> {
        self.state.lock().cpus.get(&cpu)?.node
    }

    fn cpu_governor(&self, cpu: usize) -> Option<String> {
        self.state.lock().cpus.get(&cpu)?.governor.clone()
    }

    fn set_affinity(&self, pid: i32, cpus: &[usize]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_affinity {
            return Err(io::Error::from_raw_os_error(1));
        }
        state.affinity_calls.push((pid, cpus.to_vec()));
        Ok(())
    }
}
