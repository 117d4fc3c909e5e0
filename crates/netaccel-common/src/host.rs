//! Host information access
//!
//! All `/proc` and `/sys` traffic of the subsystem goes through [`HostProbe`]
//! so detection, discovery and topology logic can run against fixture data.
//! Reads are best-effort: `None` or an empty list means the source was
//! missing or unreadable, and callers degrade the affected capability.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Per-interface kernel counters from `/sys/class/net/<if>/statistics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl InterfaceCounters {
    pub fn packets(&self) -> u64 {
        self.rx_packets + self.tx_packets
    }

    pub fn errors(&self) -> u64 {
        self.rx_errors + self.tx_errors
    }
}

/// SR-IOV capability of a PCI device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SriovCapability {
    /// `sriov_totalvfs`
    pub total_vfs: u32,
    /// `sriov_numvfs`
    pub num_vfs: u32,
}

/// VF attributes applied through the PF netdev.
///
/// `None` leaves the attribute untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VfAttributes {
    pub mac: Option<String>,
    pub vlan: Option<u16>,
    pub vlan_qos: Option<u8>,
    pub min_tx_rate_mbps: Option<u32>,
    pub max_tx_rate_mbps: Option<u32>,
    pub spoof_check: Option<bool>,
    pub trust: Option<bool>,
}

impl VfAttributes {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Whether the boot parameters turn on an IOMMU
pub fn cmdline_iommu_enabled(cmdline: &str) -> bool {
    cmdline
        .split_whitespace()
        .any(|p| matches!(p, "intel_iommu=on" | "amd_iommu=on" | "iommu=pt" | "iommu=on"))
}

/// Read/write access to host system state (abstracted for testing)
pub trait HostProbe: Send + Sync {
    // -- procfs --------------------------------------------------------------

    fn read_cpuinfo(&self) -> io::Result<String>;

    fn read_meminfo(&self) -> io::Result<String>;

    /// Contents of `/proc/version`
    fn read_kernel_version(&self) -> io::Result<String>;

    /// Kernel boot parameters
    fn read_cmdline(&self) -> io::Result<String>;

    /// Contents of `/proc/stat`
    fn read_proc_stat(&self) -> io::Result<String>;

    /// NUMA node ids present under `/sys/devices/system/node`
    fn list_numa_nodes(&self) -> Vec<u32>;

    // -- network interfaces --------------------------------------------------

    /// All entries of `/sys/class/net`, loopback included
    fn list_network_interfaces(&self) -> io::Result<Vec<String>>;

    fn interface_driver(&self, iface: &str) -> Option<String>;

    fn interface_pci_address(&self, iface: &str) -> Option<String>;

    fn interface_numa_node(&self, iface: &str) -> Option<i32>;

    /// Number of TX queues
    fn interface_queue_count(&self, iface: &str) -> usize;

    /// Offload feature state (`rx-checksumming`, `generic-receive-offload`, ...)
    fn interface_feature(&self, iface: &str, feature: &str) -> Option<bool>;

    fn interface_counters(&self, iface: &str) -> io::Result<InterfaceCounters>;

    // -- PCI / SR-IOV --------------------------------------------------------

    fn list_pci_devices(&self) -> io::Result<Vec<String>>;

    fn read_sriov_capability(&self, pci_addr: &str) -> Option<SriovCapability>;

    fn pci_driver(&self, pci_addr: &str) -> Option<String>;

    /// `(vendor, device)` ids
    fn pci_ids(&self, pci_addr: &str) -> Option<(u16, u16)>;

    /// Netdev bound to the PCI function, if any
    fn pci_net_interface(&self, pci_addr: &str) -> Option<String>;

    /// `(vf index, vf pci address)` pairs resolved from `virtfnN` links
    fn list_virtfns(&self, pci_addr: &str) -> Vec<(u32, String)>;

    fn pci_has_attribute(&self, pci_addr: &str, attribute: &str) -> bool;

    /// Blocks until the driver has created or removed the VFs
    fn write_sriov_num_vfs(&self, pci_addr: &str, count: u32) -> io::Result<()>;

    /// Runs `ip link set dev <pf> vf <n> ...` and waits for it to exit
    fn set_vf_attributes(&self, pf_iface: &str, vf_index: u32, attrs: &VfAttributes) -> io::Result<()>;

    // -- CPU -----------------------------------------------------------------

    fn cpu_thread_siblings(&self, cpu: usize) -> Option<String>;

    fn cpu_numa_node(&self, cpu: usize) -> Option<u32>;

    fn cpu_governor(&self, cpu: usize) -> Option<String>;

    /// Bind a thread or process to `cpus`. `pid == 0` means the caller.
    fn set_affinity(&self, pid: i32, cpus: &[usize]) -> io::Result<()>;
}

/// [`HostProbe`] backed by the real procfs and sysfs
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    root: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsProbe {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Probe rooted at `root` instead of `/`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    fn read(&self, rel: &str) -> io::Result<String> {
        std::fs::read_to_string(self.path(rel))
    }

    fn read_trimmed(&self, rel: &str) -> Option<String> {
        self.read(rel).ok().map(|s| s.trim().to_string())
    }

    fn read_parsed<T: std::str::FromStr>(&self, rel: &str) -> Option<T> {
        self.read_trimmed(rel)?.parse().ok()
    }

    fn link_basename(&self, rel: &str) -> Option<String> {
        let target = std::fs::read_link(self.path(rel)).ok()?;
        basename(&target)
    }

    fn list_dir(&self, rel: &str) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(self.path(rel))?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }
}

fn basename(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

fn parse_hex_id(raw: &str) -> Option<u16> {
    u16::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok()
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

impl HostProbe for SysfsProbe {
    fn read_cpuinfo(&self) -> io::Result<String> {
        self.read("proc/cpuinfo")
    }

    fn read_meminfo(&self) -> io::Result<String> {
        self.read("proc/meminfo")
    }

    fn read_kernel_version(&self) -> io::Result<String> {
        self.read("proc/version")
    }

    fn read_cmdline(&self) -> io::Result<String> {
        self.read("proc/cmdline")
    }

    fn read_proc_stat(&self) -> io::Result<String> {
        self.read("proc/stat")
    }

    fn list_numa_nodes(&self) -> Vec<u32> {
        let mut nodes: Vec<u32> = self
            .list_dir("sys/devices/system/node")
            .unwrap_or_default()
            .iter()
            .filter_map(|n| n.strip_prefix("node"))
            .filter_map(|id| id.parse().ok())
            .collect();
        nodes.sort_unstable();
        nodes
    }

    fn list_network_interfaces(&self) -> io::Result<Vec<String>> {
        self.list_dir("sys/class/net")
    }

    fn interface_driver(&self, iface: &str) -> Option<String> {
        self.link_basename(&format!("sys/class/net/{}/device/driver", iface))
    }

    fn interface_pci_address(&self, iface: &str) -> Option<String> {
        self.link_basename(&format!("sys/class/net/{}/device", iface))
    }

    fn interface_numa_node(&self, iface: &str) -> Option<i32> {
        self.read_parsed(&format!("sys/class/net/{}/device/numa_node", iface))
    }

    fn interface_queue_count(&self, iface: &str) -> usize {
        self.list_dir(&format!("sys/class/net/{}/queues", iface))
            .map(|q| q.iter().filter(|n| n.starts_with("tx-")).count())
            .unwrap_or(0)
    }

    fn interface_feature(&self, iface: &str, feature: &str) -> Option<bool> {
        self.read_trimmed(&format!("sys/class/net/{}/features/{}", iface, feature))
            .map(|v| v == "on")
    }

    fn interface_counters(&self, iface: &str) -> io::Result<InterfaceCounters> {
        let base = format!("sys/class/net/{}/statistics", iface);
        if !self.path(&base).is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no statistics for {}", iface),
            ));
        }

        let counter = |name: &str| -> u64 {
            self.read_parsed(&format!("{}/{}", base, name)).unwrap_or(0)
        };

        Ok(InterfaceCounters {
            rx_packets: counter("rx_packets"),
            tx_packets: counter("tx_packets"),
            rx_bytes: counter("rx_bytes"),
            tx_bytes: counter("tx_bytes"),
            rx_errors: counter("rx_errors"),
            tx_errors: counter("tx_errors"),
            rx_dropped: counter("rx_dropped"),
            tx_dropped: counter("tx_dropped"),
        })
    }

    fn list_pci_devices(&self) -> io::Result<Vec<String>> {
        self.list_dir("sys/bus/pci/devices")
    }

    fn read_sriov_capability(&self, pci_addr: &str) -> Option<SriovCapability> {
        let base = format!("sys/bus/pci/devices/{}", pci_addr);
        let total_vfs = self.read_parsed(&format!("{}/sriov_totalvfs", base))?;
        let num_vfs = self.read_parsed(&format!("{}/sriov_numvfs", base)).unwrap_or(0);
        Some(SriovCapability { total_vfs, num_vfs })
    }

    fn pci_driver(&self, pci_addr: &str) -> Option<String> {
        self.link_basename(&format!("sys/bus/pci/devices/{}/driver", pci_addr))
    }

    fn pci_ids(&self, pci_addr: &str) -> Option<(u16, u16)> {
        let base = format!("sys/bus/pci/devices/{}", pci_addr);
        let vendor = parse_hex_id(&self.read(&format!("{}/vendor", base)).ok()?)?;
        let device = parse_hex_id(&self.read(&format!("{}/device", base)).ok()?)?;
        Some((vendor, device))
    }

    fn pci_net_interface(&self, pci_addr: &str) -> Option<String> {
        self.list_dir(&format!("sys/bus/pci/devices/{}/net", pci_addr))
            .ok()?
            .into_iter()
            .next()
    }

    fn list_virtfns(&self, pci_addr: &str) -> Vec<(u32, String)> {
        let base = format!("sys/bus/pci/devices/{}", pci_addr);
        let mut vfs: Vec<(u32, String)> = self
            .list_dir(&base)
            .unwrap_or_default()
            .iter()
            .filter_map(|name| {
                let index = name.strip_prefix("virtfn")?.parse().ok()?;
                let addr = self.link_basename(&format!("{}/{}", base, name))?;
                Some((index, addr))
            })
            .collect();
        vfs.sort_by_key(|(index, _)| *index);
        vfs
    }

    fn pci_has_attribute(&self, pci_addr: &str, attribute: &str) -> bool {
        self.path(&format!("sys/bus/pci/devices/{}/{}", pci_addr, attribute))
            .exists()
    }

    fn write_sriov_num_vfs(&self, pci_addr: &str, count: u32) -> io::Result<()> {
        std::fs::write(
            self.path(&format!("sys/bus/pci/devices/{}/sriov_numvfs", pci_addr)),
            count.to_string(),
        )
    }

    fn set_vf_attributes(&self, pf_iface: &str, vf_index: u32, attrs: &VfAttributes) -> io::Result<()> {
        if attrs.is_empty() {
            return Ok(());
        }

        let mut args: Vec<String> = ["link", "set", "dev", pf_iface, "vf"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(vf_index.to_string());

        let mut push = |key: &str, value: String| {
            args.push(key.to_string());
            args.push(value);
        };

        if let Some(mac) = &attrs.mac {
            push("mac", mac.clone());
        }
        if let Some(vlan) = attrs.vlan {
            push("vlan", vlan.to_string());
            if let Some(qos) = attrs.vlan_qos {
                push("qos", qos.to_string());
            }
        }
        if let Some(rate) = attrs.min_tx_rate_mbps {
            push("min_tx_rate", rate.to_string());
        }
        if let Some(rate) = attrs.max_tx_rate_mbps {
            push("max_tx_rate", rate.to_string());
        }
        if let Some(spoof) = attrs.spoof_check {
            push("spoofchk", on_off(spoof).to_string());
        }
        if let Some(trust) = attrs.trust {
            push("trust", on_off(trust).to_string());
        }

        let output = Command::new("ip").args(&args).output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn cpu_thread_siblings(&self, cpu: usize) -> Option<String> {
        self.read_trimmed(&format!(
            "sys/devices/system/cpu/cpu{}/topology/thread_siblings_list",
            cpu
        ))
    }

    fn cpu_numa_node(&self, cpu: usize) -> Option<u32> {
        self.list_dir(&format!("sys/devices/system/cpu/cpu{}", cpu))
            .ok()?
            .iter()
            .filter_map(|n| n.strip_prefix("node"))
            .find_map(|id| id.parse().ok())
    }

    fn cpu_governor(&self, cpu: usize) -> Option<String> {
        self.read_trimmed(&format!(
            "sys/devices/system/cpu/cpu{}/cpufreq/scaling_governor",
            cpu
        ))
    }

    #[cfg(target_os = "linux")]
    fn set_affinity(&self, pid: i32, cpus: &[usize]) -> io::Result<()> {
        use nix::sched::{sched_setaffinity, CpuSet};
        use nix::unistd::Pid;

        let mut set = CpuSet::new();
        for &cpu in cpus {
            set.set(cpu).map_err(io::Error::from)?;
        }
        sched_setaffinity(Pid::from_raw(pid), &set).map_err(io::Error::from)
    }

    #[cfg(not(target_os = "linux"))]
    fn set_affinity(&self, _pid: i32, _cpus: &[usize]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "CPU affinity requires Linux",
        ))
    }
}
