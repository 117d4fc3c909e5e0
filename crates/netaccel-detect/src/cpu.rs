//! CPU, memory and kernel facts

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kernel release, major.minor only
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse `/proc/version` (`Linux version 5.15.0-91-generic ...`)
    pub fn parse(proc_version: &str) -> Option<Self> {
        let release = proc_version
            .trim()
            .strip_prefix("Linux version ")?
            .split_whitespace()
            .next()?;

        let mut parts = release.split(|c: char| !c.is_ascii_digit());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Self { major, minor })
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= Self::new(major, minor)
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Processor and memory features relevant to packet processing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuFeatures {
    pub num_cpus: usize,
    pub model_name: String,
    pub numa_nodes: usize,
    pub hugepages_total: u64,
    pub hugepage_size_kb: u64,
    pub avx: bool,
    pub avx2: bool,
    pub avx512: bool,
}

impl CpuFeatures {
    pub fn hugepages_configured(&self) -> bool {
        self.hugepages_total > 0
    }

    pub(crate) fn apply_cpuinfo(&mut self, cpuinfo: &str) {
        let mut flags_seen = false;

        for line in cpuinfo.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "processor" => self.num_cpus += 1,
                "model name" if self.model_name.is_empty() => self.model_name = value.to_string(),
                "flags" if !flags_seen => {
                    flags_seen = true;
                    for flag in value.split_whitespace() {
                        match flag {
                            "avx" => self.avx = true,
                            "avx2" => self.avx2 = true,
                            f if f.starts_with("avx512") => self.avx512 = true,
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }

    pub(crate) fn apply_meminfo(&mut self, meminfo: &str) {
        for line in meminfo.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let number = value
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);

            match key.trim() {
                "HugePages_Total" => self.hugepages_total = number,
                "Hugepagesize" => self.hugepage_size_kb = number,
                _ => {}
            }
        }
    }
}
