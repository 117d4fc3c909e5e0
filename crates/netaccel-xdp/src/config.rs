//! Fast-path and zero-copy configuration

use crate::{Result, XdpError};
use netaccel_common::duration_ms;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where the XDP program runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// SKB mode, works with every driver
    Generic,
    /// In the driver
    Native,
    /// On the NIC
    Offload,
}

impl AttachMode {
    /// iproute2 keyword selecting this mode
    pub fn ip_keyword(self) -> &'static str {
        match self {
            AttachMode::Generic => "xdpgeneric",
            AttachMode::Native => "xdpdrv",
            AttachMode::Offload => "xdpoffload",
        }
    }
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            AttachMode::Generic => "generic",
            AttachMode::Native => "native",
            AttachMode::Offload => "offload",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XdpConfig {
    /// Pre-compiled object file
    pub program_path: PathBuf,
    /// ELF section holding the program
    pub section: String,
    /// bpffs directory the object pins its maps under
    pub pin_path: PathBuf,
    pub attach_mode: AttachMode,
    /// Replace a program already attached to the interface
    pub force_replace: bool,
    /// Interfaces to attach to; empty uses the acceleration interface
    pub interfaces: Vec<String>,
    #[serde(with = "duration_ms")]
    pub stats_interval: Duration,
}

impl Default for XdpConfig {
    fn default() -> Self {
        Self {
            program_path: PathBuf::from("/opt/netaccel/ebpf/proxy_xdp.o"),
            section: "xdp".to_string(),
            pin_path: PathBuf::from("/sys/fs/bpf/netaccel"),
            attach_mode: AttachMode::Native,
            force_replace: true,
            interfaces: Vec::new(),
            stats_interval: Duration::from_secs(5),
        }
    }
}

impl XdpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.program_path.as_os_str().is_empty() {
            return Err(XdpError::InvalidConfig("XDP program path is empty".to_string()));
        }
        if self.section.is_empty() {
            return Err(XdpError::InvalidConfig("XDP section is empty".to_string()));
        }
        if self.interfaces.iter().any(|i| i.is_empty()) {
            return Err(XdpError::InvalidConfig("empty interface name".to_string()));
        }
        Ok(())
    }
}

/// AF_XDP socket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeroCopyConfig {
    pub num_queues: u32,
    /// UMEM frame size in bytes
    pub frame_size: u32,
    /// UMEM frames per socket
    pub frame_count: u32,
    /// Frames taken from the RX ring per poll
    pub batch_size: usize,
    #[serde(with = "duration_ms")]
    pub poll_timeout: Duration,
    /// Request `XDP_ZEROCOPY`; copy mode otherwise
    pub zero_copy: bool,
}

impl Default for ZeroCopyConfig {
    fn default() -> Self {
        Self {
            num_queues: 4,
            frame_size: 2048,
            frame_count: 4096,
            batch_size: 64,
            poll_timeout: Duration::from_millis(1),
            zero_copy: true,
        }
    }
}

impl ZeroCopyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_queues == 0 {
            return Err(XdpError::InvalidConfig("zero-copy needs at least one queue".to_string()));
        }
        if !self.frame_size.is_power_of_two() || !(2048..=4096).contains(&self.frame_size) {
            return Err(XdpError::InvalidConfig(format!(
                "frame size {} must be a power of two between 2048 and 4096",
                self.frame_size
            )));
        }
        if self.frame_count == 0 || self.batch_size == 0 {
            return Err(XdpError::InvalidConfig(
                "frame count and batch size must be positive".to_string(),
            ));
        }
        if self.batch_size > self.frame_count as usize {
            return Err(XdpError::InvalidConfig(format!(
                "batch size {} exceeds frame count {}",
                self.batch_size, self.frame_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(XdpConfig::default().validate().is_ok());
        assert!(ZeroCopyConfig::default().validate().is_ok());
        assert_eq!(XdpConfig::default().attach_mode, AttachMode::Native);
    }

    #[test]
    fn test_frame_size_bounds() {
        for (size, ok) in [(2048, true), (4096, true), (3000, false), (1024, false), (8192, false)] {
            let cfg = ZeroCopyConfig {
                frame_size: size,
                ..Default::default()
            };
            assert_eq!(cfg.validate().is_ok(), ok, "frame size {}", size);
        }

        let no_queues = ZeroCopyConfig {
            num_queues: 0,
            ..Default::default()
        };
        assert!(no_queues.validate().is_err());
    }

    #[test]
    fn test_durations_in_millis() {
        let json = serde_json::to_value(ZeroCopyConfig::default()).unwrap();
        assert_eq!(json["poll_timeout"], 1);

        let cfg: XdpConfig =
            serde_json::from_str(r#"{"attach_mode": "generic", "stats_interval": 250}"#).unwrap();
        assert_eq!(cfg.attach_mode, AttachMode::Generic);
        assert_eq!(cfg.stats_interval, Duration::from_millis(250));
        assert_eq!(cfg.section, "xdp");
    }
}
