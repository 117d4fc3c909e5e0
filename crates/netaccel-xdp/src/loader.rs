//! Kernel program loading
//!
//! Abstracted for testing: the managers only talk to [`ProgramLoader`].

use crate::config::{AttachMode, ZeroCopyConfig};
use crate::{Result, XdpError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A loaded, not necessarily attached, program object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramHandle {
    pub path: PathBuf,
    pub section: String,
}

/// Receive side of one AF_XDP socket
pub trait XskSocket: Send {
    fn queue_id(&self) -> u32;

    /// Socket fd registered into `xsks_map`
    fn fd(&self) -> i32;

    /// Up to `max` frames, waiting at most `timeout` when the ring is empty
    fn recv_batch(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<Bytes>>;
}

#[async_trait]
pub trait ProgramLoader: Send + Sync {
    async fn load(&self, path: &Path, section: &str) -> Result<ProgramHandle>;

    /// Attach and return the mode the program actually runs in
    async fn attach(
        &self,
        program: &ProgramHandle,
        iface: &str,
        mode: AttachMode,
        force_replace: bool,
    ) -> Result<AttachMode>;

    async fn detach(&self, iface: &str, mode: AttachMode) -> Result<()>;

    async fn update_map_entry(&self, map: &str, key: &[u8], value: &[u8]) -> Result<()>;

    async fn delete_map_entry(&self, map: &str, key: &[u8]) -> Result<()>;

    /// Counter `index` of an array map, summed across CPUs
    async fn read_stat(&self, map: &str, index: u32) -> Result<u64>;

    fn open_socket(&self, iface: &str, queue: u32, config: &ZeroCopyConfig) -> Result<Box<dyn XskSocket>>;
}

/// Loader driving `ip` and `bpftool`
pub struct BpftoolLoader {
    pin_path: PathBuf,
}

impl BpftoolLoader {
    pub fn new(pin_path: impl Into<PathBuf>) -> Self {
        Self {
            pin_path: pin_path.into(),
        }
    }

    fn map_path(&self, map: &str) -> String {
        self.pin_path.join(map).display().to_string()
    }
}

fn hex_args(bytes: &[u8]) -> impl Iterator<Item = String> + '_ {
    bytes.iter().map(|b| hex::encode([*b]))
}

async fn run(program: &str, args: &[String]) -> Result<Vec<u8>> {
    let command = format!("{} {}", program, args.join(" "));
    debug!(%command, "running");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| XdpError::Command {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(XdpError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[async_trait]
impl ProgramLoader for BpftoolLoader {
    async fn load(&self, path: &Path, section: &str) -> Result<ProgramHandle> {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(XdpError::ProgramNotFound(path.to_path_buf()));
        }

        Ok(ProgramHandle {
            path: path.to_path_buf(),
            section: section.to_string(),
        })
    }

    async fn attach(
        &self,
        program: &ProgramHandle,
        iface: &str,
        mode: AttachMode,
        force_replace: bool,
    ) -> Result<AttachMode> {
        let attach_args = |mode: AttachMode| {
            let mut args = Vec::new();
            if force_replace {
                args.push("-force".to_string());
            }
            args.extend(
                ["link", "set", "dev", iface, mode.ip_keyword(), "obj"]
                    .iter()
                    .map(|s| s.to_string()),
            );
            args.push(program.path.display().to_string());
            args.push("sec".to_string());
            args.push(program.section.clone());
            args
        };

        match run("ip", &attach_args(mode)).await {
            Ok(_) => Ok(mode),
            Err(e) if mode == AttachMode::Native => {
                warn!(iface, error = %e, "native XDP attach failed, trying generic mode");
                run("ip", &attach_args(AttachMode::Generic))
                    .await
                    .map_err(|e| XdpError::Attach {
                        iface: iface.to_string(),
                        reason: e.to_string(),
                    })?;
                info!(iface, "XDP loaded in generic mode");
                Ok(AttachMode::Generic)
            }
            Err(e) => Err(XdpError::Attach {
                iface: iface.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn detach(&self, iface: &str, mode: AttachMode) -> Result<()> {
        let args: Vec<String> = ["link", "set", "dev", iface, mode.ip_keyword(), "off"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        run("ip", &args).await.map(|_| ())
    }

    async fn update_map_entry(&self, map: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let mut args = vec![
            "map".to_string(),
            "update".to_string(),
            "pinned".to_string(),
            self.map_path(map),
            "key".to_string(),
            "hex".to_string(),
        ];
        args.extend(hex_args(key));
        args.push("value".to_string());
        args.push("hex".to_string());
        args.extend(hex_args(value));

        run("bpftool", &args).await.map(|_| ()).map_err(|e| XdpError::Map {
            map: map.to_string(),
            reason: e.to_string(),
        })
    }

    async fn delete_map_entry(&self, map: &str, key: &[u8]) -> Result<()> {
        let mut args = vec![
            "map".to_string(),
            "delete".to_string(),
            "pinned".to_string(),
            self.map_path(map),
            "key".to_string(),
            "hex".to_string(),
        ];
        args.extend(hex_args(key));

        run("bpftool", &args).await.map(|_| ()).map_err(|e| XdpError::Map {
            map: map.to_string(),
            reason: e.to_string(),
        })
    }

    async fn read_stat(&self, map: &str, index: u32) -> Result<u64> {
        let mut args = vec![
            "-j".to_string(),
            "map".to_string(),
            "lookup".to_string(),
            "pinned".to_string(),
            self.map_path(map),
            "key".to_string(),
            "hex".to_string(),
        ];
        args.extend(hex_args(&index.to_ne_bytes()));

        let stdout = run("bpftool", &args).await?;
        let json: serde_json::Value = serde_json::from_slice(&stdout).map_err(|e| XdpError::Map {
            map: map.to_string(),
            reason: format!("unparseable bpftool output: {}", e),
        })?;

        parse_lookup(&json).ok_or_else(|| XdpError::Map {
            map: map.to_string(),
            reason: format!("no value for key {}", index),
        })
    }

    fn open_socket(&self, _iface: &str, queue: u32, _config: &ZeroCopyConfig) -> Result<Box<dyn XskSocket>> {
        Err(XdpError::Socket {
            queue,
            reason: "no AF_XDP socket binding available to the bpftool loader".to_string(),
        })
    }
}

/// Value of a `bpftool -j map lookup` result.
///
/// Plain arrays carry `"value"`, per-CPU arrays carry `"values"` with one
/// entry per CPU which are summed.
fn parse_lookup(json: &serde_json::Value) -> Option<u64> {
    if let Some(value) = json.get("value") {
        return decode_bytes(value);
    }

    let per_cpu = json.get("values")?.as_array()?;
    per_cpu
        .iter()
        .map(|cpu| cpu.get("value").and_then(decode_bytes))
        .try_fold(0u64, |sum, v| v.map(|v| sum.wrapping_add(v)))
}

/// `["0x05", "0x00", ...]` little-endian bytes to a counter
fn decode_bytes(value: &serde_json::Value) -> Option<u64> {
    let bytes = value
        .as_array()?
        .iter()
        .map(|b| {
            let text = b.as_str()?;
            u8::from_str_radix(text.trim_start_matches("0x"), 16).ok()
        })
        .collect::<Option<Vec<u8>>>()?;

    let mut raw = [0u8; 8];
    for (slot, byte) in raw.iter_mut().zip(bytes) {
        *slot = byte;
    }
    Some(u64::from_le_bytes(raw))
}
