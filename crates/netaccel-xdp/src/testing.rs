//! In-memory program loader

use crate::config::{AttachMode, ZeroCopyConfig};
use crate::loader::{ProgramHandle, ProgramLoader, XskSocket};
use crate::{Result, XdpError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

type Frames = Arc<Mutex<VecDeque<Bytes>>>;

#[derive(Default)]
struct LoaderState {
    loads: Vec<ProgramHandle>,
    attached: BTreeMap<String, AttachMode>,
    detaches: Vec<String>,
    generic_only: HashSet<String>,
    failing_attach: HashSet<String>,
    fail_load: bool,
    fail_map_updates: bool,
    maps: HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
    stats: HashMap<(String, u32), u64>,
    sockets_unsupported: bool,
    failing_queues: HashSet<u32>,
    frames: HashMap<u32, Frames>,
    open_sockets: Vec<u32>,
}

/// Records every kernel interaction and keeps maps in memory
#[derive(Default)]
pub struct FakeLoader {
    state: Mutex<LoaderState>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Native attach fails on `iface`, generic works
    pub fn generic_only(self, iface: &str) -> Self {
        self.state.lock().generic_only.insert(iface.to_string());
        self
    }

    pub fn fail_attach(self, iface: &str) -> Self {
        self.state.lock().failing_attach.insert(iface.to_string());
        self
    }

    pub fn fail_load(self) -> Self {
        self.state.lock().fail_load = true;
        self
    }

    /// `open_socket` behaves like the bpftool loader
    pub fn without_sockets(self) -> Self {
        self.state.lock().sockets_unsupported = true;
        self
    }

    pub fn fail_socket(self, queue: u32) -> Self {
        self.state.lock().failing_queues.insert(queue);
        self
    }

    pub fn fail_map_updates(&self, fail: bool) {
        self.state.lock().fail_map_updates = fail;
    }

    pub fn set_stat(&self, map: &str, index: u32, value: u64) {
        self.state.lock().stats.insert((map.to_string(), index), value);
    }

    /// Queue a frame for the socket bound to `queue`
    pub fn inject_frame(&self, queue: u32, frame: impl Into<Bytes>) {
        let frames = self.frames(queue);
        frames.lock().push_back(frame.into());
    }

    fn frames(&self, queue: u32) -> Frames {
        self.state.lock().frames.entry(queue).or_default().clone()
    }

    pub fn loads(&self) -> Vec<ProgramHandle> {
        self.state.lock().loads.clone()
    }

    pub fn attached(&self) -> BTreeMap<String, AttachMode> {
        self.state.lock().attached.clone()
    }

    pub fn detaches(&self) -> Vec<String> {
        self.state.lock().detaches.clone()
    }

    pub fn map_entries(&self, map: &str) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.state.lock().maps.get(map).cloned().unwrap_or_default()
    }

    /// Queues a socket was opened for, in order
    pub fn opened_sockets(&self) -> Vec<u32> {
        self.state.lock().open_sockets.clone()
    }
}

#[async_trait]
impl ProgramLoader for FakeLoader {
    async fn load(&self, path: &Path, section: &str) -> Result<ProgramHandle> {
        let mut state = self.state.lock();
        if state.fail_load {
            return Err(XdpError::ProgramNotFound(path.to_path_buf()));
        }
        let handle = ProgramHandle {
            path: path.to_path_buf(),
            section: section.to_string(),
        };
        state.loads.push(handle.clone());
        Ok(handle)
    }

    async fn attach(
        &self,
        _program: &ProgramHandle,
        iface: &str,
        mode: AttachMode,
        force_replace: bool,
    ) -> Result<AttachMode> {
        let mut state = self.state.lock();
        let attach_error = |reason: &str| XdpError::Attach {
            iface: iface.to_string(),
            reason: reason.to_string(),
        };

        if state.failing_attach.contains(iface) {
            return Err(attach_error("No such device"));
        }
        if state.attached.contains_key(iface) && !force_replace {
            return Err(attach_error("program already attached"));
        }

        let effective = match mode {
            AttachMode::Native if state.generic_only.contains(iface) => AttachMode::Generic,
            AttachMode::Offload if state.generic_only.contains(iface) => {
                return Err(attach_error("offload not supported"))
            }
            other => other,
        };
        state.attached.insert(iface.to_string(), effective);
        Ok(effective)
    }

    async fn detach(&self, iface: &str, _mode: AttachMode) -> Result<()> {
        let mut state = self.state.lock();
        state.detaches.push(iface.to_string());
        state.attached.remove(iface);
        Ok(())
    }

    async fn update_map_entry(&self, map: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_map_updates {
            return Err(XdpError::Map {
                map: map.to_string(),
                reason: "Operation not permitted".to_string(),
            });
        }
        state
            .maps
            .entry(map.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete_map_entry(&self, map: &str, key: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_map_updates {
            return Err(XdpError::Map {
                map: map.to_string(),
                reason: "Operation not permitted".to_string(),
            });
        }
        if let Some(entries) = state.maps.get_mut(map) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn read_stat(&self, map: &str, index: u32) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .stats
            .get(&(map.to_string(), index))
            .copied()
            .unwrap_or(0))
    }

    fn open_socket(&self, _iface: &str, queue: u32, _config: &ZeroCopyConfig) -> Result<Box<dyn XskSocket>> {
        {
            let mut state = self.state.lock();
            if state.sockets_unsupported || state.failing_queues.contains(&queue) {
                return Err(XdpError::Socket {
                    queue,
                    reason: "Operation not supported".to_string(),
                });
            }
            state.open_sockets.push(queue);
        }

        Ok(Box::new(FakeSocket {
            queue,
            frames: self.frames(queue),
        }))
    }
}

struct FakeSocket {
    queue: u32,
    frames: Frames,
}

impl XskSocket for FakeSocket {
    fn queue_id(&self) -> u32 {
        self.queue
    }

    fn fd(&self) -> i32 {
        100 + self.queue as i32
    }

    fn recv_batch(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<Bytes>> {
        let batch: Vec<Bytes> = {
            let mut frames = self.frames.lock();
            let take = frames.len().min(max);
            frames.drain(..take).collect()
        };

        if batch.is_empty() {
            std::thread::sleep(timeout);
        }
        Ok(batch)
    }
}
