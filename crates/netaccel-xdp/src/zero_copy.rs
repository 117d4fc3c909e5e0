//! AF_XDP zero-copy sockets
//!
//! One socket per (interface, queue). Each socket is drained by its own
//! named worker thread; received frames go to the wired [`FrameSink`] or
//! are counted as unrouted and dropped.

use crate::config::ZeroCopyConfig;
use crate::loader::{ProgramLoader, XskSocket};
use crate::{Result, XdpError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consumer of frames received on AF_XDP sockets
pub trait FrameSink: Send + Sync {
    fn deliver(&self, queue: u32, frame: Bytes);
}

/// Called on each worker thread before it starts polling, with the queue id
pub type WorkerHook = Arc<dyn Fn(u32) + Send + Sync>;

type SharedSink = Arc<RwLock<Option<Arc<dyn FrameSink>>>>;

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_errors: AtomicU64,
    delivered: AtomicU64,
    unrouted: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroCopyStats {
    pub sockets: usize,
    pub workers: usize,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    /// Frames handed to the slow-path bridge
    pub delivered: u64,
    /// Frames dropped because no bridge was wired
    pub unrouted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Open,
    Running,
}

struct ZcState {
    phase: Phase,
    sockets: Vec<Box<dyn XskSocket>>,
    fds: BTreeMap<u32, i32>,
    workers: Vec<JoinHandle<()>>,
}

pub struct ZeroCopyManager {
    config: ZeroCopyConfig,
    interface: String,
    loader: Arc<dyn ProgramLoader>,
    state: Mutex<ZcState>,
    sink: SharedSink,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    worker_hook: RwLock<Option<WorkerHook>>,
}

impl ZeroCopyManager {
    pub fn new(config: ZeroCopyConfig, interface: &str, loader: Arc<dyn ProgramLoader>) -> Self {
        Self {
            config,
            interface: interface.to_string(),
            loader,
            state: Mutex::new(ZcState {
                phase: Phase::Uninitialized,
                sockets: Vec::new(),
                fds: BTreeMap::new(),
                workers: Vec::new(),
            }),
            sink: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            worker_hook: RwLock::new(None),
        }
    }

    /// Open one socket per queue; any failure closes the ones already open
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase != Phase::Uninitialized {
            return Err(XdpError::AlreadyInitialized);
        }

        let mut sockets = Vec::with_capacity(self.config.num_queues as usize);
        for queue in 0..self.config.num_queues {
            let socket = self.loader.open_socket(&self.interface, queue, &self.config)?;
            debug!(iface = %self.interface, queue, fd = socket.fd(), "AF_XDP socket open");
            sockets.push(socket);
        }

        state.fds = sockets.iter().map(|s| (s.queue_id(), s.fd())).collect();
        state.sockets = sockets;
        state.phase = Phase::Open;

        info!(
            iface = %self.interface,
            queues = self.config.num_queues,
            frame_size = self.config.frame_size,
            zero_copy = self.config.zero_copy,
            "AF_XDP sockets initialized"
        );
        Ok(())
    }

    /// Run `hook` on every worker thread before polling starts
    pub fn set_worker_hook(&self, hook: Option<WorkerHook>) {
        *self.worker_hook.write() = hook;
    }

    /// Wire or unwire the frame consumer; workers pick it up on their next batch
    pub fn set_sink(&self, sink: Option<Arc<dyn FrameSink>>) {
        *self.sink.write() = sink;
    }

    pub fn has_sink(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Queue to socket fd for every open socket
    pub fn socket_fds(&self) -> BTreeMap<u32, i32> {
        self.state.lock().fds.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().phase != Phase::Uninitialized
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().phase == Phase::Running
    }

    /// Hand every socket to its worker thread
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Uninitialized => return Err(XdpError::NotInitialized),
            Phase::Running => return Ok(()),
            Phase::Open => {}
        }

        self.running.store(true, Ordering::Release);
        let hook = self.worker_hook.read().clone();

        for socket in std::mem::take(&mut state.sockets) {
            let worker = Worker {
                socket,
                batch_size: self.config.batch_size,
                poll_timeout: self.config.poll_timeout,
                running: self.running.clone(),
                sink: self.sink.clone(),
                counters: self.counters.clone(),
                hook: hook.clone(),
            };
            let name = format!("xsk-worker-{}-{}", self.interface, worker.socket.queue_id());

            match thread::Builder::new().name(name).spawn(move || worker.run()) {
                Ok(handle) => state.workers.push(handle),
                Err(e) => {
                    // Sockets already moved into workers close when they exit
                    self.running.store(false, Ordering::Release);
                    for handle in state.workers.drain(..) {
                        let _ = handle.join();
                    }
                    state.fds.clear();
                    state.phase = Phase::Uninitialized;
                    return Err(XdpError::Spawn(e));
                }
            }
        }

        state.phase = Phase::Running;
        info!(iface = %self.interface, workers = state.workers.len(), "AF_XDP workers started");
        Ok(())
    }

    /// Stop workers and close every socket. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Uninitialized {
            return;
        }

        self.running.store(false, Ordering::Release);
        for handle in state.workers.drain(..) {
            if handle.join().is_err() {
                warn!(iface = %self.interface, "AF_XDP worker panicked");
            }
        }

        state.sockets.clear();
        state.fds.clear();
        state.phase = Phase::Uninitialized;
        info!(iface = %self.interface, "AF_XDP sockets closed");
    }

    pub fn get_stats(&self) -> ZeroCopyStats {
        let (sockets, workers) = {
            let state = self.state.lock();
            (state.fds.len(), state.workers.len())
        };

        ZeroCopyStats {
            sockets,
            workers,
            rx_packets: self.counters.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.counters.rx_bytes.load(Ordering::Relaxed),
            rx_errors: self.counters.rx_errors.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ZeroCopyManager {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    socket: Box<dyn XskSocket>,
    batch_size: usize,
    poll_timeout: Duration,
    running: Arc<AtomicBool>,
    sink: SharedSink,
    counters: Arc<Counters>,
    hook: Option<WorkerHook>,
}

impl Worker {
    fn run(mut self) {
        let queue = self.socket.queue_id();
        if let Some(hook) = &self.hook {
            hook(queue);
        }
        debug!(queue, "AF_XDP worker starting");

        while self.running.load(Ordering::Acquire) {
            let frames = match self.socket.recv_batch(self.batch_size, self.poll_timeout) {
                Ok(frames) => frames,
                Err(e) => {
                    self.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(queue, error = %e, "AF_XDP receive failed");
                    thread::sleep(self.poll_timeout);
                    continue;
                }
            };
            if frames.is_empty() {
                continue;
            }

            let sink = self.sink.read().clone();
            for frame in frames {
                self.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
                self.counters.rx_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);

                match &sink {
                    Some(sink) => {
                        sink.deliver(queue, frame);
                        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        debug!(queue, "AF_XDP worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLoader;
    use std::time::Instant;

    fn config(queues: u32) -> ZeroCopyConfig {
        ZeroCopyConfig {
            num_queues: queues,
            ..Default::default()
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<(u32, Bytes)>>,
    }

    impl FrameSink for CollectingSink {
        fn deliver(&self, queue: u32, frame: Bytes) {
            self.frames.lock().push((queue, frame));
        }
    }

    #[test]
    fn test_sockets_per_queue() {
        let loader = Arc::new(FakeLoader::new());
        let zc = ZeroCopyManager::new(config(3), "eth0", loader.clone());
        zc.initialize().unwrap();

        assert_eq!(loader.opened_sockets(), vec![0, 1, 2]);
        assert_eq!(zc.socket_fds().into_iter().collect::<Vec<_>>(), vec![(0, 100), (1, 101), (2, 102)]);
        assert!(matches!(zc.initialize(), Err(XdpError::AlreadyInitialized)));
    }

    #[test]
    fn test_open_failure() {
        let zc = ZeroCopyManager::new(config(2), "eth0", Arc::new(FakeLoader::new().fail_socket(1)));
        assert!(matches!(zc.initialize(), Err(XdpError::Socket { queue: 1, .. })));
        assert!(!zc.is_initialized());

        let unsupported = ZeroCopyManager::new(config(2), "eth0", Arc::new(FakeLoader::new().without_sockets()));
        assert!(unsupported.initialize().is_err());
        assert!(matches!(unsupported.start(), Err(XdpError::NotInitialized)));
    }

    #[test]
    fn test_frames_without_sink_are_unrouted() {
        let loader = Arc::new(FakeLoader::new());
        let zc = ZeroCopyManager::new(config(1), "eth0", loader.clone());
        zc.initialize().unwrap();
        zc.start().unwrap();

        loader.inject_frame(0, vec![0u8; 60]);
        loader.inject_frame(0, vec![0u8; 40]);
        wait_for(|| zc.get_stats().unrouted == 2);

        let stats = zc.get_stats();
        assert_eq!(stats.rx_packets, 2);
        assert_eq!(stats.rx_bytes, 100);
        assert_eq!(stats.delivered, 0);
        zc.stop();
    }

    #[test]
    fn test_frames_reach_sink_and_hook_runs() {
        let loader = Arc::new(FakeLoader::new());
        let zc = ZeroCopyManager::new(config(2), "eth0", loader.clone());
        let sink = Arc::new(CollectingSink::default());
        let hooked: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let seen = hooked.clone();
        zc.set_worker_hook(Some(Arc::new(move |queue: u32| seen.lock().push(queue))));
        zc.initialize().unwrap();
        zc.set_sink(Some(sink.clone()));
        zc.start().unwrap();
        assert!(zc.is_running());
        assert_eq!(zc.get_stats().workers, 2);

        loader.inject_frame(1, vec![1u8; 64]);
        wait_for(|| sink.frames.lock().len() == 1);
        assert_eq!(sink.frames.lock()[0].0, 1);

        wait_for(|| hooked.lock().len() == 2);
        let mut queues = hooked.lock().clone();
        queues.sort_unstable();
        assert_eq!(queues, vec![0, 1]);

        zc.stop();
        zc.stop();
        assert!(!zc.is_initialized());
        assert!(zc.socket_fds().is_empty());
    }
}
