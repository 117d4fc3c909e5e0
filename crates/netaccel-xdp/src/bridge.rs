//! Slow-path bridge between the XDP fast path and the userspace proxy
//!
//! The fast path redirects frames it cannot resolve (services needing
//! authentication, unknown traffic) into the AF_XDP sockets through
//! `xsks_map`. The bridge parses and classifies each frame, attaches the
//! owning service and passes it to the external [`PacketProcessor`].

use crate::fast_path::XdpManager;
use crate::zero_copy::{FrameSink, ZeroCopyManager};
use crate::{Result, XdpError, XSKS_MAP};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use netaccel_common::{MutationReport, Service};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The external packet-processing consumer
pub trait PacketProcessor: Send + Sync {
    fn handle(&self, packet: SlowPathPacket);
}

/// Application-level class, most specific first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketClass {
    WebSocket,
    Tls,
    Http,
    Tcp,
    Udp,
    Icmp,
    Other,
}

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT ", b"TRACE ",
];

/// Only the start of the request is searched for the upgrade header
const UPGRADE_SCAN_LIMIT: usize = 1024;

const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

/// Class of a packet from its transport protocol and payload
pub(crate) fn classify(protocol: u8, payload: &[u8]) -> PacketClass {
    match protocol {
        PROTO_TCP => {
            if payload.len() >= 5 && payload[0] == 0x16 && payload[1] == 0x03 {
                return PacketClass::Tls;
            }
            if HTTP_METHODS.iter().any(|m| payload.starts_with(m)) {
                let head = &payload[..payload.len().min(UPGRADE_SCAN_LIMIT)];
                if contains_ignore_case(head, b"upgrade: websocket") {
                    return PacketClass::WebSocket;
                }
                return PacketClass::Http;
            }
            PacketClass::Tcp
        }
        PROTO_UDP => PacketClass::Udp,
        PROTO_ICMP | PROTO_ICMPV6 => PacketClass::Icmp,
        _ => PacketClass::Other,
    }
}

/// A redirected frame with its parsed metadata
#[derive(Debug, Clone, PartialEq)]
pub struct SlowPathPacket {
    /// The full Ethernet frame
    pub data: Bytes,
    pub queue_id: u32,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
    pub protocol: u8,
    pub class: PacketClass,
    pub service_id: Option<u64>,
    pub needs_auth: bool,
    pub received_at: DateTime<Utc>,
}

impl SlowPathPacket {
    /// Parse an Ethernet frame; `None` for non-IP or truncated frames
    pub fn parse(queue_id: u32, data: Bytes) -> Option<Self> {
        let sliced = SlicedPacket::from_ethernet(&data).ok()?;

        let (source, destination, ip_protocol) = match sliced.ip.as_ref()? {
            InternetSlice::Ipv4(header, _) => (
                IpAddr::V4(header.source_addr()),
                IpAddr::V4(header.destination_addr()),
                u8::from(header.protocol()),
            ),
            InternetSlice::Ipv6(header, _) => (
                IpAddr::V6(header.source_addr()),
                IpAddr::V6(header.destination_addr()),
                u8::from(header.next_header()),
            ),
        };

        let (source_port, destination_port, protocol) = match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => (tcp.source_port(), tcp.destination_port(), PROTO_TCP),
            Some(TransportSlice::Udp(udp)) => (udp.source_port(), udp.destination_port(), PROTO_UDP),
            Some(TransportSlice::Icmpv4(_)) => (0, 0, PROTO_ICMP),
            Some(TransportSlice::Icmpv6(_)) => (0, 0, PROTO_ICMPV6),
            Some(TransportSlice::Unknown(number)) => (0, 0, *number),
            None => (0, 0, ip_protocol),
        };

        let class = classify(protocol, sliced.payload);

        Some(Self {
            queue_id,
            source,
            destination,
            source_port,
            destination_port,
            protocol,
            class,
            service_id: None,
            needs_auth: false,
            received_at: Utc::now(),
            data,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeStats {
    pub total_packets: u64,
    /// Packets the fast path passed without redirecting
    pub fast_path_packets: u64,
    /// Packets handed to the processor
    pub slow_path_packets: u64,
    pub slow_path_bytes: u64,
    pub dropped_packets: u64,
    pub malformed_packets: u64,
    pub websocket_packets: u64,
    pub tls_packets: u64,
    pub http_packets: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub icmp_packets: u64,
    pub other_packets: u64,
    /// Cumulative time spent parsing and delivering
    pub processing_time_us: u64,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    fast_path: AtomicU64,
    slow_path: AtomicU64,
    slow_path_bytes: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    classes: [AtomicU64; 7],
    processing_ns: AtomicU64,
}

fn class_slot(class: PacketClass) -> usize {
    match class {
        PacketClass::WebSocket => 0,
        PacketClass::Tls => 1,
        PacketClass::Http => 2,
        PacketClass::Tcp => 3,
        PacketClass::Udp => 4,
        PacketClass::Icmp => 5,
        PacketClass::Other => 6,
    }
}

#[derive(Debug, Clone, Copy)]
struct ServiceEntry {
    id: u64,
    auth_required: bool,
}

pub struct SlowPathBridge {
    interface: String,
    processor: RwLock<Option<Arc<dyn PacketProcessor>>>,
    services: DashMap<(IpAddr, u16), ServiceEntry>,
    counters: Counters,
    wired: AtomicBool,
}

impl SlowPathBridge {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            processor: RwLock::new(None),
            services: DashMap::new(),
            counters: Counters::default(),
            wired: AtomicBool::new(false),
        }
    }

    /// Register every AF_XDP socket in `xsks_map` and route received
    /// frames here. Fails only when no socket could be registered.
    pub async fn wire(self: &Arc<Self>, xdp: &XdpManager, zero_copy: &ZeroCopyManager) -> Result<MutationReport> {
        let sockets = zero_copy.socket_fds();
        if sockets.is_empty() {
            return Err(XdpError::NotInitialized);
        }

        let mut report = MutationReport::new();
        for (queue, fd) in sockets {
            let target = format!("{}/{}", XSKS_MAP, queue);
            match xdp.register_xsk(queue, fd).await {
                Ok(()) => report.record_applied(target),
                Err(e) => {
                    warn!(queue, error = %e, "failed to register AF_XDP socket");
                    report.record_failure(target, e);
                }
            }
        }

        if report.nothing_applied() {
            let reason = report
                .failures()
                .first()
                .map(|f| f.reason.clone())
                .unwrap_or_default();
            return Err(XdpError::Map {
                map: XSKS_MAP.to_string(),
                reason,
            });
        }

        zero_copy.set_sink(Some(self.clone() as Arc<dyn FrameSink>));
        self.wired.store(true, Ordering::Release);
        info!(
            iface = %self.interface,
            queues = report.applied_items().len(),
            processor = self.has_processor(),
            "slow-path bridge wired"
        );
        Ok(report)
    }

    /// Stop routing frames here and drop the socket registrations
    pub async fn unwire(&self, xdp: &XdpManager, zero_copy: &ZeroCopyManager) {
        if !self.wired.swap(false, Ordering::AcqRel) {
            return;
        }

        zero_copy.set_sink(None);
        for queue in xdp.registered_sockets().into_keys() {
            if let Err(e) = xdp.unregister_xsk(queue).await {
                warn!(queue, error = %e, "failed to remove AF_XDP socket registration");
            }
        }
        info!(iface = %self.interface, "slow-path bridge unwired");
    }

    pub fn is_wired(&self) -> bool {
        self.wired.load(Ordering::Acquire)
    }

    /// Replace the consumer; takes effect for the next frame
    pub fn set_processor(&self, processor: Option<Arc<dyn PacketProcessor>>) {
        *self.processor.write() = processor;
    }

    pub fn has_processor(&self) -> bool {
        self.processor.read().is_some()
    }

    /// Rebuild the destination to service index
    pub fn update_services(&self, services: &[Service]) {
        self.services.clear();
        for service in services {
            self.services.insert(
                (service.address, service.port),
                ServiceEntry {
                    id: service.id,
                    auth_required: service.auth_required,
                },
            );
        }
        debug!(services = self.services.len(), "slow-path service index rebuilt");
    }

    /// Record the fast path's pass counter
    pub fn sync_fast_path(&self, passed: u64) {
        self.counters.fast_path.store(passed, Ordering::Relaxed);
    }

    /// Parse, classify and deliver one redirected frame
    pub fn handle_frame(&self, queue: u32, frame: Bytes) {
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let len = frame.len() as u64;
        let Some(mut packet) = SlowPathPacket::parse(queue, frame) else {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            self.record_time(started);
            return;
        };

        self.counters.classes[class_slot(packet.class)].fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.services.get(&(packet.destination, packet.destination_port)) {
            packet.service_id = Some(entry.id);
            packet.needs_auth = entry.auth_required;
        }

        let processor = self.processor.read().clone();
        match processor {
            Some(processor) => {
                processor.handle(packet);
                self.counters.slow_path.fetch_add(1, Ordering::Relaxed);
                self.counters.slow_path_bytes.fetch_add(len, Ordering::Relaxed);
            }
            None => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.record_time(started);
    }

    fn record_time(&self, started: Instant) {
        let elapsed = started.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.counters.processing_ns.fetch_add(elapsed, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> BridgeStats {
        let c = &self.counters;
        let class = |class: PacketClass| c.classes[class_slot(class)].load(Ordering::Relaxed);

        BridgeStats {
            total_packets: c.total.load(Ordering::Relaxed),
            fast_path_packets: c.fast_path.load(Ordering::Relaxed),
            slow_path_packets: c.slow_path.load(Ordering::Relaxed),
            slow_path_bytes: c.slow_path_bytes.load(Ordering::Relaxed),
            dropped_packets: c.dropped.load(Ordering::Relaxed),
            malformed_packets: c.malformed.load(Ordering::Relaxed),
            websocket_packets: class(PacketClass::WebSocket),
            tls_packets: class(PacketClass::Tls),
            http_packets: class(PacketClass::Http),
            tcp_packets: class(PacketClass::Tcp),
            udp_packets: class(PacketClass::Udp),
            icmp_packets: class(PacketClass::Icmp),
            other_packets: class(PacketClass::Other),
            processing_time_us: Duration::from_nanos(c.processing_ns.load(Ordering::Relaxed)).as_micros() as u64,
            last_update: Some(Utc::now()),
        }
    }
}

impl FrameSink for SlowPathBridge {
    fn deliver(&self, queue: u32, frame: Bytes) {
        self.handle_frame(queue, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{XdpConfig, ZeroCopyConfig};
    use crate::testing::FakeLoader;
    use etherparse::PacketBuilder;
    use netaccel_common::ServiceProtocol;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<SlowPathPacket>>,
    }

    impl PacketProcessor for Recorder {
        fn handle(&self, packet: SlowPathPacket) {
            self.packets.lock().push(packet);
        }
    }

    fn tcp_frame(dst: [u8; 4], dst_port: u16, payload: &[u8]) -> Bytes {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4([192, 168, 1, 10], dst, 64)
            .tcp(40000, dst_port, 1, 65535);
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        Bytes::from(out)
    }

    fn udp_frame(dst_port: u16) -> Bytes {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv6([0xfd; 16], [0xfe; 16], 64)
            .udp(5353, dst_port);
        let mut out = Vec::new();
        builder.write(&mut out, b"query").unwrap();
        Bytes::from(out)
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(PROTO_TCP, &[0x16, 0x03, 0x01, 0x00, 0xa5]), PacketClass::Tls);
        assert_eq!(classify(PROTO_TCP, b"GET /index.html HTTP/1.1\r\n"), PacketClass::Http);
        assert_eq!(
            classify(PROTO_TCP, b"GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: WebSocket\r\n\r\n"),
            PacketClass::WebSocket
        );
        assert_eq!(classify(PROTO_TCP, b"\x00\x01binary"), PacketClass::Tcp);
        assert_eq!(classify(PROTO_TCP, &[0x16, 0x03]), PacketClass::Tcp);
        assert_eq!(classify(PROTO_UDP, b"GET "), PacketClass::Udp);
        assert_eq!(classify(PROTO_ICMP, &[]), PacketClass::Icmp);
        assert_eq!(classify(47, &[]), PacketClass::Other);
    }

    #[test]
    fn test_parse_ipv4_tcp() {
        let packet = SlowPathPacket::parse(2, tcp_frame([10, 0, 0, 5], 443, &[0x16, 0x03, 0x03, 0x00, 0x10])).unwrap();

        assert_eq!(packet.queue_id, 2);
        assert_eq!(packet.destination, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(packet.source_port, 40000);
        assert_eq!(packet.destination_port, 443);
        assert_eq!(packet.protocol, PROTO_TCP);
        assert_eq!(packet.class, PacketClass::Tls);
        assert_eq!(packet.service_id, None);
    }

    #[test]
    fn test_parse_ipv6_udp_and_garbage() {
        let packet = SlowPathPacket::parse(0, udp_frame(53)).unwrap();
        assert_eq!(packet.class, PacketClass::Udp);
        assert!(packet.destination.is_ipv6());
        assert_eq!(packet.destination_port, 53);

        assert!(SlowPathPacket::parse(0, Bytes::from_static(&[0u8; 10])).is_none());
    }

    #[test]
    fn test_delivery_with_service_lookup() {
        let bridge = SlowPathBridge::new("eth0");
        let recorder = Arc::new(Recorder::default());
        bridge.set_processor(Some(recorder.clone()));
        bridge.update_services(&[Service {
            id: 42,
            name: "api".to_string(),
            address: "10.0.0.5".parse().unwrap(),
            port: 8443,
            protocol: ServiceProtocol::Tcp,
            auth_required: true,
        }]);

        bridge.handle_frame(0, tcp_frame([10, 0, 0, 5], 8443, b"POST /login HTTP/1.1\r\n"));
        bridge.handle_frame(0, tcp_frame([10, 0, 0, 6], 8443, b"hello"));

        let packets = recorder.packets.lock();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].service_id, Some(42));
        assert!(packets[0].needs_auth);
        assert_eq!(packets[0].class, PacketClass::Http);
        assert_eq!(packets[1].service_id, None);
        assert!(!packets[1].needs_auth);

        let stats = bridge.get_stats();
        assert_eq!(stats.total_packets, 2);
        assert_eq!(stats.slow_path_packets, 2);
        assert_eq!(stats.http_packets, 1);
        assert_eq!(stats.tcp_packets, 1);
        assert_eq!(stats.dropped_packets, 0);
    }

    #[test]
    fn test_drops_without_processor() {
        let bridge = SlowPathBridge::new("eth0");
        bridge.handle_frame(0, tcp_frame([10, 0, 0, 5], 80, b"GET / HTTP/1.1\r\n"));
        bridge.handle_frame(0, Bytes::from_static(b"short"));

        let stats = bridge.get_stats();
        assert_eq!(stats.total_packets, 2);
        assert_eq!(stats.dropped_packets, 2);
        assert_eq!(stats.malformed_packets, 1);
        assert_eq!(stats.slow_path_packets, 0);

        // Rewiring the processor takes effect immediately
        let recorder = Arc::new(Recorder::default());
        bridge.set_processor(Some(recorder.clone()));
        bridge.handle_frame(0, udp_frame(53));
        assert_eq!(recorder.packets.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_wire_registers_sockets() {
        let loader = Arc::new(FakeLoader::new());
        let xdp = XdpManager::new(XdpConfig::default(), "eth0", loader.clone());
        let zc = ZeroCopyManager::new(
            ZeroCopyConfig {
                num_queues: 2,
                ..Default::default()
            },
            "eth0",
            loader.clone(),
        );
        xdp.initialize().await.unwrap();
        zc.initialize().unwrap();

        let bridge = Arc::new(SlowPathBridge::new("eth0"));
        let report = bridge.wire(&xdp, &zc).await.unwrap();
        assert!(report.is_applied());
        assert!(bridge.is_wired());
        assert!(zc.has_sink());
        assert_eq!(loader.map_entries(XSKS_MAP).len(), 2);

        bridge.unwire(&xdp, &zc).await;
        bridge.unwire(&xdp, &zc).await;
        assert!(!zc.has_sink());
        assert!(loader.map_entries(XSKS_MAP).is_empty());

        loader.fail_map_updates(true);
        assert!(matches!(bridge.wire(&xdp, &zc).await, Err(XdpError::Map { .. })));
        assert!(!bridge.is_wired());

        zc.stop();
        xdp.stop().await;
    }

    proptest! {
        #[test]
        fn prop_arbitrary_frames_never_panic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let bridge = SlowPathBridge::new("eth0");
            bridge.handle_frame(0, Bytes::from(data));
            let stats = bridge.get_stats();
            prop_assert_eq!(stats.total_packets, 1);
            prop_assert_eq!(stats.dropped_packets, 1);
        }
    }
}
