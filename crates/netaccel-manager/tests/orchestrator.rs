//! End-to-end orchestrator scenarios against the in-memory host and loader

use etherparse::PacketBuilder;
use netaccel_common::testing::{FakeHost, FakeInterface};
use netaccel_common::{Outcome, Service, ServiceProtocol};
use netaccel_manager::{AccelError, AccelerationConfig, AccelerationManager, Accelerator, ManagerPhase};
use netaccel_xdp::testing::FakeLoader;
use netaccel_xdp::{PacketClass, PacketProcessor, SlowPathPacket, SERVICE_RULES_MAP, STATS_MAP, XSKS_MAP};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PF: &str = "0000:03:00.0";
const MODERN_KERNEL: &str = "Linux version 5.15.0-91-generic";
const OLD_KERNEL: &str = "Linux version 4.15.0-20-generic";

fn base_host(kernel: &str) -> FakeHost {
    FakeHost::new()
        .with_cpu_layout(2, 4, 1)
        .with_meminfo("HugePages_Total:       0\nHugepagesize:       2048 kB\n")
        .with_kernel_version(kernel)
        .with_cmdline("ro quiet intel_iommu=on")
}

fn nic_host(kernel: &str) -> Arc<FakeHost> {
    Arc::new(base_host(kernel).with_interface("eth0", FakeInterface::new("ixgbe").pci(PF).queues(4)))
}

fn sriov_host() -> Arc<FakeHost> {
    Arc::new(base_host(MODERN_KERNEL).with_sriov_pf(PF, "i40e", "eth0", 8))
}

fn config(enabled: &[Accelerator]) -> AccelerationConfig {
    let mut config = AccelerationConfig {
        interface: "eth0".to_string(),
        enabled: enabled.to_vec(),
        stats_interval: Duration::from_secs(60),
        ..Default::default()
    };
    config.zero_copy.num_queues = 2;
    config.xdp.stats_interval = Duration::from_secs(60);
    config.sriov.max_vfs_per_pf = 4;
    config.sriov.vf_settle_delay = Duration::ZERO;
    config.sriov.stats_interval = Duration::from_secs(60);
    config.cpu.stats_interval = Duration::from_secs(60);
    config
}

fn service(id: u64, addr: &str, port: u16, auth: bool) -> Service {
    Service {
        id,
        name: format!("svc-{}", id),
        address: addr.parse().unwrap(),
        port,
        protocol: ServiceProtocol::Tcp,
        auth_required: auth,
    }
}

fn tls_frame(dst: [u8; 4], port: u16) -> Vec<u8> {
    let payload = [0x16, 0x03, 0x01, 0x00, 0x05, 0x01, 0x00, 0x00, 0x01, 0x00];
    let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([192, 168, 1, 20], dst, 64)
        .tcp(40000, port, 1, 1024);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, &payload).unwrap();
    frame
}

#[derive(Default)]
struct Recorder {
    packets: Mutex<Vec<SlowPathPacket>>,
}

impl PacketProcessor for Recorder {
    fn handle(&self, packet: SlowPathPacket) {
        self.packets.lock().push(packet);
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

#[tokio::test]
async fn test_old_kernel_keeps_only_fast_path() {
    let loader = Arc::new(FakeLoader::new());
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp, Accelerator::AfXdp]),
        nic_host(OLD_KERNEL),
        loader.clone(),
    );

    manager.initialize().await.unwrap();
    assert_eq!(manager.phase(), ManagerPhase::Initialized);
    assert_eq!(manager.get_active_technologies(), vec![Accelerator::Xdp]);

    let stats = manager.get_stats();
    assert!(stats.xdp.is_some());
    assert!(stats.zero_copy.is_none());
    assert!(stats.bridge.is_none());
    assert!(manager.bridge().is_none());
    assert!(loader.opened_sockets().is_empty());

    let caps = manager.get_capabilities().unwrap();
    assert!(caps.xdp.available);
    assert!(!caps.af_xdp.available);

    manager.stop().await;
}

#[tokio::test]
async fn test_failed_technology_does_not_fail_initialize() {
    let loader = Arc::new(FakeLoader::new().fail_load());
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp, Accelerator::AfXdp, Accelerator::CpuAffinity]),
        nic_host(MODERN_KERNEL),
        loader,
    );

    manager.initialize().await.unwrap();
    let active = manager.get_active_technologies();
    assert!(!active.contains(&Accelerator::Xdp));
    assert_eq!(active, vec![Accelerator::AfXdp, Accelerator::CpuAffinity]);
    // No fast path, nothing to bridge
    assert!(manager.bridge().is_none());

    manager.start().await.unwrap();
    assert!(manager.is_running());
    manager.stop().await;
}

#[tokio::test]
async fn test_unsupported_technology_is_skipped() {
    // SR-IOV enabled but the NIC has no VFs to offer
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp, Accelerator::Sriov]),
        nic_host(MODERN_KERNEL),
        Arc::new(FakeLoader::new()),
    );

    manager.initialize().await.unwrap();
    assert_eq!(manager.get_active_technologies(), vec![Accelerator::Xdp]);
    assert!(manager.sriov().is_none());
    assert!(manager.get_stats().sriov.is_none());
    manager.stop().await;
}

#[tokio::test]
async fn test_bridge_delivers_slow_path_packets() {
    let host = nic_host(MODERN_KERNEL);
    let loader = Arc::new(FakeLoader::new());
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp, Accelerator::AfXdp, Accelerator::CpuAffinity]),
        host.clone(),
        loader.clone(),
    );

    let recorder = Arc::new(Recorder::default());
    manager.set_packet_processor(Some(recorder.clone()));
    manager.initialize().await.unwrap();

    assert_eq!(
        manager.get_active_technologies(),
        vec![Accelerator::Xdp, Accelerator::AfXdp, Accelerator::CpuAffinity]
    );
    let bridge = manager.bridge().unwrap();
    assert!(bridge.is_wired());
    assert!(bridge.has_processor());
    assert_eq!(loader.map_entries(XSKS_MAP).len(), 2);

    let report = manager
        .update_services(&[service(7, "10.0.1.5", 443, true)])
        .await;
    assert_eq!(report.outcome(), Outcome::Applied);
    assert_eq!(loader.map_entries(SERVICE_RULES_MAP).len(), 1);

    manager.start().await.unwrap();

    // Each worker pins itself to the isolated packet cores
    assert!(wait_until(|| host.affinity_calls().len() == 2).await);
    for (tid, cpus) in host.affinity_calls() {
        assert_eq!(tid, 0);
        assert_eq!(cpus, vec![2, 3, 6, 7]);
    }

    loader.inject_frame(0, tls_frame([10, 0, 1, 5], 443));
    assert!(wait_until(|| recorder.packets.lock().len() == 1).await);
    {
        let packets = recorder.packets.lock();
        assert_eq!(packets[0].class, PacketClass::Tls);
        assert_eq!(packets[0].service_id, Some(7));
        assert!(packets[0].needs_auth);
    }

    // Counters are bumped after the processor returns
    let mut counted = false;
    for _ in 0..200 {
        manager.refresh_stats().await;
        let stats = manager.get_stats();
        if stats.slow_path_packets == 1 && stats.zero_copy.as_ref().is_some_and(|zc| zc.delivered == 1) {
            counted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(counted);
    assert_eq!(manager.get_stats().bridge.unwrap().tls_packets, 1);

    manager.stop().await;
    assert!(loader.map_entries(XSKS_MAP).is_empty());
}

#[tokio::test]
async fn test_processor_rewired_without_restart() {
    let loader = Arc::new(FakeLoader::new());
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp, Accelerator::AfXdp]),
        nic_host(MODERN_KERNEL),
        loader.clone(),
    );
    manager.initialize().await.unwrap();
    manager.start().await.unwrap();

    let bridge = manager.bridge().unwrap();
    assert!(!bridge.has_processor());

    // Without a consumer the frame is dropped
    loader.inject_frame(1, tls_frame([10, 0, 9, 9], 8443));
    assert!(wait_until(|| bridge.get_stats().dropped_packets == 1).await);

    let recorder = Arc::new(Recorder::default());
    manager.set_packet_processor(Some(recorder.clone()));
    assert!(bridge.has_processor());

    loader.inject_frame(1, tls_frame([10, 0, 9, 9], 8443));
    assert!(wait_until(|| recorder.packets.lock().len() == 1).await);
    assert_eq!(recorder.packets.lock()[0].service_id, None);

    manager.stop().await;
}

#[tokio::test]
async fn test_sriov_and_cpu_through_orchestrator() {
    let host = sriov_host();
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp, Accelerator::Sriov, Accelerator::CpuAffinity]),
        host.clone(),
        Arc::new(FakeLoader::new()),
    );

    // Stored now, applied during initialize
    let services = [
        service(1, "10.0.1.5", 443, true),
        service(2, "10.0.2.5", 80, false),
    ];
    let early = manager.update_services(&services).await;
    assert!(early.applied_items().is_empty());

    manager.initialize().await.unwrap();
    assert_eq!(
        manager.get_active_technologies(),
        vec![Accelerator::Xdp, Accelerator::Sriov, Accelerator::CpuAffinity]
    );

    let sriov = manager.sriov().unwrap();
    let vfs = sriov.get_virtual_functions();
    assert_eq!(vfs.len(), 4);
    let unique: HashSet<_> = vfs.iter().map(|vf| vf.pci_address.clone()).collect();
    assert_eq!(unique.len(), 4);
    assert_eq!(vfs.iter().filter(|vf| vf.assigned_service.is_some()).count(), 2);

    let cpu = manager.cpu().unwrap();
    let packet = cpu.get_core_group("packet").unwrap();
    let system = cpu.get_core_group("system").unwrap();
    assert_eq!(packet.cpus, vec![2, 3, 6, 7]);
    assert_eq!(system.cpus, vec![0, 1, 4, 5]);
    assert_eq!(packet.assigned_services, vec![1]);
    assert_eq!(system.assigned_services, vec![2]);

    // Dropping a service releases its VF and placement
    let report = manager.update_services(&services[..1]).await;
    assert!(report.is_applied());
    assert_eq!(
        sriov.get_virtual_functions().iter().filter(|vf| vf.assigned_service.is_some()).count(),
        1
    );
    assert!(cpu.get_core_group("system").unwrap().assigned_services.is_empty());

    manager.refresh_stats().await;
    let stats = manager.get_stats();
    assert_eq!(stats.sriov.as_ref().unwrap().total_vfs, 4);
    assert_eq!(stats.cpu.as_ref().unwrap().isolated_cpus, 4);

    let report = manager.stop().await;
    assert!(report.is_applied());
    assert_eq!(host.num_vfs(PF), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let loader = Arc::new(FakeLoader::new());
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp, Accelerator::AfXdp]),
        nic_host(MODERN_KERNEL),
        loader.clone(),
    );
    manager.initialize().await.unwrap();
    manager.start().await.unwrap();

    manager.stop().await;
    assert_eq!(manager.phase(), ManagerPhase::Stopped);
    assert!(manager.get_active_technologies().is_empty());
    assert!(loader.attached().is_empty());
    let detaches = loader.detaches().len();
    assert_eq!(detaches, 1);

    let second = manager.stop().await;
    assert!(second.applied_items().is_empty());
    assert!(second.failures().is_empty());
    assert_eq!(loader.detaches().len(), detaches);
    assert_eq!(manager.get_stats().total_packets, 0);
}

#[tokio::test]
async fn test_stop_from_initialized() {
    let loader = Arc::new(FakeLoader::new());
    let manager = AccelerationManager::new(config(&[Accelerator::Xdp]), nic_host(MODERN_KERNEL), loader.clone());

    manager.initialize().await.unwrap();
    manager.stop().await;
    assert_eq!(manager.phase(), ManagerPhase::Stopped);
    assert!(loader.attached().is_empty());
}

#[tokio::test]
async fn test_lifecycle_guards() {
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp]),
        nic_host(MODERN_KERNEL),
        Arc::new(FakeLoader::new()),
    );

    assert!(matches!(manager.start().await, Err(AccelError::NotInitialized)));
    // Nothing to stop yet
    assert!(manager.stop().await.applied_items().is_empty());
    assert_eq!(manager.phase(), ManagerPhase::Uninitialized);

    manager.initialize().await.unwrap();
    assert!(matches!(manager.initialize().await, Err(AccelError::AlreadyInitialized)));

    manager.start().await.unwrap();
    assert!(matches!(manager.start().await, Err(AccelError::AlreadyRunning)));

    manager.stop().await;
    assert!(matches!(
        manager.initialize().await,
        Err(AccelError::InvalidState(ManagerPhase::Stopped))
    ));
    assert!(matches!(
        manager.start().await,
        Err(AccelError::InvalidState(ManagerPhase::Stopped))
    ));
}

#[tokio::test]
async fn test_detection_failure_is_fatal() {
    let host = Arc::new(base_host(MODERN_KERNEL).fail_interface_scan());
    let manager = AccelerationManager::new(config(&[Accelerator::Xdp]), host, Arc::new(FakeLoader::new()));

    assert!(matches!(manager.initialize().await, Err(AccelError::Detection(_))));
    assert_eq!(manager.phase(), ManagerPhase::Uninitialized);
    assert!(manager.get_capabilities().is_none());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp]),
        nic_host(MODERN_KERNEL),
        Arc::new(FakeLoader::new()),
    );

    let mut bad = config(&[Accelerator::Xdp]);
    bad.interface.clear();
    assert!(matches!(manager.update_config(bad).await, Err(AccelError::InvalidConfig(_))));
    assert_eq!(manager.config().interface, "eth0");

    let mut bad = config(&[Accelerator::Xdp]);
    bad.packet_batch_size = 0;
    let manager = AccelerationManager::new(bad, nic_host(MODERN_KERNEL), Arc::new(FakeLoader::new()));
    assert!(matches!(manager.initialize().await, Err(AccelError::InvalidConfig(_))));
    assert_eq!(manager.phase(), ManagerPhase::Uninitialized);
}

#[tokio::test]
async fn test_update_config_restarts_running_manager() {
    let loader = Arc::new(FakeLoader::new());
    let manager = AccelerationManager::new(config(&[Accelerator::Xdp]), nic_host(MODERN_KERNEL), loader.clone());
    manager.initialize().await.unwrap();

    // Not running: stored only
    manager.update_config(config(&[Accelerator::Xdp])).await.unwrap();
    assert_eq!(loader.loads().len(), 1);
    assert_eq!(manager.phase(), ManagerPhase::Initialized);

    manager.start().await.unwrap();
    manager
        .update_config(config(&[Accelerator::Xdp, Accelerator::AfXdp]))
        .await
        .unwrap();

    assert!(manager.is_running());
    assert_eq!(loader.loads().len(), 2);
    assert_eq!(
        manager.get_active_technologies(),
        vec![Accelerator::Xdp, Accelerator::AfXdp]
    );
    assert!(manager.bridge().is_some());
    assert!(manager.config().is_enabled(Accelerator::AfXdp));

    manager.stop().await;
}

#[tokio::test]
async fn test_failed_restart_is_reported() {
    let host = nic_host(MODERN_KERNEL);
    let loader = Arc::new(FakeLoader::new());
    let manager = AccelerationManager::new(config(&[Accelerator::Xdp]), host.clone(), loader.clone());
    manager.initialize().await.unwrap();
    manager.start().await.unwrap();

    host.set_interface_scan_failing(true);
    let err = manager
        .update_config(config(&[Accelerator::Xdp, Accelerator::AfXdp]))
        .await
        .unwrap_err();
    assert!(matches!(err, AccelError::Restart(ref inner) if matches!(**inner, AccelError::Detection(_))));

    // The old technologies are gone and nothing new came up
    assert_eq!(manager.phase(), ManagerPhase::Uninitialized);
    assert!(manager.get_active_technologies().is_empty());
    assert!(loader.attached().is_empty());
    assert!(manager.config().is_enabled(Accelerator::AfXdp));

    // Once the host is readable again the stored config comes up
    host.set_interface_scan_failing(false);
    manager.initialize().await.unwrap();
    manager.start().await.unwrap();
    assert_eq!(
        manager.get_active_technologies(),
        vec![Accelerator::Xdp, Accelerator::AfXdp]
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_packets_per_second_tracks_counter_growth() {
    let loader = Arc::new(FakeLoader::new());
    let manager = AccelerationManager::new(config(&[Accelerator::Xdp]), nic_host(MODERN_KERNEL), loader.clone());
    manager.initialize().await.unwrap();
    manager.start().await.unwrap();

    // Slot 0 of the stats map is the total packet counter
    loader.set_stat(STATS_MAP, 0, 1_000);
    let started = Instant::now();
    manager.refresh_stats().await;
    assert_eq!(manager.get_stats().total_packets, 1_000);

    tokio::time::sleep(Duration::from_millis(100)).await;
    loader.set_stat(STATS_MAP, 0, 1_500);
    manager.refresh_stats().await;
    let longest = started.elapsed().as_secs_f64();

    let stats = manager.get_stats();
    assert_eq!(stats.total_packets, 1_500);
    assert!(stats.last_update.is_some());
    // 500 new packets over at least 100ms and at most the whole window
    assert!(stats.packets_per_second > 0.0);
    assert!(stats.packets_per_second <= 500.0 / 0.1);
    assert!(stats.packets_per_second >= 500.0 / longest);

    // No growth, no rate
    manager.refresh_stats().await;
    assert_eq!(manager.get_stats().packets_per_second, 0.0);

    manager.stop().await;
}

#[tokio::test]
async fn test_capability_summary() {
    let manager = AccelerationManager::new(
        config(&[Accelerator::Xdp]),
        nic_host(OLD_KERNEL),
        Arc::new(FakeLoader::new()),
    );
    assert_eq!(manager.capability_summary(), "hardware not detected yet");

    manager.initialize().await.unwrap();
    let summary = manager.capability_summary();
    assert!(summary.starts_with("Hardware acceleration capabilities"));
    assert!(summary.contains("needs: Linux kernel 4.18+"));
    manager.stop().await;
}
