use super::support::{monitor_config, upnp_config, FakeProbe, StubDiscovery, StubGateway};
use crate::config::PortRange;
use crate::events::PortEvent;
use crate::mapping::*;
use crate::monitor::{AutoPortMonitor, ManualPortMonitor};
use crate::service::*;
use crate::storage::MappingStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct Harness {
    service: NatService,
    gateway: Arc<StubGateway>,
    auto_probe: Arc<FakeProbe>,
}

async fn harness(data_dir: &Path) -> Harness {
    let gateway = StubGateway::new();
    let upnp = UpnpProvider::with_discovery(
        &upnp_config(),
        &monitor_config(),
        StubDiscovery::with(gateway.clone()),
    );
    let mut manager = MappingManager::new(&monitor_config());
    manager.add_provider(upnp.clone());

    let auto_probe = FakeProbe::new();
    let auto_monitor = AutoPortMonitor::with_probe(
        PortRange::new(18000, 18002, 1),
        &monitor_config(),
        auto_probe.clone(),
    )
    .await;
    let manual_monitor = ManualPortMonitor::with_probe(&monitor_config(), FakeProbe::new());

    let service = NatService::from_parts(
        manager,
        auto_monitor,
        manual_monitor,
        MappingStore::new(data_dir),
        Some(upnp),
    );
    Harness {
        service,
        gateway,
        auto_probe,
    }
}

async fn mapped(service: &NatService, port: u16, protocol: Protocol) -> Option<PortMapping> {
    service.manager().find_mapping(port, protocol).await
}

/// Poll until the mapping for `port` is present (or absent)
async fn wait_for_mapping(service: &NatService, port: u16, present: bool) -> bool {
    for _ in 0..50 {
        if mapped(service, port, Protocol::Tcp).await.is_some() == present {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[test]
fn test_auto_description() {
    assert_eq!(auto_description(18000), "AutoUPnP-18000");
}

#[tokio::test]
async fn test_port_events_drive_mappings() {
    let dir = tempdir().expect("tempdir");
    let h = harness(dir.path()).await;
    h.service.manager().start().await.expect("start");

    NatService::handle_port_event(
        h.service.manager(),
        PortEvent {
            port: 18000,
            active: true,
            protocol: None,
        },
    )
    .await;
    let mapping = mapped(&h.service, 18000, Protocol::Tcp)
        .await
        .expect("mapped as TCP");
    assert_eq!(mapping.key().to_string(), "18000:18000:tcp");
    assert_eq!(mapping.description, "AutoUPnP-18000");
    assert_eq!(mapping.add_type, AddType::Auto);
    assert!(h.gateway.has(Protocol::Tcp, 18000));

    let inactive = PortEvent {
        port: 18000,
        active: false,
        protocol: None,
    };
    NatService::handle_port_event(h.service.manager(), inactive.clone()).await;
    assert!(mapped(&h.service, 18000, Protocol::Tcp).await.is_none());
    assert!(!h.gateway.has(Protocol::Tcp, 18000));

    NatService::handle_port_event(h.service.manager(), inactive).await;
    assert!(h.service.manager().get_mappings().await.is_empty());
    h.service.manager().stop().await;
}

#[tokio::test]
async fn test_port_events_applied_in_order() {
    let dir = tempdir().expect("tempdir");
    let h = harness(dir.path()).await;
    h.service.manager().start().await.expect("start");
    h.gateway.set_add_delay(Duration::from_millis(1000));

    let dispatch = NatService::port_event_dispatcher(Arc::clone(h.service.manager()));
    dispatch(PortEvent {
        port: 18000,
        active: true,
        protocol: None,
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    dispatch(PortEvent {
        port: 18000,
        active: false,
        protocol: None,
    });

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(
        h.service.manager().get_mappings().await.is_empty(),
        "Inactive event applied after the slow add"
    );
    assert!(!h.gateway.has(Protocol::Tcp, 18000));
    h.service.manager().stop().await;
}

#[tokio::test]
async fn test_port_events_for_other_ports_not_queued_behind() {
    let dir = tempdir().expect("tempdir");
    let h = harness(dir.path()).await;
    h.service.manager().start().await.expect("start");

    let dispatch = NatService::port_event_dispatcher(Arc::clone(h.service.manager()));
    for port in [18000, 18001] {
        dispatch(PortEvent {
            port,
            active: true,
            protocol: None,
        });
    }
    assert!(wait_for_mapping(&h.service, 18000, true).await);
    assert!(wait_for_mapping(&h.service, 18001, true).await);
    h.service.manager().stop().await;
}

#[tokio::test]
async fn test_auto_monitor_wired_on_start() {
    let dir = tempdir().expect("tempdir");
    let h = harness(dir.path()).await;
    h.service.start().await.expect("start");
    h.service.start().await.expect("second start is a no-op");
    assert!(h.service.is_running());

    h.auto_probe.set(18001, true);
    assert!(
        wait_for_mapping(&h.service, 18001, true).await,
        "Port coming alive gets mapped"
    );
    assert_eq!(h.service.status().await.active_ports, vec![18001]);

    h.auto_probe.set(18001, false);
    assert!(
        wait_for_mapping(&h.service, 18001, false).await,
        "Port going away gets unmapped"
    );

    h.service.stop().await;
    assert!(!h.service.is_running());
}

#[tokio::test]
async fn test_manual_mapping_persisted_and_removed() {
    let dir = tempdir().expect("tempdir");
    let h = harness(dir.path()).await;
    h.service.start().await.expect("start");

    let mapping = h
        .service
        .add_manual_mapping(7000, 7000, Protocol::Udp, "game")
        .await
        .expect("add");
    assert_eq!(mapping.add_type, AddType::Manual);
    assert!(h.service.manual_monitor().get_port_status(7000).await.is_some());

    let stored = h.service.store().load().expect("load");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].description, "game");
    assert_eq!(stored[0].protocol, Protocol::Udp);

    h.service
        .remove_manual_mapping(7000, 7000, Protocol::Udp)
        .await
        .expect("remove");
    assert!(h.service.store().load().expect("load").is_empty());
    assert!(h.service.manual_monitor().get_port_status(7000).await.is_none());
    assert!(mapped(&h.service, 7000, Protocol::Udp).await.is_none());

    let missing = h
        .service
        .remove_manual_mapping(7000, 7000, Protocol::Udp)
        .await;
    assert!(missing.is_err());
    h.service.stop().await;
}

#[tokio::test]
async fn test_failed_manual_mapping_not_persisted() {
    let dir = tempdir().expect("tempdir");
    let h = harness(dir.path()).await;
    h.service.start().await.expect("start");
    h.service
        .add_manual_mapping(7001, 0, Protocol::Tcp, "first")
        .await
        .expect("add");

    let duplicate = h
        .service
        .add_manual_mapping(7001, 0, Protocol::Tcp, "second")
        .await;
    assert!(duplicate.is_err());
    let stored = h.service.store().load().expect("load");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].description, "first");
    h.service.stop().await;
}

#[tokio::test]
async fn test_manual_mappings_restored_on_start() {
    let dir = tempdir().expect("tempdir");
    {
        let h = harness(dir.path()).await;
        h.service.start().await.expect("start");
        h.service
            .add_manual_mapping(7002, 0, Protocol::Udp, "voice")
            .await
            .expect("add");
        h.service.stop().await;
    }

    let h = harness(dir.path()).await;
    h.service.start().await.expect("restart");
    let restored = mapped(&h.service, 7002, Protocol::Udp)
        .await
        .expect("restored from store");
    assert_eq!(restored.description, "voice");
    assert_eq!(restored.add_type, AddType::Manual);
    assert!(h.gateway.has(Protocol::Udp, 7002));
    assert!(h.service.manual_monitor().get_port_status(7002).await.is_some());
    h.service.stop().await;
}

#[tokio::test]
async fn test_status_snapshot() {
    let dir = tempdir().expect("tempdir");
    let h = harness(dir.path()).await;
    let before = h.service.status().await;
    assert!(!before.running);

    h.service.start().await.expect("start");
    h.service
        .add_manual_mapping(7003, 0, Protocol::Tcp, "ssh")
        .await
        .expect("add");

    let status = h.service.status().await;
    assert!(status.running);
    assert_eq!(status.providers.len(), 1);
    assert!(status.providers[0].available);
    assert_eq!(status.mappings.len(), 1);
    assert!(status.active_ports.is_empty());

    let json = serde_json::to_string(&status).expect("serialize");
    assert!(json.contains("\"running\":true"));
    h.service.stop().await;
}
