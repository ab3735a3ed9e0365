use super::support::{monitor_config, wait_until, FakeProbe, Recorder};
use crate::config::PortRange;
use crate::events::PortEvent;
use crate::mapping::{LivenessSource, Protocol};
use crate::monitor::probe::{tcp_port_in_use, udp_echo_probe};
use crate::monitor::*;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

fn event(port: u16, active: bool, protocol: Option<Protocol>) -> PortEvent {
    PortEvent {
        port,
        active,
        protocol,
    }
}

#[tokio::test]
async fn test_auto_monitor_watches_whole_range() {
    let probe = FakeProbe::new();
    let monitor =
        AutoPortMonitor::with_probe(PortRange::new(18000, 18004, 2), &monitor_config(), probe)
            .await;

    let statuses = monitor.get_all_statuses().await;
    let ports: Vec<u16> = statuses.iter().map(|s| s.port).collect();
    assert_eq!(ports, vec![18000, 18002, 18004]);
    assert!(statuses.iter().all(|s| !s.active && s.last_seen.is_none()));
    assert_eq!(monitor.get_inactive_ports().await.len(), 3);
}

#[tokio::test]
async fn test_auto_monitor_edge_triggered() {
    let probe = FakeProbe::new();
    let monitor = AutoPortMonitor::with_probe(
        PortRange::new(18000, 18002, 1),
        &monitor_config(),
        probe.clone(),
    )
    .await;

    assert!(monitor.check_now().await.is_empty(), "Nothing changed yet");

    probe.set(18001, true);
    assert_eq!(monitor.check_now().await, vec![event(18001, true, None)]);
    assert!(
        monitor.check_now().await.is_empty(),
        "A steady state must not re-emit"
    );
    assert_eq!(monitor.get_active_ports().await, vec![18001]);

    let status = monitor.get_port_status(18001).await.expect("watched port");
    assert!(status.active);
    assert!(status.last_seen.is_some());

    probe.set(18001, false);
    assert_eq!(monitor.check_now().await, vec![event(18001, false, None)]);
    assert!(monitor.get_active_ports().await.is_empty());
}

#[tokio::test]
async fn test_changes_sorted_by_port() {
    let probe = FakeProbe::new();
    let monitor = AutoPortMonitor::with_probe(
        PortRange::new(18000, 18002, 1),
        &monitor_config(),
        probe.clone(),
    )
    .await;

    probe.set(18002, true);
    probe.set(18000, true);
    let events = monitor.check_now().await;
    assert_eq!(
        events,
        vec![event(18000, true, None), event(18002, true, None)]
    );
}

#[tokio::test]
async fn test_callbacks_receive_changes() {
    let probe = FakeProbe::new();
    let monitor = AutoPortMonitor::with_probe(
        PortRange::new(18000, 18001, 1),
        &monitor_config(),
        probe.clone(),
    )
    .await;
    let recorder = Recorder::new();
    monitor.add_callback(recorder.callback());

    probe.set(18000, true);
    monitor.check_now().await;

    assert!(wait_until(Duration::from_secs(2), || recorder.len() == 1).await);
    assert_eq!(recorder.events(), vec![event(18000, true, None)]);
}

#[tokio::test]
async fn test_panicking_callback_is_isolated() {
    let probe = FakeProbe::new();
    let monitor = AutoPortMonitor::with_probe(
        PortRange::new(18000, 18000, 1),
        &monitor_config(),
        probe.clone(),
    )
    .await;
    monitor.add_callback(|_| panic!("listener bug"));
    let recorder = Recorder::new();
    monitor.add_callback(recorder.callback());

    probe.set(18000, true);
    monitor.check_now().await;
    probe.set(18000, false);
    monitor.check_now().await;

    assert!(
        wait_until(Duration::from_secs(2), || recorder.len() == 2).await,
        "Healthy listener must still see both transitions"
    );
}

#[tokio::test]
async fn test_background_loop_start_stop() {
    let probe = FakeProbe::new();
    probe.set(18000, true);
    let monitor = AutoPortMonitor::with_probe(
        PortRange::new(18000, 18000, 1),
        &monitor_config(),
        probe.clone(),
    )
    .await;
    let recorder = Recorder::new();
    monitor.add_callback(recorder.callback());

    monitor.start().await;
    monitor.start().await;
    assert!(wait_until(Duration::from_secs(3), || recorder.len() == 1).await);
    monitor.stop().await;

    probe.set(18000, false);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(recorder.len(), 1, "No probing after stop");
}

#[tokio::test]
async fn test_manual_monitor_registration() {
    let monitor = ManualPortMonitor::with_probe(&monitor_config(), FakeProbe::new());

    assert!(monitor.add_port(9000, Protocol::Udp).await);
    assert!(!monitor.add_port(9000, Protocol::Udp).await, "Duplicate add");
    assert!(monitor.add_port(9001, Protocol::Tcp).await);

    let status = monitor.get_port_status(9000).await.expect("registered");
    assert_eq!(status.protocol, Some(Protocol::Udp));

    let removed = monitor.remove_port(9001).await.expect("was registered");
    assert_eq!(removed.port, 9001);
    assert!(monitor.remove_port(9001).await.is_none());
    assert_eq!(monitor.get_all_statuses().await.len(), 1);
}

#[tokio::test]
async fn test_manual_events_carry_protocol() {
    let probe = FakeProbe::new();
    let monitor = ManualPortMonitor::with_probe(&monitor_config(), probe.clone());
    monitor.add_port(9000, Protocol::Udp).await;

    probe.set(9000, true);
    assert_eq!(
        monitor.check_now().await,
        vec![event(9000, true, Some(Protocol::Udp))]
    );
}

#[tokio::test]
async fn test_manual_monitor_as_liveness_source() {
    let probe = FakeProbe::new();
    let monitor = ManualPortMonitor::with_probe(&monitor_config(), probe.clone());

    assert_eq!(monitor.is_port_active(7000).await, None, "Untracked port");

    monitor.add_port(7000, Protocol::Tcp).await;
    assert_eq!(monitor.is_port_active(7000).await, Some(false));

    probe.set(7000, true);
    monitor.check_now().await;
    assert_eq!(monitor.is_port_active(7000).await, Some(true));
}

#[tokio::test]
async fn test_bind_probe_sees_listener() {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).expect("bind");
    let port = listener.local_addr().expect("addr").port();

    assert!(tcp_port_in_use(port));
    assert!(BindProbe.probe(port, None).await);

    let monitor = AutoPortMonitor::new(PortRange::new(port, port, 1), &monitor_config()).await;
    assert_eq!(monitor.check_now().await, vec![event(port, true, None)]);

    drop(listener);
    assert!(!tcp_port_in_use(port));
    assert_eq!(monitor.check_now().await, vec![event(port, false, None)]);
}

#[tokio::test]
async fn test_service_probe_tcp_connect() {
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        while let Ok((_stream, _)) = listener.accept().await {}
    });

    let probe = ServiceProbe::new(Duration::from_millis(300));
    assert!(probe.probe(port, Some(Protocol::Tcp)).await);
}

#[tokio::test]
async fn test_udp_echo_probe() {
    let server = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let port = server.local_addr().expect("addr").port();
    let echo = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        if let Ok((len, from)) = server.recv_from(&mut buf).await {
            let _ = server.send_to(&buf[..len], from).await;
        }
    });

    assert!(udp_echo_probe(port, Duration::from_millis(500)).await);
    echo.await.expect("echo task");

    let silent = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
    let silent_port = silent.local_addr().expect("addr").port();
    assert!(!udp_echo_probe(silent_port, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_probe_trait_object() {
    let probe: Arc<dyn PortProbe> = FakeProbe::new();
    assert!(!probe.probe(1234, Some(Protocol::Tcp)).await);
}
