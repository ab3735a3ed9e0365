// Shared fakes - in-process stand-ins for gateways, relays, STUN servers and probes

use crate::config::{MonitorConfig, TurnConfig, TurnServer, UpnpConfig};
use crate::mapping::{GatewayClient, GatewayDiscovery, LivenessSource, MappingError, Protocol};
use crate::monitor::PortProbe;
use crate::nat::{NatError, StunProbe};
use crate::turn::{RelayConn, RelayConnector, TurnError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const STUB_EXTERNAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
pub const RELAY_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
pub const FIRST_RELAY_PORT: u16 = 50000;

pub fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        check_interval_secs: 1,
        cleanup_interval_secs: 60,
        probe_timeout_ms: 200,
        callback_timeout_secs: 1,
    }
}

pub fn upnp_config() -> UpnpConfig {
    UpnpConfig {
        retry_attempts: 1,
        retry_delay_ms: 10,
        request_timeout_secs: 2,
        ..UpnpConfig::default()
    }
}

pub fn turn_server(address: &str) -> TurnServer {
    TurnServer {
        address: address.to_string(),
        username: "user".to_string(),
        password: "secret".to_string(),
        realm: String::new(),
    }
}

pub fn turn_config(servers: &[&str]) -> TurnConfig {
    TurnConfig {
        enabled: true,
        servers: servers.iter().map(|s| turn_server(s)).collect(),
        udp_response_timeout_ms: 500,
        tcp_idle_timeout_secs: 5,
        request_timeout_secs: 1,
        ..TurnConfig::default()
    }
}

/// Probe answering from a settable set of active ports
#[derive(Default)]
pub struct FakeProbe {
    active: Mutex<HashSet<u16>>,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, port: u16, active: bool) {
        let mut ports = self.active.lock().unwrap();
        if active {
            ports.insert(port);
        } else {
            ports.remove(&port);
        }
    }
}

#[async_trait]
impl PortProbe for FakeProbe {
    async fn probe(&self, port: u16, _protocol: Option<Protocol>) -> bool {
        self.active.lock().unwrap().contains(&port)
    }
}

/// IGD stand-in that keeps its port mappings in memory
pub struct StubGateway {
    mappings: Mutex<HashMap<(Protocol, u16), (u16, u32, String)>>,
    add_calls: AtomicUsize,
    add_delay_ms: AtomicU64,
    failing: AtomicBool,
}

impl StubGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mappings: Mutex::new(HashMap::new()),
            add_calls: AtomicUsize::new(0),
            add_delay_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every `add_port` block for `delay` first
    pub fn set_add_delay(&self, delay: Duration) {
        self.add_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn has(&self, protocol: Protocol, external_port: u16) -> bool {
        self.mappings
            .lock()
            .unwrap()
            .contains_key(&(protocol, external_port))
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), MappingError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(MappingError::GatewayError("stub gateway refused".to_string()))
        } else {
            Ok(())
        }
    }
}

impl GatewayClient for StubGateway {
    fn name(&self) -> String {
        "stub-gateway".to_string()
    }

    fn add_port(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        lease_secs: u32,
        description: &str,
    ) -> Result<(), MappingError> {
        let delay = self.add_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.check()?;
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        self.mappings.lock().unwrap().insert(
            (protocol, external_port),
            (internal_port, lease_secs, description.to_string()),
        );
        Ok(())
    }

    fn remove_port(&self, protocol: Protocol, external_port: u16) -> Result<(), MappingError> {
        self.check()?;
        self.mappings
            .lock()
            .unwrap()
            .remove(&(protocol, external_port))
            .map(|_| ())
            .ok_or_else(|| MappingError::GatewayError("NoSuchEntryInArray".to_string()))
    }

    fn external_ip(&self) -> Result<IpAddr, MappingError> {
        self.check()?;
        Ok(STUB_EXTERNAL_IP)
    }
}

/// Discovery returning a configurable stub gateway
pub struct StubDiscovery {
    gateway: Mutex<Option<Arc<StubGateway>>>,
    calls: AtomicUsize,
}

impl StubDiscovery {
    pub fn with(gateway: Arc<StubGateway>) -> Arc<Self> {
        Arc::new(Self {
            gateway: Mutex::new(Some(gateway)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn none() -> Arc<Self> {
        Arc::new(Self {
            gateway: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, gateway: Option<Arc<StubGateway>>) {
        *self.gateway.lock().unwrap() = gateway;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GatewayDiscovery for StubDiscovery {
    fn discover(&self, _timeout: Duration) -> Result<Vec<Arc<dyn GatewayClient>>, MappingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.gateway.lock().unwrap().clone() {
            Some(gateway) => Ok(vec![gateway as Arc<dyn GatewayClient>]),
            None => Err(MappingError::NoGateway),
        }
    }
}

/// Liveness answers set by the test
#[derive(Default)]
pub struct FakeLiveness {
    ports: Mutex<HashMap<u16, bool>>,
}

impl FakeLiveness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, port: u16, active: bool) {
        self.ports.lock().unwrap().insert(port, active);
    }
}

#[async_trait]
impl LivenessSource for FakeLiveness {
    async fn is_port_active(&self, port: u16) -> Option<bool> {
        self.ports.lock().unwrap().get(&port).copied()
    }
}

type Datagram = (Vec<u8>, SocketAddr);

/// In-memory relay allocation
///
/// Tests inject peer datagrams with [`FakeRelay::inject`] and read what the
/// forwarder sent back with [`FakeRelay::next_sent`].
pub struct FakeRelay {
    addr: SocketAddr,
    server: String,
    inbound_tx: mpsc::UnboundedSender<Datagram>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    sent_tx: mpsc::UnboundedSender<Datagram>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakeRelay {
    pub fn new(addr: SocketAddr, server: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            addr,
            server: server.to_string(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn inject(&self, data: &[u8], peer: SocketAddr) {
        let _ = self.inbound_tx.send((data.to_vec(), peer));
    }

    pub async fn next_sent(&self, timeout: Duration) -> Option<Datagram> {
        let mut rx = self.sent_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConn for FakeRelay {
    fn relayed_addr(&self) -> SocketAddr {
        self.addr
    }

    fn server(&self) -> &str {
        &self.server
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some((data, peer)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, peer))
            }
            None => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "relay gone")),
        }
    }

    async fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "relay closed"));
        }
        let _ = self.sent_tx.send((data.to_vec(), peer));
        Ok(data.len())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeRelay`]s with increasing relay ports
pub struct FakeConnector {
    next_port: AtomicU16,
    refusing: Mutex<HashSet<String>>,
    refuse_all: AtomicBool,
    relays: Mutex<Vec<Arc<FakeRelay>>>,
    allocate_delay_ms: AtomicU64,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(FIRST_RELAY_PORT),
            refusing: Mutex::new(HashSet::new()),
            refuse_all: AtomicBool::new(false),
            relays: Mutex::new(Vec::new()),
            allocate_delay_ms: AtomicU64::new(0),
        })
    }

    /// Make every allocation take `delay`
    pub fn set_allocate_delay(&self, delay: Duration) {
        self.allocate_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn refuse_server(&self, address: &str) {
        self.refusing.lock().unwrap().insert(address.to_string());
    }

    pub fn set_refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn relays(&self) -> Vec<Arc<FakeRelay>> {
        self.relays.lock().unwrap().clone()
    }

    pub fn relay_on_port(&self, port: u16) -> Option<Arc<FakeRelay>> {
        self.relays()
            .into_iter()
            .find(|r| r.relayed_addr().port() == port)
    }
}

#[async_trait]
impl RelayConnector for FakeConnector {
    async fn allocate(&self, server: &TurnServer) -> Result<Arc<dyn RelayConn>, TurnError> {
        let delay = self.allocate_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.refuse_all.load(Ordering::SeqCst)
            || self.refusing.lock().unwrap().contains(&server.address)
        {
            return Err(TurnError::Auth("401 Unauthorized".to_string()));
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let relay = Arc::new(FakeRelay::new(SocketAddr::new(RELAY_IP, port), &server.address));
        self.relays.lock().unwrap().push(Arc::clone(&relay));
        Ok(relay)
    }
}

/// STUN answers keyed by server name; unknown servers time out
#[derive(Default)]
pub struct ScriptedStun {
    answers: HashMap<String, SocketAddr>,
}

impl ScriptedStun {
    pub fn new(answers: &[(&str, &str)]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(server, mapped)| (server.to_string(), mapped.parse().unwrap()))
                .collect(),
        }
    }
}

#[async_trait]
impl StunProbe for ScriptedStun {
    async fn mapped_address(&self, server: &str) -> Result<SocketAddr, NatError> {
        self.answers.get(server).copied().ok_or(NatError::Timeout)
    }
}

pub fn peer(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), port)
}

/// Poll `check` every 10ms until it holds or `timeout` passes
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collects events delivered to a callback
#[derive(Clone)]
pub struct Recorder<E> {
    events: Arc<Mutex<Vec<E>>>,
}

impl<E: Clone + Send + 'static> Recorder<E> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> impl Fn(E) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event| events.lock().unwrap().push(event)
    }

    pub fn events(&self) -> Vec<E> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}
