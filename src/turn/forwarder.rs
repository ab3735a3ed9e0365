//! Relays peer traffic between a TURN allocation and a local service
//!
//! TCP peers get a session each: the first datagram from a new peer opens a
//! stream to the local port and bytes flow both ways until either side
//! closes or the session idles out. A session whose queue fills up is closed
//! so one slow local connection never holds up the receive loop. UDP is
//! request/response: each datagram is sent from a fresh ephemeral socket and
//! at most one reply is relayed back before the wait times out.

use super::relay::RelayConn;
use super::types::ForwardRule;
use crate::mapping::Protocol;
use crate::nat::{AdmissionPolicy, ContactedPeers};
use crate::shutdown::{Shutdown, ShutdownSignal};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Largest datagram accepted from the relay
const MAX_DATAGRAM: usize = 65_535;

/// Buffered peer datagrams per TCP session
const SESSION_QUEUE: usize = 256;

/// UDP round trips in flight per rule; datagrams beyond this are dropped
pub const MAX_UDP_IN_FLIGHT: usize = 128;

/// Forwarder tuning
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Host the local service listens on
    pub local_host: IpAddr,
    /// Wait for a UDP reply from the local service
    pub udp_response_timeout: Duration,
    /// Close TCP sessions idle for this long
    pub tcp_idle_timeout: Duration,
    /// Timeout connecting to the local service
    pub connect_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            local_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_response_timeout: Duration::from_secs(2),
            tcp_idle_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

struct Session {
    id: u64,
    tx: mpsc::Sender<Bytes>,
    task: AbortHandle,
}

type Sessions = Arc<Mutex<HashMap<SocketAddr, Session>>>;

/// Counts a relayed connection as open until dropped
struct OpenConnection(Arc<ForwardRule>);

impl OpenConnection {
    fn new(rule: &Arc<ForwardRule>) -> Self {
        rule.connection_opened();
        Self(Arc::clone(rule))
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// Pumps traffic for one forward rule
pub struct Forwarder {
    rule: Arc<ForwardRule>,
    relay: Arc<dyn RelayConn>,
    config: ForwarderConfig,
    policy: AdmissionPolicy,
    contacted: Arc<RwLock<ContactedPeers>>,
    sessions: Sessions,
    next_session: AtomicU64,
    udp_slots: Arc<Semaphore>,
    shutdown: Shutdown,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Forwarder {
    /// Create a forwarder; nothing runs until [`Forwarder::start`]
    pub fn new(
        rule: Arc<ForwardRule>,
        relay: Arc<dyn RelayConn>,
        config: ForwarderConfig,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            rule,
            relay,
            config,
            policy,
            contacted: Arc::new(RwLock::new(ContactedPeers::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session: AtomicU64::new(0),
            udp_slots: Arc::new(Semaphore::new(MAX_UDP_IN_FLIGHT)),
            shutdown: Shutdown::new(),
            task: Mutex::new(None),
        }
    }

    /// Rule this forwarder serves
    pub fn rule(&self) -> &Arc<ForwardRule> {
        &self.rule
    }

    /// Admission policy in force
    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Remember a peer we reached out to, for restrictive policies
    pub async fn mark_contacted(&self, peer: SocketAddr) {
        self.contacted.write().await.record(peer);
    }

    /// Number of open TCP sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether the receive loop is running
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the receive loop
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let signal = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move { this.run(signal).await }));
        info!(
            "Forwarding relay port {} -> {}:{}/{}",
            self.rule.external_port, self.config.local_host, self.rule.local_port, self.rule.protocol
        );
    }

    /// Stop the receive loop and every session
    ///
    /// Sessions observe the signal at their next read or write; in-flight
    /// transfers are cut, not drained.
    pub async fn close(&self) {
        self.shutdown.trigger();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        for (_, session) in self.sessions.lock().await.drain() {
            session.task.abort();
        }
        debug!(
            "Forwarder for relay port {} closed",
            self.rule.external_port
        );
    }

    async fn run(self: Arc<Self>, mut signal: ShutdownSignal) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = signal.recv() => break,
                received = self.relay.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        let payload = Bytes::copy_from_slice(&buf[..len]);
                        self.dispatch(payload, peer, &signal).await;
                    }
                    Err(e) => {
                        if !signal.is_shutdown() {
                            warn!(
                                "Relay {} receive failed, forwarder stopping: {}",
                                self.relay.relayed_addr(), e
                            );
                        }
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, payload: Bytes, peer: SocketAddr, signal: &ShutdownSignal) {
        match self.rule.protocol {
            Protocol::Udp => {
                if !self.admits(peer).await {
                    return;
                }
                let Ok(slot) = Arc::clone(&self.udp_slots).try_acquire_owned() else {
                    debug!(
                        "{} UDP round trips in flight on relay port {}, dropping datagram from {}",
                        MAX_UDP_IN_FLIGHT, self.rule.external_port, peer
                    );
                    return;
                };
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.relay_udp(payload, peer).await;
                    drop(slot);
                });
            }
            Protocol::Tcp => self.relay_tcp(payload, peer, signal).await,
        }
    }

    async fn admits(&self, peer: SocketAddr) -> bool {
        let admitted = self.policy.admits(peer, &*self.contacted.read().await);
        if !admitted {
            debug!("Peer {} rejected by {:?} policy", peer, self.policy);
        }
        admitted
    }

    async fn relay_udp(&self, payload: Bytes, peer: SocketAddr) {
        let local = SocketAddr::new(self.config.local_host, self.rule.local_port);
        let _open = OpenConnection::new(&self.rule);

        let result = async {
            let socket = UdpSocket::bind(SocketAddr::new(unspecified(local.ip()), 0)).await?;
            socket.send_to(&payload, local).await?;
            self.rule.record_inbound(payload.len());

            let mut buf = vec![0u8; MAX_DATAGRAM];
            match tokio::time::timeout(self.config.udp_response_timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    self.relay.send_to(&buf[..len], peer).await?;
                    self.rule.record_outbound(len);
                    self.contacted.write().await.record(peer);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => trace!("No UDP reply from {} for {}", local, peer),
            }
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            debug!("UDP relay {} <-> {} failed: {}", peer, local, e);
        }
    }

    async fn relay_tcp(self: &Arc<Self>, payload: Bytes, peer: SocketAddr, signal: &ShutdownSignal) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&peer) {
            match session.tx.try_send(payload.clone()) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "TCP session for {} on relay port {} is not keeping up, closing it",
                        peer, self.rule.external_port
                    );
                    if let Some(stalled) = sessions.remove(&peer) {
                        stalled.task.abort();
                    }
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    trace!("Session for {} already ended", peer);
                    sessions.remove(&peer);
                }
            }
        }

        if !self.admits(peer).await {
            return;
        }

        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        if tx.try_send(payload).is_err() {
            return;
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let signal = signal.clone();
        let task = tokio::spawn(async move {
            let _open = OpenConnection::new(&this.rule);
            if let Err(e) = this.tcp_session(peer, rx, signal).await {
                debug!("TCP session for {} ended: {}", peer, e);
            }
            let mut sessions = this.sessions.lock().await;
            if sessions.get(&peer).is_some_and(|s| s.id == id) {
                sessions.remove(&peer);
            }
        });
        sessions.insert(
            peer,
            Session {
                id,
                tx,
                task: task.abort_handle(),
            },
        );
    }

    async fn tcp_session(
        &self,
        peer: SocketAddr,
        mut rx: mpsc::Receiver<Bytes>,
        mut signal: ShutdownSignal,
    ) -> std::io::Result<()> {
        let local = SocketAddr::new(self.config.local_host, self.rule.local_port);
        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(local))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        debug!("TCP session {} <-> {} opened", peer, local);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = signal.recv() => break,
                incoming = rx.recv() => match incoming {
                    Some(data) => {
                        stream.write_all(&data).await?;
                        self.rule.record_inbound(data.len());
                    }
                    None => break,
                },
                read = stream.read(&mut buf) => {
                    let len = read?;
                    if len == 0 {
                        break;
                    }
                    self.relay.send_to(&buf[..len], peer).await?;
                    self.rule.record_outbound(len);
                    self.contacted.write().await.record(peer);
                }
                _ = tokio::time::sleep(self.config.tcp_idle_timeout) => {
                    debug!("TCP session {} idle, closing", peer);
                    break;
                }
            }
        }

        let _ = stream.shutdown().await;
        debug!("TCP session {} <-> {} closed", peer, local);
        Ok(())
    }
}

fn unspecified(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}
