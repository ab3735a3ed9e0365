//! Liveness probes for local ports
//!
//! A successful bind means nothing is listening (inactive); a bind failure
//! means a service already holds the port (active).
//!
//! Known limitation: a UDP service that binds with address reuse does not
//! hold the port exclusively, so the bind probe can report it inactive. The
//! echo probe used for manually registered UDP ports is best-effort cover for
//! that case; a service that never answers stays inactive.

use crate::mapping::Protocol;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Payload sent by the UDP echo probe
pub const ECHO_PROBE_PAYLOAD: &[u8] = b"natmapper-probe";

/// Strategy deciding whether a port is active
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Probe one port; `protocol` is `None` for range-watched ports
    async fn probe(&self, port: u16, protocol: Option<Protocol>) -> bool;
}

/// Whether a TCP bind on all interfaces fails for `port`
pub fn tcp_port_in_use(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_err()
}

/// Whether a UDP bind on all interfaces fails for `port`
pub fn udp_port_in_use(port: u16) -> bool {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).is_err()
}

/// Bind probe: TCP first, then UDP
pub fn port_in_use(port: u16) -> bool {
    tcp_port_in_use(port) || udp_port_in_use(port)
}

/// Try to connect to a local TCP service
pub async fn tcp_connect_probe(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Send a datagram to a local UDP service and wait for any reply
pub async fn udp_echo_probe(port: u16, timeout: Duration) -> bool {
    let socket = match tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            trace!("Echo probe could not bind: {}", e);
            return false;
        }
    };
    if socket.connect((Ipv4Addr::LOCALHOST, port)).await.is_err() {
        return false;
    }
    if socket.send(ECHO_PROBE_PAYLOAD).await.is_err() {
        return false;
    }

    let mut buf = [0u8; 512];
    matches!(
        tokio::time::timeout(timeout, socket.recv(&mut buf)).await,
        Ok(Ok(_))
    )
}

/// Probe used for the configured range: plain bind test
#[derive(Debug, Clone, Copy, Default)]
pub struct BindProbe;

#[async_trait]
impl PortProbe for BindProbe {
    async fn probe(&self, port: u16, _protocol: Option<Protocol>) -> bool {
        tokio::task::spawn_blocking(move || port_in_use(port))
            .await
            .unwrap_or(false)
    }
}

/// Probe used for explicitly registered ports
///
/// TCP ports are active if the bind test fails or a local connect succeeds.
/// UDP ports are active if the bind test fails or the echo probe is answered.
#[derive(Debug, Clone, Copy)]
pub struct ServiceProbe {
    timeout: Duration,
}

impl ServiceProbe {
    /// Create a probe with the given connect/echo timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PortProbe for ServiceProbe {
    async fn probe(&self, port: u16, protocol: Option<Protocol>) -> bool {
        match protocol.unwrap_or(Protocol::Tcp) {
            Protocol::Tcp => {
                let bound = tokio::task::spawn_blocking(move || tcp_port_in_use(port))
                    .await
                    .unwrap_or(false);
                bound || tcp_connect_probe(port, self.timeout).await
            }
            Protocol::Udp => {
                let bound = tokio::task::spawn_blocking(move || udp_port_in_use(port))
                    .await
                    .unwrap_or(false);
                bound || udp_echo_probe(port, self.timeout).await
            }
        }
    }
}
