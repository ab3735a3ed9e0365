//! Seams between the forwarding logic and the TURN wire protocol

use super::TurnError;
use crate::config::TurnServer;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// One relay allocation on a TURN server
#[async_trait]
pub trait RelayConn: Send + Sync {
    /// Public relay transport address
    fn relayed_addr(&self) -> SocketAddr;

    /// Server the allocation lives on
    fn server(&self) -> &str;

    /// Receive the next datagram a peer sent to the relay address
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send a datagram to a peer through the relay
    async fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<usize>;

    /// Whether the allocation is still alive on the server
    async fn is_connected(&self) -> bool;

    /// Release the allocation; safe to call more than once
    async fn close(&self);
}

/// Creates relay allocations on a given server
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Authenticate against `server` and allocate a relay address
    async fn allocate(&self, server: &TurnServer) -> Result<Arc<dyn RelayConn>, TurnError>;
}
