//! TURN hole punching and relay forwarding
//!
//! For every local port that needs traversal a fresh TURN client allocates a
//! relay address, a forward rule binds the relay port to the local port, and
//! a forwarder pumps bytes between the relay and the local service:
//! - `session` - one TURN allocation on a server (wire protocol)
//! - `client` - server failover, allocation table and forward rules
//! - `forwarder` - TCP session / UDP request-response relaying
//! - `hole` - the hole table with health-driven in-place repair

// Submodules
pub mod client;
pub mod forwarder;
pub mod hole;
pub mod relay;
pub mod session;
pub mod types;

pub use client::TurnClient;
pub use forwarder::{Forwarder, ForwarderConfig, MAX_UDP_IN_FLIGHT};
pub use hole::{HealthSummary, HolePuncher};
pub use relay::{RelayConn, RelayConnector};
pub use session::{TurnRelayConnector, TurnSession};
pub use types::{AllocatedPort, ForwardRule, HoleInfo, HoleKey, HoleState, RuleStats, TrafficStats};

use crate::mapping::Protocol;
use thiserror::Error;

/// Errors raised by the TURN subsystem
#[derive(Debug, Error)]
pub enum TurnError {
    /// No TURN server is configured
    #[error("No TURN servers configured")]
    NoServers,

    /// Every configured server refused or was unreachable
    #[error("All TURN servers failed: {0}")]
    AllServersFailed(String),

    /// Server rejected our credentials
    #[error("TURN authentication failed: {0}")]
    Auth(String),

    /// Timed out talking to the server
    #[error("TURN request timed out")]
    Timeout,

    /// Malformed or unexpected protocol exchange
    #[error("TURN protocol error: {0}")]
    Protocol(String),

    /// A hole for this key already exists
    #[error("Hole {port}-{protocol} already exists")]
    HoleExists {
        /// Local port
        port: u16,
        /// Transport protocol
        protocol: Protocol,
    },

    /// No hole for this key
    #[error("Hole {port}-{protocol} not found")]
    HoleNotFound {
        /// Local port
        port: u16,
        /// Transport protocol
        protocol: Protocol,
    },

    /// The hole is still being allocated
    #[error("Hole {port}-{protocol} is still being allocated")]
    HoleAllocating {
        /// Local port
        port: u16,
        /// Transport protocol
        protocol: Protocol,
    },

    /// No forward rule for this key
    #[error("Forward rule {port}-{protocol} not found")]
    RuleNotFound {
        /// Local port
        port: u16,
        /// Transport protocol
        protocol: Protocol,
    },

    /// No allocation for this relay port
    #[error("Relay port {0} is not allocated")]
    PortNotAllocated(u16),

    /// The client was closed
    #[error("TURN client closed")]
    Closed,

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
