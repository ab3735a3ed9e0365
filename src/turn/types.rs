//! TURN allocation, forward-rule and hole records

use super::client::TurnClient;
use super::forwarder::Forwarder;
use crate::mapping::Protocol;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of a hole: local port and protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoleKey {
    /// Local port
    pub port: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

impl HoleKey {
    /// Create a key
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl fmt::Display for HoleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.port, self.protocol)
    }
}

/// A relay port held by a TURN client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatedPort {
    /// Relay port on the server
    pub port: u16,
    /// Full relay transport address
    pub relayed_address: String,
    /// When the allocation was made
    pub allocated_at: DateTime<Utc>,
    /// Last claim or traffic
    pub last_used: DateTime<Utc>,
    /// Cleared when an idle shared allocation is retired
    pub active: bool,
    /// Number of current users
    pub usage_count: u32,
}

/// Snapshot of a forward rule's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleStats {
    /// Bytes relayed from peers into the local service
    pub bytes_in: u64,
    /// Bytes relayed from the local service back to peers
    pub bytes_out: u64,
    /// Sessions ever opened
    pub connections: u64,
    /// Sessions open right now
    pub active_connections: u64,
}

/// Binding of a relay port to a local service port
///
/// Counters only grow until [`ForwardRule::reset_stats`] is called.
#[derive(Debug)]
pub struct ForwardRule {
    /// Relay port peers connect to
    pub external_port: u16,
    /// Local service port
    pub local_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
    /// Creation time
    pub created_at: DateTime<Utc>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    connections: AtomicU64,
    active_connections: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl ForwardRule {
    /// Create a rule with zeroed counters
    pub fn new(external_port: u16, local_port: u16, protocol: Protocol) -> Self {
        let now = Utc::now();
        Self {
            external_port,
            local_port,
            protocol,
            created_at: now,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Count bytes delivered to the local service
    pub fn record_inbound(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Count bytes delivered back to a peer
    pub fn record_outbound(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    /// A session started
    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// A session ended
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.touch();
    }

    /// Current counters
    pub fn stats(&self) -> RuleStats {
        RuleStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }

    /// Zero the cumulative counters; open sessions are still counted
    pub fn reset_stats(&self) {
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.connections.store(0, Ordering::Relaxed);
    }

    /// Last traffic through the rule
    pub fn last_activity(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_activity_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }
}

/// Traffic totals of a hole across repairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Bytes sent from the local service to peers
    pub bytes_sent: u64,
    /// Bytes received from peers
    pub bytes_received: u64,
    /// Sessions handled
    pub connections: u64,
}

impl TrafficStats {
    /// Fold a rule's counters into these totals
    pub fn absorb(&mut self, stats: RuleStats) {
        self.bytes_sent += stats.bytes_out;
        self.bytes_received += stats.bytes_in;
        self.connections += stats.connections;
    }
}

/// Lifecycle state of a hole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoleState {
    /// Key reserved; relay allocation and forwarder setup in progress
    Allocating,
    /// Relay and forwarder are running
    Active,
    /// Last health check failed; repair pending
    Inactive,
    /// Repair did not succeed; retried on the next health check
    Failed,
}

/// A relayed local port
///
/// The TURN client and forwarder are owned by the hole; repair swaps them in
/// place while port, protocol, creation time and traffic history stay.
#[derive(Clone)]
pub struct HoleInfo {
    /// Local port
    pub port: u16,
    /// Relay port peers connect to
    pub external_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
    /// Free-form description
    pub description: String,
    /// Public relay transport address
    pub external_address: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last health verdict or repair
    pub last_activity: DateTime<Utc>,
    /// Lifecycle state
    pub state: HoleState,
    /// Result of the last health check
    pub healthy: bool,
    /// Successful repairs so far
    pub repairs: u32,
    /// Last repair or health error
    pub last_error: Option<String>,
    pub(crate) base_stats: TrafficStats,
    pub(crate) client: Option<Arc<TurnClient>>,
    pub(crate) forwarder: Option<Arc<Forwarder>>,
}

impl HoleInfo {
    /// Key of this hole
    pub fn key(&self) -> HoleKey {
        HoleKey::new(self.port, self.protocol)
    }

    /// Totals including traffic carried by replaced forwarders
    pub fn stats(&self) -> TrafficStats {
        let mut total = self.base_stats;
        if let Some(forwarder) = &self.forwarder {
            total.absorb(forwarder.rule().stats());
        }
        total
    }

    /// Forward rule currently serving the hole
    pub fn rule(&self) -> Option<Arc<ForwardRule>> {
        self.forwarder.as_ref().map(|f| Arc::clone(f.rule()))
    }

    /// TURN server the hole is allocated on
    pub fn server(&self) -> Option<String> {
        self.client.as_ref().and_then(|c| c.server())
    }
}

impl fmt::Debug for HoleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HoleInfo")
            .field("key", &self.key())
            .field("external_port", &self.external_port)
            .field("external_address", &self.external_address)
            .field("state", &self.state)
            .field("healthy", &self.healthy)
            .field("repairs", &self.repairs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hole_key_display() {
        assert_eq!(HoleKey::new(9000, Protocol::Udp).to_string(), "9000-udp");
        assert_eq!(HoleKey::new(22, Protocol::Tcp).to_string(), "22-tcp");
    }

    #[test]
    fn test_connection_closed_never_underflows() {
        let rule = ForwardRule::new(50000, 9000, Protocol::Tcp);
        rule.connection_closed();
        assert_eq!(rule.stats().active_connections, 0);
    }
}
