//! Connection-admission predicates per NAT class
//!
//! The relay forwarder is one code path for every NAT class; a policy only
//! decides which new peers may open a session. Forwarders built by the TURN
//! provider admit everyone; restrictive policies are opt-in.

use super::NatType;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};

/// Which new peers a forwarder accepts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Any peer (class 1)
    #[default]
    AdmitAll,
    /// Only hosts we have sent to before (class 2)
    KnownHosts,
    /// Only host and port pairs we have sent to before (class 3)
    KnownHostPorts,
    /// Nobody (class 4, unsupported)
    Reject,
}

impl AdmissionPolicy {
    /// Policy matching a NAT class; unknown NATs admit everyone
    pub fn for_nat_type(nat_type: NatType) -> Self {
        match nat_type {
            NatType::FullCone | NatType::Unknown => AdmissionPolicy::AdmitAll,
            NatType::RestrictedCone => AdmissionPolicy::KnownHosts,
            NatType::PortRestricted => AdmissionPolicy::KnownHostPorts,
            NatType::Symmetric => AdmissionPolicy::Reject,
        }
    }

    /// Whether `peer` may open a new session
    pub fn admits(&self, peer: SocketAddr, contacted: &ContactedPeers) -> bool {
        match self {
            AdmissionPolicy::AdmitAll => true,
            AdmissionPolicy::KnownHosts => contacted.knows_host(peer.ip()),
            AdmissionPolicy::KnownHostPorts => contacted.knows_endpoint(peer),
            AdmissionPolicy::Reject => false,
        }
    }
}

/// Contacts remembered before the oldest are forgotten
pub const DEFAULT_CONTACT_CAPACITY: usize = 4096;

/// Peers this side has sent traffic to
///
/// Bounded: once `capacity` endpoints are known, recording a new one forgets
/// the oldest.
#[derive(Debug, Clone)]
pub struct ContactedPeers {
    capacity: usize,
    order: VecDeque<SocketAddr>,
    endpoints: HashSet<SocketAddr>,
    hosts: HashMap<IpAddr, usize>,
}

impl Default for ContactedPeers {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CONTACT_CAPACITY)
    }
}

impl ContactedPeers {
    /// Empty set with the default capacity
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty set remembering at most `capacity` endpoints
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            endpoints: HashSet::new(),
            hosts: HashMap::new(),
        }
    }

    /// Remember an outbound contact
    pub fn record(&mut self, peer: SocketAddr) {
        if !self.endpoints.insert(peer) {
            return;
        }
        self.order.push_back(peer);
        *self.hosts.entry(peer.ip()).or_insert(0) += 1;

        while self.order.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.endpoints.remove(&oldest);
            if let Some(count) = self.hosts.get_mut(&oldest.ip()) {
                *count -= 1;
                if *count == 0 {
                    self.hosts.remove(&oldest.ip());
                }
            }
        }
    }

    /// Whether any port of `host` was contacted
    pub fn knows_host(&self, host: IpAddr) -> bool {
        self.hosts.contains_key(&host)
    }

    /// Whether exactly `peer` was contacted
    pub fn knows_endpoint(&self, peer: SocketAddr) -> bool {
        self.endpoints.contains(&peer)
    }

    /// Number of remembered endpoints
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing was contacted yet
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
