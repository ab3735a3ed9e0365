//! Common types for the mapping layer

use crate::turn::TurnError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Transport protocol of a mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl Protocol {
    /// Lowercase wire name (`tcp` / `udp`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(MappingError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// How a mapping was requested
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AddType {
    /// Created because the port monitor saw the port come alive
    Auto,
    /// Registered explicitly by the operator
    Manual,
}

impl fmt::Display for AddType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddType::Auto => f.write_str("auto"),
            AddType::Manual => f.write_str("manual"),
        }
    }
}

/// Mechanism a provider uses to expose a port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Router-cooperative IGD port mapping
    Upnp,
    /// Relay-cooperative TURN allocation with forwarding
    Turn,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::Upnp => f.write_str("upnp"),
            ProviderType::Turn => f.write_str("turn"),
        }
    }
}

/// Lifecycle state of a mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    /// Mapping is established and the local service is alive
    Active,
    /// Mapping exists but the local service is not responding
    Inactive,
    /// Mapping could not be (re)established
    Failed,
}

/// Identity of a mapping: `(internal port, external port, protocol)`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MappingKey {
    /// Internal (local) port
    pub internal_port: u16,
    /// External port
    pub external_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

impl MappingKey {
    /// Build a key
    pub fn new(internal_port: u16, external_port: u16, protocol: Protocol) -> Self {
        Self {
            internal_port,
            external_port,
            protocol,
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.internal_port, self.external_port, self.protocol
        )
    }
}

/// An externally reachable binding for a local port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    /// Internal (local) port
    pub internal_port: u16,
    /// External port on the router or relay
    pub external_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
    /// Human readable description
    pub description: String,
    /// How the mapping was requested
    pub add_type: AddType,
    /// Provider owning the mapping
    pub provider: ProviderType,
    /// Current state
    pub status: MappingStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last time the mapping was renewed or observed alive
    pub last_activity: DateTime<Utc>,
    /// Public address (IP or `ip:port`) if known
    pub external_address: Option<String>,
    /// Last error recorded against the mapping
    pub error: Option<String>,
}

impl PortMapping {
    /// Create a freshly established, active mapping
    pub fn new(
        key: MappingKey,
        description: impl Into<String>,
        add_type: AddType,
        provider: ProviderType,
    ) -> Self {
        let now = Utc::now();
        Self {
            internal_port: key.internal_port,
            external_port: key.external_port,
            protocol: key.protocol,
            description: description.into(),
            add_type,
            provider,
            status: MappingStatus::Active,
            created_at: now,
            last_activity: now,
            external_address: None,
            error: None,
        }
    }

    /// Identity key of this mapping
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.internal_port, self.external_port, self.protocol)
    }

    /// Whether this mapping occupies the slot a request for
    /// `(internal, external, protocol)` would need
    ///
    /// An external port of 0 means "any", so it collides with every mapping of
    /// the same internal port and protocol.
    pub fn collides_with(&self, internal_port: u16, external_port: u16, protocol: Protocol) -> bool {
        self.internal_port == internal_port
            && self.protocol == protocol
            && (external_port == 0 || self.external_port == external_port)
    }
}

/// Snapshot of a provider's state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderStatus {
    /// Provider mechanism
    pub provider: ProviderType,
    /// Provider display name
    pub name: String,
    /// Whether the provider can currently serve requests
    pub available: bool,
    /// Number of mappings owned
    pub mapping_count: usize,
    /// Healthy backing resources (gateway clients or TURN holes)
    pub healthy: usize,
    /// Total backing resources
    pub total: usize,
    /// Last error, if any
    pub last_error: Option<String>,
}

impl ProviderStatus {
    /// Healthy/total ratio; 1.0 when there is nothing to be unhealthy
    pub fn health_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.healthy as f64 / self.total as f64
        }
    }
}

/// Errors that can occur during port mapping
#[derive(Debug, Error)]
pub enum MappingError {
    /// Network timeout waiting for a gateway
    #[error("Mapping request timed out")]
    Timeout,

    /// Gateway returned an error
    #[error("Gateway error: {0}")]
    GatewayError(String),

    /// No gateway found on network
    #[error("No gateway found")]
    NoGateway,

    /// A mapping with this key already exists
    #[error("Mapping {0} already exists")]
    Conflict(MappingKey),

    /// No mapping with this key exists
    #[error("Mapping {0} not found")]
    NotFound(MappingKey),

    /// Protocol string is neither `tcp` nor `udp`
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Provider cannot serve requests right now
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Every provider refused the request
    #[error("All providers failed: {0}")]
    AllProvidersFailed(String),

    /// No provider could be started
    #[error("No mapping provider could be started")]
    NoProviders,

    /// TURN relay error
    #[error("TURN error: {0}")]
    Turn(#[from] TurnError),

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
