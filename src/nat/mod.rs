//! NAT behaviour classification
//!
//! This module determines which kind of NAT the host sits behind by comparing
//! the addresses several public STUN servers report back. The result is
//! advisory: it helps operators reason about which mapping mechanism will
//! work. Nothing else in the crate consumes it at runtime.

// Submodules
pub mod admission;
pub mod cgnat;
pub mod classifier;
pub mod stun;

pub use admission::{AdmissionPolicy, ContactedPeers};
pub use cgnat::{is_cgnat, is_private_ip, is_private_range};
pub use classifier::{classify_samples, NatClassifier, SystemInfo};
pub use stun::{StunClient, StunProbe};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, UdpSocket};
use thiserror::Error;

/// NAT behaviour class
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    /// Class 1: full cone, or no NAT at all
    FullCone,
    /// Class 2: restricted cone
    RestrictedCone,
    /// Class 3: port-restricted cone
    PortRestricted,
    /// Class 4: symmetric (includes double NAT)
    Symmetric,
    /// Could not be determined
    Unknown,
}

impl NatType {
    /// Numeric class (1-4), `None` when unknown
    pub fn class(&self) -> Option<u8> {
        match self {
            NatType::FullCone => Some(1),
            NatType::RestrictedCone => Some(2),
            NatType::PortRestricted => Some(3),
            NatType::Symmetric => Some(4),
            NatType::Unknown => None,
        }
    }

    /// Human readable description
    pub fn description(&self) -> &'static str {
        match self {
            NatType::FullCone => "Full cone NAT or no NAT (any host can reach a mapped port)",
            NatType::RestrictedCone => "Restricted cone NAT (only previously contacted hosts)",
            NatType::PortRestricted => {
                "Port-restricted cone NAT (only previously contacted host and port pairs)"
            }
            NatType::Symmetric => "Symmetric NAT (mapping differs per destination)",
            NatType::Unknown => "Unknown NAT type",
        }
    }

    /// Traversal strategies worth trying, best first
    pub fn recommendations(&self) -> &'static [&'static str] {
        match self {
            NatType::FullCone => &[
                "UPnP port mapping",
                "Direct inbound connections",
                "STUN-assisted hole punching",
            ],
            NatType::RestrictedCone => &[
                "UPnP port mapping",
                "STUN-assisted hole punching after an outbound packet",
                "TURN relay as fallback",
            ],
            NatType::PortRestricted => &[
                "UPnP port mapping",
                "Coordinated hole punching with exact port prediction",
                "TURN relay as fallback",
            ],
            NatType::Symmetric => &[
                "TURN relay",
                "UPnP port mapping on the outermost router",
            ],
            NatType::Unknown => &["UPnP port mapping", "TURN relay"],
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            Some(class) => write!(f, "NAT{} ({})", class, self.description()),
            None => f.write_str(self.description()),
        }
    }
}

/// Result of one NAT classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NatInfo {
    /// Detected class
    pub nat_type: NatType,
    /// Public address reported by the first reachable STUN server
    pub public_ip: Option<IpAddr>,
    /// Public port reported by the first reachable STUN server
    pub public_port: Option<u16>,
    /// Local outbound address
    pub local_ip: Option<IpAddr>,
    /// Free-text description
    pub description: String,
    /// When the classification was made
    pub detected_at: DateTime<Utc>,
}

impl NatInfo {
    /// Traversal strategies for the detected class
    pub fn recommendations(&self) -> &'static [&'static str] {
        self.nat_type.recommendations()
    }
}

/// Errors that can occur during NAT classification
#[derive(Debug, Error)]
pub enum NatError {
    /// No STUN server answered
    #[error("No STUN server responded")]
    NoStunResponse,

    /// A STUN exchange failed
    #[error("STUN error: {0}")]
    Stun(String),

    /// Timed out waiting for a STUN response
    #[error("STUN request timed out")]
    Timeout,

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local outbound address
///
/// Opens a throwaway UDP socket toward a public address and reads the local
/// endpoint the OS picked. No data is sent.
pub fn detect_local_ip() -> Result<IpAddr, NatError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}
