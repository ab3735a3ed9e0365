//! Mapping providers and the manager that fails over between them
//!
//! This module exposes a uniform provider contract with two implementations:
//! - `UpnpProvider` - IGD port mapping via SOAP calls on the router
//! - `TurnProvider` - TURN relay allocation with application-level forwarding
//!
//! The `MappingManager` tries UPnP first and falls through to TURN when the
//! router does not cooperate.

// Submodules
pub mod manager;
pub mod provider;
pub mod turn;
pub mod types;
pub mod upnp;

// Re-export commonly used types
pub use types::{
    AddType, MappingError, MappingKey, MappingStatus, PortMapping, Protocol, ProviderStatus,
    ProviderType,
};

// Re-export providers and manager
pub use manager::MappingManager;
pub use provider::MappingProvider;
pub use turn::TurnProvider;
pub use upnp::{
    GatewayClient, GatewayDiscovery, GatewayHealth, IgdDiscovery, IgdGateway, LivenessSource,
    UpnpProvider,
};
