//! Natmapper - keeps local services reachable from behind NAT
//!
//! This library watches a range of local ports and, for every port that comes
//! alive, establishes an externally reachable mapping. Router-cooperative UPnP
//! mappings are tried first; when the router does not cooperate, a TURN relay
//! allocation is made and application bytes are forwarded through it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod events;
pub mod mapping;
pub mod monitor;
pub mod nat;
pub mod service;
pub mod shutdown;
pub mod storage;
pub mod turn;

pub use mapping::{MappingError, MappingManager, PortMapping, Protocol};
pub use nat::{NatError, NatInfo, NatType};
pub use turn::TurnError;

/// Result type alias for Natmapper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Natmapper operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Persistent storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Port mapping error
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// TURN relay error
    #[error("TURN error: {0}")]
    Turn(#[from] TurnError),

    /// NAT classification error
    #[error("NAT detection error: {0}")]
    Nat(#[from] NatError),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize logging for the Natmapper daemon
///
/// Reads the filter from `RUST_LOG`, falling back to `info`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests;
