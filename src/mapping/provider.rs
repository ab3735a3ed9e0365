//! The contract every mapping mechanism implements

use super::types::{AddType, MappingError, PortMapping, Protocol, ProviderStatus, ProviderType};
use async_trait::async_trait;
use std::time::Duration;

/// A mechanism able to make a local port externally reachable
///
/// Each provider owns its mapping table, its availability flag and its
/// health logic. Mutations of the table are serialized by the provider so
/// two concurrent creates for one key cannot both succeed.
#[async_trait]
pub trait MappingProvider: Send + Sync {
    /// Mechanism implemented by this provider
    fn provider_type(&self) -> ProviderType;

    /// Display name for logs and status
    fn name(&self) -> &str;

    /// Whether the provider can currently serve requests
    fn is_available(&self) -> bool;

    /// Start background maintenance, ticking every `poll_interval`
    async fn start(&self, poll_interval: Duration) -> Result<(), MappingError>;

    /// Stop background maintenance and release every mapping
    async fn stop(&self) -> Result<(), MappingError>;

    /// Establish a mapping; rejects a key that is already present
    async fn create_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        description: &str,
        add_type: AddType,
    ) -> Result<PortMapping, MappingError>;

    /// Remove a mapping; `NotFound` if this provider does not own it
    async fn remove_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        add_type: AddType,
    ) -> Result<PortMapping, MappingError>;

    /// Snapshot of every mapping owned by the provider
    async fn get_mappings(&self) -> Vec<PortMapping>;

    /// Current provider status
    async fn get_status(&self) -> ProviderStatus;
}
