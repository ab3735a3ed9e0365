//! TURN relay mapping provider
//!
//! Every mapping is backed by exactly one hole in the [`HolePuncher`]; the
//! external port of a mapping is the relay port the TURN server allocated,
//! whatever external port was requested.

use super::provider::MappingProvider;
use super::types::{
    AddType, MappingError, MappingKey, MappingStatus, PortMapping, Protocol, ProviderStatus,
    ProviderType,
};
use crate::config::{MonitorConfig, TurnConfig};
use crate::turn::{HoleInfo, HoleKey, HolePuncher, HoleState, TurnError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Mapping provider relaying through TURN servers
pub struct TurnProvider {
    puncher: Arc<HolePuncher>,
    has_servers: bool,
    mappings: RwLock<HashMap<HoleKey, PortMapping>>,
    available: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl TurnProvider {
    /// Create a provider using the configured TURN servers
    ///
    /// Forwarders admit every peer the TURN server lets through; the server's
    /// permission set is the only gate on who reaches a relay.
    pub fn new(config: &TurnConfig, monitor: &MonitorConfig) -> Self {
        let puncher = HolePuncher::new(config, monitor);
        Self::with_puncher(Arc::new(puncher), !config.servers.is_empty())
    }

    /// Create a provider around an existing hole puncher
    pub fn with_puncher(puncher: Arc<HolePuncher>, has_servers: bool) -> Self {
        Self {
            puncher,
            has_servers,
            mappings: RwLock::new(HashMap::new()),
            available: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    /// The hole puncher backing this provider
    pub fn puncher(&self) -> &Arc<HolePuncher> {
        &self.puncher
    }

    fn view(mapping: &PortMapping, hole: Option<&HoleInfo>) -> PortMapping {
        let mut view = mapping.clone();
        match hole {
            Some(hole) => {
                view.external_port = hole.external_port;
                view.external_address = Some(hole.external_address.clone());
                view.error = hole.last_error.clone();
                view.status = match (hole.state, hole.healthy) {
                    (HoleState::Active, true) => MappingStatus::Active,
                    (HoleState::Active, false)
                    | (HoleState::Inactive, _)
                    | (HoleState::Allocating, _) => MappingStatus::Inactive,
                    (HoleState::Failed, _) => MappingStatus::Failed,
                };
                if hole.last_activity > view.last_activity {
                    view.last_activity = hole.last_activity;
                }
            }
            None => view.status = MappingStatus::Failed,
        }
        view
    }
}

#[async_trait]
impl MappingProvider for TurnProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Turn
    }

    fn name(&self) -> &str {
        "TURN"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn start(&self, _poll_interval: Duration) -> Result<(), MappingError> {
        if !self.has_servers {
            return Err(MappingError::Unavailable(
                "no TURN servers configured".to_string(),
            ));
        }
        self.puncher.start().await;
        self.available.store(true, Ordering::Relaxed);
        info!("TURN provider started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), MappingError> {
        self.available.store(false, Ordering::Relaxed);
        self.puncher.stop().await;
        self.mappings.write().await.clear();
        info!("TURN provider stopped");
        Ok(())
    }

    async fn create_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        description: &str,
        add_type: AddType,
    ) -> Result<PortMapping, MappingError> {
        if !self.is_available() {
            return Err(MappingError::Unavailable("TURN provider not started".to_string()));
        }

        let hole = match self
            .puncher
            .create_hole(internal_port, protocol, description)
            .await
        {
            Ok(hole) => hole,
            Err(TurnError::HoleExists { .. }) => {
                let existing = self
                    .mappings
                    .read()
                    .await
                    .get(&HoleKey::new(internal_port, protocol))
                    .map(|m| m.key())
                    .unwrap_or_else(|| MappingKey::new(internal_port, external_port, protocol));
                return Err(MappingError::Conflict(existing));
            }
            Err(e) => {
                *self.last_error.write().await = Some(e.to_string());
                return Err(MappingError::Turn(e));
            }
        };

        let key = MappingKey::new(internal_port, hole.external_port, protocol);
        let mut mapping = PortMapping::new(key, description, add_type, ProviderType::Turn);
        mapping.external_address = Some(hole.external_address.clone());

        self.mappings
            .write()
            .await
            .insert(hole.key(), mapping.clone());
        info!("TURN mapping {} relayed at {}", key, hole.external_address);
        Ok(mapping)
    }

    async fn remove_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        add_type: AddType,
    ) -> Result<PortMapping, MappingError> {
        let hole_key = HoleKey::new(internal_port, protocol);
        let requested = MappingKey::new(internal_port, external_port, protocol);

        let hole = self.puncher.get_hole(internal_port, protocol).await;
        let mapping = {
            let mappings = self.mappings.read().await;
            let Some(mapping) = mappings.get(&hole_key) else {
                return Err(MappingError::NotFound(requested));
            };
            let current = Self::view(mapping, hole.as_ref());
            let port_matches = external_port == 0
                || external_port == mapping.external_port
                || external_port == current.external_port;
            if !port_matches || mapping.add_type != add_type {
                return Err(MappingError::NotFound(requested));
            }
            current
        };

        match self.puncher.close_hole(internal_port, protocol).await {
            Ok(_) | Err(TurnError::HoleNotFound { .. }) => {}
            Err(e) => warn!("Closing hole {} failed: {}", hole_key, e),
        }
        self.mappings.write().await.remove(&hole_key);
        info!("TURN mapping {} removed", mapping.key());
        Ok(mapping)
    }

    async fn get_mappings(&self) -> Vec<PortMapping> {
        let holes: HashMap<HoleKey, HoleInfo> = self
            .puncher
            .get_holes()
            .await
            .into_iter()
            .map(|h| (h.key(), h))
            .collect();

        let mut mappings: Vec<PortMapping> = self
            .mappings
            .read()
            .await
            .iter()
            .map(|(key, m)| Self::view(m, holes.get(key)))
            .collect();
        mappings.sort_by_key(|m| (m.internal_port, m.external_port, m.protocol.as_str()));
        mappings
    }

    async fn get_status(&self) -> ProviderStatus {
        let health = self.puncher.health().await;
        ProviderStatus {
            provider: ProviderType::Turn,
            name: self.name().to_string(),
            available: self.is_available(),
            mapping_count: self.mappings.read().await.len(),
            healthy: health.healthy,
            total: health.total,
            last_error: self.last_error.read().await.clone(),
        }
    }
}
