//! Mapping manager with UPnP to TURN failover

use super::provider::MappingProvider;
use super::types::{AddType, MappingError, MappingKey, PortMapping, Protocol, ProviderStatus, ProviderType};
use crate::config::MonitorConfig;
use crate::events::{EventBus, MappingEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Order in which provider types are tried on create
const PROVIDER_ORDER: [ProviderType; 2] = [ProviderType::Upnp, ProviderType::Turn];

/// Owns the registered providers and routes mapping requests to them
///
/// A create is reserved under a manager-level lock before any provider is
/// contacted, so a key can be live in at most one provider at a time.
pub struct MappingManager {
    providers: Vec<Arc<dyn MappingProvider>>,
    started: RwLock<Vec<Arc<dyn MappingProvider>>>,
    reservations: Mutex<Vec<MappingKey>>,
    events: EventBus<MappingEvent>,
    poll_interval: Duration,
}

fn reserved_collision(reserved: &MappingKey, internal_port: u16, external_port: u16, protocol: Protocol) -> bool {
    reserved.internal_port == internal_port
        && reserved.protocol == protocol
        && (external_port == 0 || reserved.external_port == 0 || reserved.external_port == external_port)
}

impl MappingManager {
    /// Create an empty manager
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            providers: Vec::new(),
            started: RwLock::new(Vec::new()),
            reservations: Mutex::new(Vec::new()),
            events: EventBus::with_timeout(config.callback_timeout()),
            poll_interval: config.check_interval(),
        }
    }

    /// Register a provider; call before [`MappingManager::start`]
    pub fn add_provider(&mut self, provider: Arc<dyn MappingProvider>) {
        info!("Registered {} provider", provider.name());
        self.providers.push(provider);
    }

    /// Registered providers, in registration order
    pub fn providers(&self) -> &[Arc<dyn MappingProvider>] {
        &self.providers
    }

    /// Register a mapping lifecycle callback
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(MappingEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback);
    }

    /// Start every provider
    ///
    /// Providers failing to start are logged and excluded; fails only if
    /// none started.
    pub async fn start(&self) -> Result<(), MappingError> {
        let mut started = Vec::new();
        for provider in &self.providers {
            match provider.start(self.poll_interval).await {
                Ok(()) => {
                    info!(
                        "{} provider started (available: {})",
                        provider.name(),
                        provider.is_available()
                    );
                    started.push(Arc::clone(provider));
                }
                Err(e) => warn!("{} provider failed to start: {}", provider.name(), e),
            }
        }

        if started.is_empty() {
            error!("No mapping provider could be started");
            return Err(MappingError::NoProviders);
        }
        *self.started.write().await = started;
        Ok(())
    }

    /// Stop every started provider
    pub async fn stop(&self) {
        let started: Vec<Arc<dyn MappingProvider>> = self.started.write().await.drain(..).collect();
        for provider in started {
            if let Err(e) = provider.stop().await {
                warn!("Stopping {} provider failed: {}", provider.name(), e);
            }
        }
        info!("Mapping manager stopped");
    }

    async fn reserve(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<MappingKey, MappingError> {
        let key = MappingKey::new(internal_port, external_port, protocol);
        let mut reservations = self.reservations.lock().await;

        if let Some(pending) = reservations
            .iter()
            .find(|r| reserved_collision(r, internal_port, external_port, protocol))
        {
            return Err(MappingError::Conflict(*pending));
        }
        for provider in self.started.read().await.iter() {
            if let Some(existing) = provider
                .get_mappings()
                .await
                .into_iter()
                .find(|m| m.collides_with(internal_port, external_port, protocol))
            {
                return Err(MappingError::Conflict(existing.key()));
            }
        }

        reservations.push(key);
        Ok(key)
    }

    async fn release(&self, key: MappingKey) {
        let mut reservations = self.reservations.lock().await;
        if let Some(pos) = reservations.iter().position(|r| *r == key) {
            reservations.swap_remove(pos);
        }
    }

    /// Create a mapping, trying UPnP providers first and then TURN
    ///
    /// The key is reserved while providers are tried, so a concurrent call
    /// for the same key fails with a conflict instead of racing.
    ///
    /// # Arguments
    ///
    /// * `internal_port` - Local port to expose
    /// * `external_port` - Requested public port (0 = same as internal for
    ///   UPnP, relay-assigned for TURN)
    /// * `protocol` - TCP or UDP
    /// * `description` - Label shown on the gateway
    /// * `add_type` - Whether a monitor or the operator asked for it
    ///
    /// # Returns
    ///
    /// Returns the `PortMapping` from the first provider that succeeded, or
    /// the last provider's `MappingError` when all of them failed.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use natmapper::config::Config;
    /// use natmapper::mapping::{AddType, MappingManager, Protocol, UpnpProvider};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = Config::default();
    /// let mut manager = MappingManager::new(&config.monitor);
    /// manager.add_provider(UpnpProvider::new(&config.upnp, &config.monitor));
    /// manager.start().await?;
    ///
    /// let mapping = manager
    ///     .create_mapping(8080, 0, Protocol::Tcp, "web", AddType::Manual)
    ///     .await?;
    /// println!("Mapped {}", mapping.key());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn create_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        description: &str,
        add_type: AddType,
    ) -> Result<PortMapping, MappingError> {
        let key = self.reserve(internal_port, external_port, protocol).await?;
        let result = self
            .try_providers(internal_port, external_port, protocol, description, add_type)
            .await;
        self.release(key).await;
        result
    }

    async fn try_providers(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        description: &str,
        add_type: AddType,
    ) -> Result<PortMapping, MappingError> {
        let started = self.started.read().await.clone();
        if started.is_empty() {
            return Err(MappingError::NoProviders);
        }

        let mut errors = Vec::new();
        let mut last_provider = None;
        for provider_type in PROVIDER_ORDER {
            for provider in started.iter().filter(|p| p.provider_type() == provider_type) {
                if provider_type == ProviderType::Turn && !provider.is_available() {
                    debug!("Skipping unavailable {} provider", provider.name());
                    continue;
                }
                last_provider = Some(provider_type);

                match provider
                    .create_mapping(internal_port, external_port, protocol, description, add_type)
                    .await
                {
                    Ok(mapping) => {
                        info!(
                            "Mapping {} created via {}",
                            mapping.key(),
                            provider.name()
                        );
                        self.events.emit(MappingEvent::Created {
                            internal_port: mapping.internal_port,
                            external_port: mapping.external_port,
                            protocol,
                            provider: provider_type,
                            add_type,
                        });
                        return Ok(mapping);
                    }
                    Err(e @ MappingError::Conflict(_)) => return Err(e),
                    Err(e) => {
                        warn!(
                            "{} failed to map {}/{}: {}",
                            provider.name(),
                            internal_port,
                            protocol,
                            e
                        );
                        errors.push(format!("{}: {}", provider.name(), e));
                    }
                }
            }
        }

        let error = if errors.is_empty() {
            MappingError::NoProviders
        } else {
            MappingError::AllProvidersFailed(errors.join("; "))
        };
        error!(
            "Failed to map {}:{}/{}: {}",
            internal_port, external_port, protocol, error
        );
        self.events.emit(MappingEvent::Failed {
            internal_port,
            external_port,
            protocol,
            provider: last_provider.unwrap_or(ProviderType::Upnp),
            add_type,
            error: error.to_string(),
        });
        Err(error)
    }

    /// Remove a mapping from every started provider
    ///
    /// Succeeds if any provider removed it. Returns `NotFound` when no
    /// provider owned it, otherwise the last provider error.
    pub async fn remove_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        add_type: AddType,
    ) -> Result<PortMapping, MappingError> {
        let started = self.started.read().await.clone();
        let mut removed = None;
        let mut last_error = None;

        for provider in started {
            match provider
                .remove_mapping(internal_port, external_port, protocol, add_type)
                .await
            {
                Ok(mapping) => {
                    info!("Mapping {} removed from {}", mapping.key(), provider.name());
                    self.events.emit(MappingEvent::Removed {
                        internal_port: mapping.internal_port,
                        external_port: mapping.external_port,
                        protocol,
                        provider: provider.provider_type(),
                        add_type,
                    });
                    removed.get_or_insert(mapping);
                }
                Err(MappingError::NotFound(_)) => {}
                Err(e) => {
                    warn!(
                        "{} failed to remove {}:{}/{}: {}",
                        provider.name(),
                        internal_port,
                        external_port,
                        protocol,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        match (removed, last_error) {
            (Some(mapping), _) => Ok(mapping),
            (None, Some(e)) => Err(e),
            (None, None) => Err(MappingError::NotFound(MappingKey::new(
                internal_port,
                external_port,
                protocol,
            ))),
        }
    }

    /// Every mapping across started providers
    pub async fn get_mappings(&self) -> Vec<PortMapping> {
        let mut mappings = Vec::new();
        for provider in self.started.read().await.iter() {
            mappings.extend(provider.get_mappings().await);
        }
        mappings
    }

    /// Mapping for an internal port and protocol, if any provider holds one
    pub async fn find_mapping(&self, internal_port: u16, protocol: Protocol) -> Option<PortMapping> {
        self.get_mappings()
            .await
            .into_iter()
            .find(|m| m.collides_with(internal_port, 0, protocol))
    }

    /// Status of every registered provider
    pub async fn get_status(&self) -> Vec<ProviderStatus> {
        let mut statuses = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            statuses.push(provider.get_status().await);
        }
        statuses
    }
}
