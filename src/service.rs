//! Service orchestrator
//!
//! Wires the auto monitor's up/down transitions to mapping creation and
//! removal, keeps manual mappings under the manual monitor and restores them
//! from the mapping store on start.

use crate::config::Config;
use crate::events::PortEvent;
use crate::mapping::{
    AddType, MappingManager, MappingProvider, PortMapping, Protocol, ProviderStatus, TurnProvider,
    UpnpProvider,
};
use crate::monitor::{AutoPortMonitor, ManualPortMonitor};
use crate::storage::MappingStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Description given to mappings created for auto-discovered ports
pub fn auto_description(port: u16) -> String {
    format!("AutoUPnP-{}", port)
}

/// Snapshot of the running service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Whether the service is started
    pub running: bool,
    /// Per-provider status
    pub providers: Vec<ProviderStatus>,
    /// Every live mapping
    pub mappings: Vec<PortMapping>,
    /// Auto-range ports currently active
    pub active_ports: Vec<u16>,
}

/// The running daemon: monitors, mapping manager and manual mapping store
pub struct NatService {
    manager: Arc<MappingManager>,
    auto_monitor: AutoPortMonitor,
    manual_monitor: ManualPortMonitor,
    store: Arc<MappingStore>,
    upnp: Option<Arc<UpnpProvider>>,
    running: AtomicBool,
    wired: AtomicBool,
}

impl NatService {
    /// Build the service with the providers enabled in `config`
    pub async fn new(config: &Config) -> Self {
        let mut manager = MappingManager::new(&config.monitor);

        let upnp = if config.upnp.enabled {
            let provider = UpnpProvider::new(&config.upnp, &config.monitor);
            manager.add_provider(Arc::clone(&provider) as Arc<dyn MappingProvider>);
            Some(provider)
        } else {
            None
        };

        if config.turn.enabled {
            manager.add_provider(Arc::new(TurnProvider::new(&config.turn, &config.monitor)));
        }

        let auto_monitor = AutoPortMonitor::new(config.port_range, &config.monitor).await;
        let manual_monitor = ManualPortMonitor::new(&config.monitor);
        let store = MappingStore::new(&config.data_dir);

        Self::from_parts(manager, auto_monitor, manual_monitor, store, upnp)
    }

    /// Assemble the service from prebuilt parts
    pub fn from_parts(
        manager: MappingManager,
        auto_monitor: AutoPortMonitor,
        manual_monitor: ManualPortMonitor,
        store: MappingStore,
        upnp: Option<Arc<UpnpProvider>>,
    ) -> Self {
        Self {
            manager: Arc::new(manager),
            auto_monitor,
            manual_monitor,
            store: Arc::new(store),
            upnp,
            running: AtomicBool::new(false),
            wired: AtomicBool::new(false),
        }
    }

    /// The mapping manager
    pub fn manager(&self) -> &Arc<MappingManager> {
        &self.manager
    }

    /// The range monitor
    pub fn auto_monitor(&self) -> &AutoPortMonitor {
        &self.auto_monitor
    }

    /// The manual port monitor
    pub fn manual_monitor(&self) -> &ManualPortMonitor {
        &self.manual_monitor
    }

    /// The manual mapping store
    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    /// Whether [`NatService::start`] has run
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Map a port that came alive, unmap a port that went away
    pub async fn handle_port_event(manager: &MappingManager, event: PortEvent) {
        let protocol = event.protocol.unwrap_or(Protocol::Tcp);
        if event.active {
            let description = auto_description(event.port);
            match manager
                .create_mapping(event.port, event.port, protocol, &description, AddType::Auto)
                .await
            {
                Ok(mapping) => info!("Port {} mapped as {}", event.port, mapping.key()),
                Err(e) => warn!("Could not map active port {}: {}", event.port, e),
            }
        } else {
            match manager
                .remove_mapping(event.port, 0, protocol, AddType::Auto)
                .await
            {
                Ok(mapping) => info!("Port {} unmapped ({})", event.port, mapping.key()),
                Err(crate::MappingError::NotFound(_)) => {
                    debug!("Port {} went inactive without a mapping", event.port)
                }
                Err(e) => warn!("Could not unmap inactive port {}: {}", event.port, e),
            }
        }
    }

    /// Listener that applies auto port events in order, per port
    ///
    /// Each port gets its own worker draining a queue, so an "inactive" event
    /// waits for the create started by the preceding "active" event. Ports
    /// are handled independently of each other. Must be called from within a
    /// tokio runtime.
    pub fn port_event_dispatcher(
        manager: Arc<MappingManager>,
    ) -> impl Fn(PortEvent) + Send + Sync + 'static {
        let handle = Handle::current();
        let queues: Mutex<HashMap<u16, mpsc::UnboundedSender<PortEvent>>> =
            Mutex::new(HashMap::new());

        move |event: PortEvent| {
            let Ok(mut queues) = queues.lock() else {
                error!("Port event queues poisoned, dropping event for {}", event.port);
                return;
            };
            let port = event.port;
            let tx = queues.entry(port).or_insert_with(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<PortEvent>();
                let manager = Arc::clone(&manager);
                handle.spawn(async move {
                    while let Some(event) = rx.recv().await {
                        Self::handle_port_event(&manager, event).await;
                    }
                });
                tx
            });
            if tx.send(event).is_err() {
                warn!("Port {} event worker is gone", port);
                queues.remove(&port);
            }
        }
    }

    /// Start providers and monitors, then restore manual mappings
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Starting NAT mapping service");

        if let Err(e) = self.manager.start().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        if let Some(upnp) = &self.upnp {
            upnp.set_liveness(Arc::new(self.manual_monitor.clone())).await;
        }

        if !self.wired.swap(true, Ordering::SeqCst) {
            self.auto_monitor
                .add_callback(Self::port_event_dispatcher(Arc::clone(&self.manager)));

            self.manual_monitor.add_callback(|event| {
                info!(
                    "Manual port {} is now {}",
                    event.port,
                    if event.active { "active" } else { "inactive" }
                );
            });
        }

        self.auto_monitor.start().await;
        self.manual_monitor.start().await;

        let restored = self.restore_manual_mappings().await;
        info!("Service started ({} manual mappings restored)", restored);
        Ok(())
    }

    /// Stop monitors and providers
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping NAT mapping service");
        self.auto_monitor.stop().await;
        self.manual_monitor.stop().await;
        self.manager.stop().await;
        info!("Service stopped");
    }

    /// Re-create every stored manual mapping; returns how many succeeded
    pub async fn restore_manual_mappings(&self) -> usize {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                error!("Failed to load manual mappings: {}", e);
                return 0;
            }
        };

        let mut restored = 0;
        for record in stored {
            self.manual_monitor
                .add_port(record.internal_port, record.protocol)
                .await;
            match self
                .manager
                .create_mapping(
                    record.internal_port,
                    record.external_port,
                    record.protocol,
                    &record.description,
                    AddType::Manual,
                )
                .await
            {
                Ok(_) => restored += 1,
                Err(e) => warn!("Failed to restore manual mapping {}: {}", record.key(), e),
            }
        }
        restored
    }

    /// Create a manual mapping, watch its port and persist it
    pub async fn add_manual_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        description: &str,
    ) -> Result<PortMapping> {
        let mapping = self
            .manager
            .create_mapping(
                internal_port,
                external_port,
                protocol,
                description,
                AddType::Manual,
            )
            .await?;

        self.manual_monitor.add_port(internal_port, protocol).await;
        let store = Arc::clone(&self.store);
        let desc = description.to_string();
        run_store(move || store.add(internal_port, external_port, protocol, &desc)).await?;
        Ok(mapping)
    }

    /// Remove a manual mapping, stop watching its port and forget it
    pub async fn remove_manual_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<PortMapping> {
        let removed = self
            .manager
            .remove_mapping(internal_port, external_port, protocol, AddType::Manual)
            .await;

        self.manual_monitor.remove_port(internal_port).await;
        let store = Arc::clone(&self.store);
        if let Err(e) = run_store(move || store.remove(internal_port, external_port, protocol)).await {
            debug!("Manual mapping {}:{} not in store: {}", internal_port, external_port, e);
        }
        Ok(removed?)
    }

    /// Current status of providers, mappings and auto ports
    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.is_running(),
            providers: self.manager.get_status().await,
            mappings: self.manager.get_mappings().await,
            active_ports: self.auto_monitor.get_active_ports().await,
        }
    }
}

async fn run_store<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Storage(format!("Task join error: {}", e)))?
}
