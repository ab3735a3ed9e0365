//! Monitor for explicitly registered ports

use super::probe::{PortProbe, ServiceProbe};
use super::{MonitorCore, PortStatus};
use crate::config::MonitorConfig;
use crate::events::PortEvent;
use crate::mapping::{LivenessSource, Protocol};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Watches a mutable set of `(port, protocol)` registrations
///
/// Unlike the range monitor it records the protocol of every port and uses
/// service-level probes (TCP connect, UDP echo) in addition to the bind test.
#[derive(Clone)]
pub struct ManualPortMonitor {
    core: Arc<MonitorCore>,
}

impl ManualPortMonitor {
    /// Create a monitor with the service probe
    pub fn new(config: &MonitorConfig) -> Self {
        Self::with_probe(config, Arc::new(ServiceProbe::new(config.probe_timeout())))
    }

    /// Create a monitor with a custom probe
    pub fn with_probe(config: &MonitorConfig, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            core: Arc::new(MonitorCore::new(
                "ManualPortMonitor",
                config.check_interval(),
                probe,
                config.callback_timeout(),
            )),
        }
    }

    /// Start watching a port; returns `false` if it was already registered
    pub async fn add_port(&self, port: u16, protocol: Protocol) -> bool {
        let added = self.core.watch(port, Some(protocol)).await;
        debug!("Manual monitor add {}/{}: {}", port, protocol, added);
        added
    }

    /// Stop watching a port; returns its last status
    pub async fn remove_port(&self, port: u16) -> Option<PortStatus> {
        self.core.unwatch(port).await
    }

    /// Start periodic probing
    pub async fn start(&self) {
        self.core.start().await;
    }

    /// Stop probing
    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Register a status-change callback
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(PortEvent) + Send + Sync + 'static,
    {
        self.core.events().subscribe(callback);
    }

    /// Run one probe sweep immediately
    pub async fn check_now(&self) -> Vec<PortEvent> {
        self.core.tick().await
    }

    /// Status of one port
    pub async fn get_port_status(&self, port: u16) -> Option<PortStatus> {
        self.core.status(port).await
    }

    /// Ports currently active
    pub async fn get_active_ports(&self) -> Vec<u16> {
        self.core.ports_where(true).await
    }

    /// Ports currently inactive
    pub async fn get_inactive_ports(&self) -> Vec<u16> {
        self.core.ports_where(false).await
    }

    /// Status of every registered port
    pub async fn get_all_statuses(&self) -> Vec<PortStatus> {
        self.core.snapshot().await
    }
}

#[async_trait]
impl LivenessSource for ManualPortMonitor {
    async fn is_port_active(&self, port: u16) -> Option<bool> {
        self.core.status(port).await.map(|s| s.active)
    }
}
