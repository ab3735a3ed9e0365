//! Monitor for the configured port range

use super::probe::{BindProbe, PortProbe};
use super::{MonitorCore, PortStatus};
use crate::config::{MonitorConfig, PortRange};
use crate::events::PortEvent;
use std::sync::Arc;

/// Watches every port of a static range and reports edge-triggered changes
///
/// # Example
/// ```rust,no_run
/// use natmapper::config::{MonitorConfig, PortRange};
/// use natmapper::monitor::AutoPortMonitor;
///
/// # async fn example() {
/// let monitor = AutoPortMonitor::new(PortRange::new(18000, 18002, 1), &MonitorConfig::default()).await;
/// monitor.add_callback(|event| println!("{} active={}", event.port, event.active));
/// monitor.start().await;
/// # }
/// ```
#[derive(Clone)]
pub struct AutoPortMonitor {
    range: PortRange,
    core: Arc<MonitorCore>,
}

impl AutoPortMonitor {
    /// Create a monitor probing with the bind test
    pub async fn new(range: PortRange, config: &MonitorConfig) -> Self {
        Self::with_probe(range, config, Arc::new(BindProbe)).await
    }

    /// Create a monitor with a custom probe
    pub async fn with_probe(
        range: PortRange,
        config: &MonitorConfig,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        let core = Arc::new(MonitorCore::new(
            "AutoPortMonitor",
            config.check_interval(),
            probe,
            config.callback_timeout(),
        ));
        for port in range.ports() {
            core.watch(port, None).await;
        }
        Self { range, core }
    }

    /// The watched range
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Start periodic probing
    pub async fn start(&self) {
        self.core.start().await;
    }

    /// Stop probing; returns once the loop has observed the shutdown signal
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

    /// Status of every watched port
    pub async fn get_all_statuses(&self) -> Vec<PortStatus> {
        self.core.snapshot().await
    }
}
