//! Port liveness monitoring
//!
//! Two independent monitors exist:
//! - `AutoPortMonitor` - watches a static configured port range
//! - `ManualPortMonitor` - watches an explicitly registered, mutable set
//!
//! On every tick all watched ports are probed in parallel, the tick waits for
//! every probe, and only then are edge-triggered status changes delivered to
//! the registered callbacks.

// Submodules
pub mod auto;
pub mod manual;
pub mod probe;

pub use auto::AutoPortMonitor;
pub use manual::ManualPortMonitor;
pub use probe::{BindProbe, PortProbe, ServiceProbe};

use crate::events::{EventBus, PortEvent};
use crate::mapping::Protocol;
use crate::shutdown::{Shutdown, ShutdownSignal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Liveness state of one watched port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortStatus {
    /// The watched port
    pub port: u16,
    /// Whether a service holds the port
    pub active: bool,
    /// Last time the port was observed active
    pub last_seen: Option<DateTime<Utc>>,
    /// Protocol (manual ports only)
    pub protocol: Option<Protocol>,
}

impl PortStatus {
    fn new(port: u16, protocol: Option<Protocol>) -> Self {
        Self {
            port,
            active: false,
            last_seen: None,
            protocol,
        }
    }
}

/// State and loop shared by both monitor variants
pub(crate) struct MonitorCore {
    name: &'static str,
    interval: Duration,
    probe: Arc<dyn PortProbe>,
    statuses: RwLock<HashMap<u16, PortStatus>>,
    events: EventBus<PortEvent>,
    shutdown: Mutex<Option<Shutdown>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorCore {
    pub(crate) fn new(
        name: &'static str,
        interval: Duration,
        probe: Arc<dyn PortProbe>,
        callback_timeout: Duration,
    ) -> Self {
        Self {
            name,
            interval,
            probe,
            statuses: RwLock::new(HashMap::new()),
            events: EventBus::with_timeout(callback_timeout),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn events(&self) -> &EventBus<PortEvent> {
        &self.events
    }

    pub(crate) async fn watch(&self, port: u16, protocol: Option<Protocol>) -> bool {
        let mut statuses = self.statuses.write().await;
        if statuses.contains_key(&port) {
            return false;
        }
        statuses.insert(port, PortStatus::new(port, protocol));
        true
    }

    pub(crate) async fn unwatch(&self, port: u16) -> Option<PortStatus> {
        self.statuses.write().await.remove(&port)
    }

    pub(crate) async fn status(&self, port: u16) -> Option<PortStatus> {
        self.statuses.read().await.get(&port).cloned()
    }

    pub(crate) async fn ports_where(&self, active: bool) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .statuses
            .read()
            .await
            .values()
            .filter(|s| s.active == active)
            .map(|s| s.port)
            .collect();
        ports.sort_unstable();
        ports
    }

    pub(crate) async fn snapshot(&self) -> Vec<PortStatus> {
        let mut all: Vec<PortStatus> = self.statuses.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.port);
        all
    }

    /// Probe every watched port once and deliver status changes
    ///
    /// Returns the events that were emitted.
    pub(crate) async fn tick(&self) -> Vec<PortEvent> {
        let targets: Vec<(u16, Option<Protocol>)> = self
            .statuses
            .read()
            .await
            .values()
            .map(|s| (s.port, s.protocol))
            .collect();

        let mut probes = JoinSet::new();
        for (port, protocol) in targets {
            let probe = self.probe.clone();
            probes.spawn(async move { (port, protocol, probe.probe(port, protocol).await) });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("{}: probe task failed: {}", self.name, e),
            }
        }

        let now = Utc::now();
        let mut changes = Vec::new();
        {
            let mut statuses = self.statuses.write().await;
            for (port, protocol, active) in results {
                // Port may have been unwatched while probing
                let Some(status) = statuses.get_mut(&port) else {
                    continue;
                };
                if active {
                    status.last_seen = Some(now);
                }
                if status.active != active {
                    status.active = active;
                    changes.push(PortEvent {
                        port,
                        active,
                        protocol,
                    });
                }
            }
        }

        changes.sort_by_key(|e| e.port);
        for event in &changes {
            info!(
                "{}: port {} is now {}",
                self.name,
                event.port,
                if event.active { "active" } else { "inactive" }
            );
            self.events.emit(event.clone());
        }
        changes
    }

    pub(crate) async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!("{}: already running", self.name);
            return;
        }

        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        *self.shutdown.lock().await = Some(shutdown);

        let core = self.clone();
        info!("{}: starting (interval {:?})", self.name, self.interval);
        *task = Some(tokio::spawn(async move { core.run(signal).await }));
    }

    async fn run(self: Arc<Self>, mut signal: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = signal.recv() => break,
                _ = ticker.tick() => {
                    if signal.is_shutdown() {
                        break;
                    }
                    self.tick().await;
                }
            }
        }
        info!("{}: stopped", self.name);
    }

    pub(crate) async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            shutdown.trigger();
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("{}: monitor task ended abnormally: {}", self.name, e);
            }
        }
    }
}
