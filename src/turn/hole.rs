//! Hole table: one relayed local port per (port, protocol)
//!
//! Creation publishes an `Allocating` record under the table lock, does all
//! network work with the lock released, then fills the record in and marks
//! it `Active`. Health checks and repairs follow the same pattern: probe and
//! rebuild outside the lock, swap resources into the existing entry under it.
//! A hole that fails its check is `Inactive` until repaired, or `Failed` if
//! the repair does not succeed.

use super::client::TurnClient;
use super::forwarder::{Forwarder, ForwarderConfig};
use super::relay::RelayConnector;
use super::session::TurnRelayConnector;
use super::types::{AllocatedPort, HoleInfo, HoleKey, HoleState, TrafficStats};
use super::TurnError;
use crate::config::{MonitorConfig, TurnConfig};
use crate::events::{EventBus, HoleEvent};
use crate::mapping::Protocol;
use crate::nat::AdmissionPolicy;
use crate::shutdown::Shutdown;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Healthy and total hole counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    /// Holes whose last health check passed
    pub healthy: usize,
    /// All holes
    pub total: usize,
}

#[derive(Default)]
struct HoleTable {
    holes: HashMap<HoleKey, HoleInfo>,
}

struct Established {
    client: Arc<TurnClient>,
    forwarder: Arc<Forwarder>,
    allocation: AllocatedPort,
}

/// Creates, repairs and closes TURN holes
pub struct HolePuncher {
    config: TurnConfig,
    cleanup_interval: Duration,
    forwarder_config: ForwarderConfig,
    connector: Arc<dyn RelayConnector>,
    policy: AdmissionPolicy,
    table: RwLock<HoleTable>,
    events: EventBus<HoleEvent>,
    shutdown: Mutex<Option<Shutdown>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HolePuncher {
    /// Create a puncher that talks to real TURN servers
    pub fn new(config: &TurnConfig, monitor: &MonitorConfig) -> Self {
        let connector = Arc::new(TurnRelayConnector::new(config));
        Self::with_connector(config, monitor, connector)
    }

    /// Create a puncher with a custom relay connector
    pub fn with_connector(
        config: &TurnConfig,
        monitor: &MonitorConfig,
        connector: Arc<dyn RelayConnector>,
    ) -> Self {
        let forwarder_config = ForwarderConfig {
            udp_response_timeout: config.udp_response_timeout(),
            tcp_idle_timeout: config.tcp_idle_timeout(),
            connect_timeout: config.request_timeout(),
            ..ForwarderConfig::default()
        };
        Self {
            config: config.clone(),
            cleanup_interval: monitor.cleanup_interval(),
            forwarder_config,
            connector,
            policy: AdmissionPolicy::default(),
            table: RwLock::new(HoleTable::default()),
            events: EventBus::with_timeout(monitor.callback_timeout()),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Use a specific admission policy for new forwarders
    ///
    /// The default admits every peer. A restrictive policy only makes sense
    /// when something records outbound contacts through
    /// [`Forwarder::mark_contacted`].
    pub fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Admission policy applied to new forwarders
    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Register a hole lifecycle callback
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(HoleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback);
    }

    /// Start the health and cleanup loops
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.shutdown.lock().await;
        if guard.is_some() {
            return;
        }
        let shutdown = Shutdown::new();

        let this = Arc::clone(self);
        let mut signal = shutdown.subscribe();
        let health = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.health_check_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = signal.recv() => break,
                    _ = ticker.tick() => { this.health_check().await; }
                }
            }
            debug!("Hole health loop stopped");
        });

        let this = Arc::clone(self);
        let mut signal = shutdown.subscribe();
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = signal.recv() => break,
                    _ = ticker.tick() => { this.cleanup().await; }
                }
            }
            debug!("Hole cleanup loop stopped");
        });

        self.tasks.lock().await.extend([health, cleanup]);
        *guard = Some(shutdown);
        info!("Hole puncher started");
    }

    /// Stop background loops and close every hole
    pub async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            shutdown.trigger();
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let keys: Vec<HoleKey> = self.table.read().await.holes.keys().copied().collect();
        for key in keys {
            if let Err(e) = self.close_hole(key.port, key.protocol).await {
                debug!("Closing hole {} during stop: {}", key, e);
            }
        }
        info!("Hole puncher stopped");
    }

    async fn establish(&self, port: u16, protocol: Protocol) -> Result<Established, TurnError> {
        let client = Arc::new(
            TurnClient::connect(&self.config.servers, Arc::clone(&self.connector)).await?,
        );

        let result = async {
            let (allocation, relay) = client.allocate_port(true).await?;
            let rule = client
                .add_forward_rule(allocation.port, port, protocol)
                .await?;
            let forwarder = Arc::new(Forwarder::new(
                rule,
                relay,
                self.forwarder_config.clone(),
                self.policy,
            ));
            forwarder.start().await;
            Ok::<_, TurnError>((forwarder, allocation))
        }
        .await;

        match result {
            Ok((forwarder, allocation)) => Ok(Established {
                client,
                forwarder,
                allocation,
            }),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// Relay a local port through a fresh TURN allocation
    ///
    /// Fails with [`TurnError::HoleExists`] if a hole for the key exists or
    /// is being created. While the allocation is in flight the hole is
    /// listed in the `Allocating` state.
    ///
    /// # Arguments
    ///
    /// * `port` - Local port the relay forwards to
    /// * `protocol` - TCP or UDP
    /// * `description` - Label kept with the hole
    ///
    /// # Returns
    ///
    /// Returns the `Active` `HoleInfo` carrying the relayed address, or
    /// `Err(TurnError)` when no configured server granted an allocation.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use natmapper::config::Config;
    /// use natmapper::mapping::Protocol;
    /// use natmapper::turn::HolePuncher;
    /// use std::sync::Arc;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = Config::default();
    /// let puncher = Arc::new(HolePuncher::new(&config.turn, &config.monitor));
    /// puncher.start().await;
    ///
    /// let hole = puncher.create_hole(7000, Protocol::Udp, "game").await?;
    /// println!("Reachable at {}", hole.external_address);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn create_hole(
        &self,
        port: u16,
        protocol: Protocol,
        description: &str,
    ) -> Result<HoleInfo, TurnError> {
        let key = HoleKey::new(port, protocol);
        {
            let mut table = self.table.write().await;
            if table.holes.contains_key(&key) {
                return Err(TurnError::HoleExists { port, protocol });
            }
            let now = Utc::now();
            table.holes.insert(
                key,
                HoleInfo {
                    port,
                    external_port: 0,
                    protocol,
                    description: description.to_string(),
                    external_address: String::new(),
                    created_at: now,
                    last_activity: now,
                    state: HoleState::Allocating,
                    healthy: false,
                    repairs: 0,
                    last_error: None,
                    base_stats: TrafficStats::default(),
                    client: None,
                    forwarder: None,
                },
            );
        }

        info!("Creating hole {}", key);
        let established = self.establish(port, protocol).await;

        let mut table = self.table.write().await;
        match established {
            Ok(est) => {
                let Some(hole) = table.holes.get_mut(&key) else {
                    drop(table);
                    est.forwarder.close().await;
                    est.client.close().await;
                    return Err(TurnError::HoleNotFound { port, protocol });
                };
                hole.external_port = est.allocation.port;
                hole.external_address = est.allocation.relayed_address.clone();
                hole.last_activity = Utc::now();
                hole.state = HoleState::Active;
                hole.healthy = true;
                hole.client = Some(est.client);
                hole.forwarder = Some(est.forwarder);
                let hole = hole.clone();
                drop(table);

                info!("Hole {} open at {}", key, hole.external_address);
                self.events.emit(HoleEvent::Created {
                    port,
                    external_port: hole.external_port,
                    protocol,
                    external_address: hole.external_address.clone(),
                });
                Ok(hole)
            }
            Err(e) => {
                table.holes.remove(&key);
                drop(table);
                error!("Failed to create hole {}: {}", key, e);
                self.events.emit(HoleEvent::Failed {
                    port,
                    protocol,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Tear down a hole; the forward-rule removal is best-effort
    ///
    /// A hole still being allocated cannot be closed yet.
    pub async fn close_hole(&self, port: u16, protocol: Protocol) -> Result<HoleInfo, TurnError> {
        let key = HoleKey::new(port, protocol);
        let hole = {
            let mut table = self.table.write().await;
            match table.holes.get(&key).map(|h| h.state) {
                None => return Err(TurnError::HoleNotFound { port, protocol }),
                Some(HoleState::Allocating) => {
                    return Err(TurnError::HoleAllocating { port, protocol });
                }
                Some(_) => {}
            }
            table
                .holes
                .remove(&key)
                .ok_or(TurnError::HoleNotFound { port, protocol })?
        };

        if let Some(client) = &hole.client {
            if let Err(e) = client.remove_forward_rule(port, protocol).await {
                warn!("Removing forward rule for hole {}: {}", key, e);
            }
        }
        if let Some(forwarder) = &hole.forwarder {
            forwarder.close().await;
        }
        if let Some(client) = &hole.client {
            client.close().await;
        }

        info!("Hole {} closed", key);
        self.events.emit(HoleEvent::Closed { port, protocol });
        Ok(hole)
    }

    /// Hole for a key
    pub async fn get_hole(&self, port: u16, protocol: Protocol) -> Option<HoleInfo> {
        self.table
            .read()
            .await
            .holes
            .get(&HoleKey::new(port, protocol))
            .cloned()
    }

    /// All holes, ordered by key
    pub async fn get_holes(&self) -> Vec<HoleInfo> {
        let mut holes: Vec<HoleInfo> = self.table.read().await.holes.values().cloned().collect();
        holes.sort_by_key(|h| (h.port, h.protocol.as_str()));
        holes
    }

    /// Healthy and total counts of established holes
    pub async fn health(&self) -> HealthSummary {
        let table = self.table.read().await;
        let established = table
            .holes
            .values()
            .filter(|h| h.state != HoleState::Allocating);
        let mut summary = HealthSummary::default();
        for hole in established {
            summary.total += 1;
            if hole.healthy {
                summary.healthy += 1;
            }
        }
        summary
    }

    /// Health verdict of one hole
    pub async fn hole_health(&self, port: u16, protocol: Protocol) -> Option<bool> {
        self.table
            .read()
            .await
            .holes
            .get(&HoleKey::new(port, protocol))
            .map(|h| h.healthy)
    }

    /// Probe every hole and repair the unhealthy ones
    ///
    /// Returns the keys that were successfully repaired.
    pub async fn health_check(&self) -> Vec<HoleKey> {
        let candidates: Vec<(HoleKey, Option<Arc<TurnClient>>)> = self
            .table
            .read()
            .await
            .holes
            .iter()
            .filter(|(_, h)| h.state != HoleState::Allocating)
            .map(|(k, h)| (*k, h.client.clone()))
            .collect();
        let checked: Vec<HoleKey> = candidates.iter().map(|(k, _)| *k).collect();

        let mut unhealthy = Vec::new();
        for (key, client) in candidates {
            let connected = match client {
                Some(client) => client.is_connected().await,
                None => false,
            };
            if !connected {
                unhealthy.push(key);
            }
        }

        {
            let mut table = self.table.write().await;
            for key in &checked {
                let Some(hole) = table.holes.get_mut(key) else {
                    continue;
                };
                if unhealthy.contains(key) {
                    hole.healthy = false;
                    hole.state = HoleState::Inactive;
                } else {
                    hole.healthy = true;
                    hole.state = HoleState::Active;
                }
            }
        }

        let mut repaired = Vec::new();
        for key in unhealthy {
            warn!("Hole {} unhealthy, repairing", key);
            if self.repair_hole(key).await {
                repaired.push(key);
            }
        }
        repaired
    }

    async fn repair_hole(&self, key: HoleKey) -> bool {
        match self.establish(key.port, key.protocol).await {
            Ok(est) => {
                let replaced = {
                    let mut table = self.table.write().await;
                    match table.holes.get_mut(&key) {
                        Some(hole) => {
                            if let Some(old) = &hole.forwarder {
                                hole.base_stats.absorb(old.rule().stats());
                            }
                            hole.external_port = est.allocation.port;
                            hole.external_address = est.allocation.relayed_address.clone();
                            hole.state = HoleState::Active;
                            hole.healthy = true;
                            hole.repairs += 1;
                            hole.last_error = None;
                            hole.last_activity = Utc::now();
                            let old_forwarder = hole.forwarder.replace(est.forwarder);
                            let old_client = hole.client.replace(est.client);
                            Ok((old_forwarder, old_client, hole.external_address.clone()))
                        }
                        None => Err((est.forwarder, est.client)),
                    }
                };

                match replaced {
                    Ok((old_forwarder, old_client, address)) => {
                        if let Some(forwarder) = old_forwarder {
                            forwarder.close().await;
                        }
                        if let Some(client) = old_client {
                            client.close().await;
                        }
                        info!("Hole {} repaired at {}", key, address);
                        true
                    }
                    Err((forwarder, client)) => {
                        debug!("Hole {} closed during repair, discarding relay", key);
                        forwarder.close().await;
                        client.close().await;
                        false
                    }
                }
            }
            Err(e) => {
                error!("Repair of hole {} failed: {}", key, e);
                let still_present = {
                    let mut table = self.table.write().await;
                    match table.holes.get_mut(&key) {
                        Some(hole) => {
                            hole.state = HoleState::Failed;
                            hole.healthy = false;
                            hole.last_error = Some(e.to_string());
                            hole.last_activity = Utc::now();
                            true
                        }
                        None => false,
                    }
                };
                if still_present {
                    self.events.emit(HoleEvent::Failed {
                        port: key.port,
                        protocol: key.protocol,
                        error: e.to_string(),
                    });
                }
                false
            }
        }
    }

    /// Retire idle relay allocations on every hole's client
    pub async fn cleanup(&self) -> usize {
        let clients: Vec<Arc<TurnClient>> = self
            .table
            .read()
            .await
            .holes
            .values()
            .filter_map(|h| h.client.clone())
            .collect();

        let idle = self.config.allocation_idle_timeout();
        let mut closed = 0;
        for client in clients {
            closed += client.sweep_idle(idle).await;
        }
        if closed > 0 {
            info!("Closed {} idle relay allocations", closed);
        }
        closed
    }
}
