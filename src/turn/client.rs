//! TURN client: server failover, relay allocations and forward rules

use super::relay::{RelayConn, RelayConnector};
use super::types::{AllocatedPort, ForwardRule};
use super::TurnError;
use crate::config::TurnServer;
use crate::mapping::Protocol;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct Allocation {
    info: AllocatedPort,
    conn: Arc<dyn RelayConn>,
}

/// TURN client bound to the first server that accepted us
///
/// Holds every relay allocation made on that server, keyed by relay port,
/// and the forward rules that route relay ports to local ports.
pub struct TurnClient {
    server: TurnServer,
    connector: Arc<dyn RelayConnector>,
    allocations: RwLock<HashMap<u16, Allocation>>,
    rules: RwLock<HashMap<(u16, Protocol), Arc<ForwardRule>>>,
    closed: AtomicBool,
}

impl TurnClient {
    /// Connect to the first server in `servers` that grants an allocation
    ///
    /// The allocation made while connecting becomes the primary relay port;
    /// it starts unclaimed and is handed out by [`TurnClient::allocate_port`].
    pub async fn connect(
        servers: &[TurnServer],
        connector: Arc<dyn RelayConnector>,
    ) -> Result<Self, TurnError> {
        if servers.is_empty() {
            return Err(TurnError::NoServers);
        }

        let mut errors = Vec::new();
        for server in servers {
            debug!("Trying TURN server {}", server.address);
            match connector.allocate(server).await {
                Ok(conn) => {
                    let client = Self {
                        server: server.clone(),
                        connector,
                        allocations: RwLock::new(HashMap::new()),
                        rules: RwLock::new(HashMap::new()),
                        closed: AtomicBool::new(false),
                    };
                    client.insert_allocation(conn, 0).await;
                    info!("Connected to TURN server {}", server.address);
                    return Ok(client);
                }
                Err(e) => {
                    warn!("TURN server {} failed: {}", server.address, e);
                    errors.push(format!("{}: {}", server.address, e));
                }
            }
        }

        Err(TurnError::AllServersFailed(errors.join("; ")))
    }

    async fn insert_allocation(&self, conn: Arc<dyn RelayConn>, usage_count: u32) -> AllocatedPort {
        let now = Utc::now();
        let relayed = conn.relayed_addr();
        let info = AllocatedPort {
            port: relayed.port(),
            relayed_address: relayed.to_string(),
            allocated_at: now,
            last_used: now,
            active: true,
            usage_count,
        };
        self.allocations.write().await.insert(
            info.port,
            Allocation {
                info: info.clone(),
                conn,
            },
        );
        info
    }

    /// Address of the server this client is bound to
    pub fn server(&self) -> Option<String> {
        if self.closed.load(Ordering::Relaxed) {
            None
        } else {
            Some(self.server.address.clone())
        }
    }

    /// Claim a relay port
    ///
    /// With `reuse` the first active allocation is shared and its usage count
    /// grows; otherwise a fresh allocation is made on the same server.
    pub async fn allocate_port(
        &self,
        reuse: bool,
    ) -> Result<(AllocatedPort, Arc<dyn RelayConn>), TurnError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TurnError::Closed);
        }

        if reuse {
            let mut allocations = self.allocations.write().await;
            let shared = allocations
                .values_mut()
                .filter(|a| a.info.active)
                .min_by_key(|a| a.info.allocated_at);
            if let Some(allocation) = shared {
                allocation.info.usage_count += 1;
                allocation.info.last_used = Utc::now();
                debug!(
                    "Reusing relay port {} (users: {})",
                    allocation.info.port, allocation.info.usage_count
                );
                return Ok((allocation.info.clone(), Arc::clone(&allocation.conn)));
            }
        }

        let conn = self.connector.allocate(&self.server).await?;
        let info = self.insert_allocation(Arc::clone(&conn), 1).await;
        debug!("Allocated relay port {}", info.port);
        Ok((info, conn))
    }

    /// Drop one claim on a relay port; the last claim closes it
    pub async fn release_port(&self, port: u16) -> Result<(), TurnError> {
        let released = {
            let mut allocations = self.allocations.write().await;
            let allocation = allocations
                .get_mut(&port)
                .ok_or(TurnError::PortNotAllocated(port))?;
            allocation.info.usage_count = allocation.info.usage_count.saturating_sub(1);
            if allocation.info.usage_count == 0 {
                allocations.remove(&port)
            } else {
                None
            }
        };

        if let Some(allocation) = released {
            allocation.conn.close().await;
            debug!("Released relay port {}", port);
        }
        Ok(())
    }

    /// Snapshot of the allocation table
    pub async fn allocated_ports(&self) -> Vec<AllocatedPort> {
        let mut ports: Vec<AllocatedPort> = self
            .allocations
            .read()
            .await
            .values()
            .map(|a| a.info.clone())
            .collect();
        ports.sort_by_key(|p| p.port);
        ports
    }

    /// Retire allocations idle for longer than `idle_timeout`
    ///
    /// Unclaimed allocations are closed; claimed ones are only marked
    /// inactive so they are no longer handed out for reuse. Traffic through
    /// a forward rule counts as use. Returns the number of closed ports.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        let now = Utc::now();
        let idle = chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::MAX);

        let rule_activity: HashMap<u16, chrono::DateTime<Utc>> = {
            let rules = self.rules.read().await;
            let mut latest = HashMap::new();
            for rule in rules.values() {
                let seen = rule.last_activity();
                latest
                    .entry(rule.external_port)
                    .and_modify(|t| {
                        if seen > *t {
                            *t = seen
                        }
                    })
                    .or_insert(seen);
            }
            latest
        };

        let expired: Vec<Allocation> = {
            let mut allocations = self.allocations.write().await;
            let mut unclaimed = Vec::new();
            for allocation in allocations.values_mut() {
                if let Some(seen) = rule_activity.get(&allocation.info.port) {
                    if *seen > allocation.info.last_used {
                        allocation.info.last_used = *seen;
                    }
                }
                if now - allocation.info.last_used < idle {
                    continue;
                }
                if allocation.info.usage_count == 0 {
                    unclaimed.push(allocation.info.port);
                } else if allocation.info.active {
                    debug!("Relay port {} idle, marking inactive", allocation.info.port);
                    allocation.info.active = false;
                }
            }
            unclaimed
                .into_iter()
                .filter_map(|port| allocations.remove(&port))
                .collect()
        };

        let count = expired.len();
        for allocation in expired {
            allocation.conn.close().await;
            info!("Closed idle relay port {}", allocation.info.port);
        }
        count
    }

    /// Route traffic arriving at `external_port` to `local_port`
    pub async fn add_forward_rule(
        &self,
        external_port: u16,
        local_port: u16,
        protocol: Protocol,
    ) -> Result<Arc<ForwardRule>, TurnError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TurnError::Closed);
        }
        if !self.allocations.read().await.contains_key(&external_port) {
            return Err(TurnError::PortNotAllocated(external_port));
        }

        let rule = Arc::new(ForwardRule::new(external_port, local_port, protocol));
        self.rules
            .write()
            .await
            .insert((local_port, protocol), Arc::clone(&rule));
        info!(
            "Forward rule {} -> {}/{} added",
            external_port, local_port, protocol
        );
        Ok(rule)
    }

    /// Remove the rule for a local port and release its relay claim
    pub async fn remove_forward_rule(
        &self,
        local_port: u16,
        protocol: Protocol,
    ) -> Result<Arc<ForwardRule>, TurnError> {
        let rule = self
            .rules
            .write()
            .await
            .remove(&(local_port, protocol))
            .ok_or(TurnError::RuleNotFound {
                port: local_port,
                protocol,
            })?;

        if let Err(e) = self.release_port(rule.external_port).await {
            debug!("Releasing relay port {}: {}", rule.external_port, e);
        }
        info!(
            "Forward rule {} -> {}/{} removed",
            rule.external_port, local_port, protocol
        );
        Ok(rule)
    }

    /// Forward rule for a local port
    pub async fn forward_rule(&self, local_port: u16, protocol: Protocol) -> Option<Arc<ForwardRule>> {
        self.rules.read().await.get(&(local_port, protocol)).cloned()
    }

    /// All forward rules
    pub async fn forward_rules(&self) -> Vec<Arc<ForwardRule>> {
        self.rules.read().await.values().cloned().collect()
    }

    /// Whether the client is open and every claimed allocation is alive
    pub async fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        let conns: Vec<Arc<dyn RelayConn>> = self
            .allocations
            .read()
            .await
            .values()
            .filter(|a| a.info.usage_count > 0)
            .map(|a| Arc::clone(&a.conn))
            .collect();
        if conns.is_empty() {
            return false;
        }
        for conn in conns {
            if !conn.is_connected().await {
                return false;
            }
        }
        true
    }

    /// Close every allocation; later calls are no-ops
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.rules.write().await.clear();
        let allocations: Vec<Allocation> = self.allocations.write().await.drain().map(|(_, a)| a).collect();
        for allocation in allocations {
            allocation.conn.close().await;
        }
        info!("TURN client for {} closed", self.server.address);
    }
}
