//! UPnP IGD (Internet Gateway Device) port mapping provider
//!
//! Gateways are found through SSDP and driven with the SOAP actions
//! `AddPortMapping`, `DeletePortMapping` and `GetExternalIPAddress`. The
//! igd-next client is blocking, so every call runs on the blocking pool with
//! an explicit timeout.
//!
//! The provider keeps a rotation of discovered gateways with a consecutive
//! failure counter each. A gateway reaching the configured failure count is
//! dropped, and discovery is retried in the background once the rotation
//! is empty.

use super::provider::MappingProvider;
use super::types::{
    AddType, MappingError, MappingKey, MappingStatus, PortMapping, Protocol, ProviderStatus,
    ProviderType,
};
use crate::config::{MonitorConfig, UpnpConfig};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Leases are refreshed once this share of their duration has passed
const RENEWAL_RATIO: f64 = 0.8;

/// One Internet Gateway Device
///
/// Calls are blocking; the provider runs them on the blocking pool.
pub trait GatewayClient: Send + Sync {
    /// Display name, usually the device address
    fn name(&self) -> String;

    /// `AddPortMapping` forwarding `external_port` to `internal_port` on this host
    fn add_port(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        lease_secs: u32,
        description: &str,
    ) -> Result<(), MappingError>;

    /// `DeletePortMapping`
    fn remove_port(&self, protocol: Protocol, external_port: u16) -> Result<(), MappingError>;

    /// `GetExternalIPAddress`
    fn external_ip(&self) -> Result<IpAddr, MappingError>;
}

/// Finds gateways on the local network
pub trait GatewayDiscovery: Send + Sync {
    /// Blocking search bounded by `timeout`
    fn discover(&self, timeout: Duration) -> Result<Vec<Arc<dyn GatewayClient>>, MappingError>;
}

/// Answers whether a port is currently served, for manual-mapping reconciliation
#[async_trait]
pub trait LivenessSource: Send + Sync {
    /// `None` if the port is not tracked
    async fn is_port_active(&self, port: u16) -> Option<bool>;
}

fn igd_protocol(protocol: Protocol) -> igd_next::PortMappingProtocol {
    match protocol {
        Protocol::Tcp => igd_next::PortMappingProtocol::TCP,
        Protocol::Udp => igd_next::PortMappingProtocol::UDP,
    }
}

/// Gateway backed by igd-next
pub struct IgdGateway {
    gateway: igd_next::Gateway,
}

impl IgdGateway {
    /// Wrap a discovered gateway
    pub fn new(gateway: igd_next::Gateway) -> Self {
        Self { gateway }
    }

    /// Local address on the interface facing the gateway
    fn local_ip(&self) -> Result<IpAddr, MappingError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| MappingError::Internal(format!("Failed to create socket: {}", e)))?;
        socket
            .connect(self.gateway.addr)
            .map_err(|e| MappingError::Internal(format!("Failed to connect: {}", e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| MappingError::Internal(format!("Failed to get local address: {}", e)))?;
        Ok(local.ip())
    }
}

impl GatewayClient for IgdGateway {
    fn name(&self) -> String {
        self.gateway.addr.to_string()
    }

    fn add_port(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        lease_secs: u32,
        description: &str,
    ) -> Result<(), MappingError> {
        let local_addr = SocketAddr::new(self.local_ip()?, internal_port);
        debug!(
            "AddPortMapping {} -> {} ({}s) on {}",
            external_port, local_addr, lease_secs, self.gateway.addr
        );
        self.gateway
            .add_port(
                igd_protocol(protocol),
                external_port,
                local_addr,
                lease_secs,
                description,
            )
            .map_err(|e| MappingError::GatewayError(format!("AddPortMapping failed: {}", e)))
    }

    fn remove_port(&self, protocol: Protocol, external_port: u16) -> Result<(), MappingError> {
        self.gateway
            .remove_port(igd_protocol(protocol), external_port)
            .map_err(|e| MappingError::GatewayError(format!("DeletePortMapping failed: {}", e)))
    }

    fn external_ip(&self) -> Result<IpAddr, MappingError> {
        self.gateway
            .get_external_ip()
            .map_err(|e| MappingError::GatewayError(format!("GetExternalIPAddress failed: {}", e)))
    }
}

/// SSDP discovery through igd-next
#[derive(Debug, Clone, Copy, Default)]
pub struct IgdDiscovery;

impl GatewayDiscovery for IgdDiscovery {
    fn discover(&self, timeout: Duration) -> Result<Vec<Arc<dyn GatewayClient>>, MappingError> {
        debug!("Searching for UPnP IGD gateway...");
        let gateway = igd_next::search_gateway(igd_next::SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        })
        .map_err(|e| {
            debug!("UPnP gateway search failed: {}", e);
            MappingError::NoGateway
        })?;

        info!("Found UPnP gateway at {}", gateway.addr);
        Ok(vec![Arc::new(IgdGateway::new(gateway))])
    }
}

/// Health snapshot of one gateway in rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayHealth {
    /// Gateway display name
    pub name: String,
    /// Consecutive failures
    pub failures: u32,
    /// Last successful call
    pub last_seen: DateTime<Utc>,
}

struct GatewayEntry {
    id: u64,
    client: Arc<dyn GatewayClient>,
    failures: u32,
    last_seen: DateTime<Utc>,
}

struct UpnpMapping {
    mapping: PortMapping,
    lease_secs: u32,
    renewed_at: DateTime<Utc>,
}

#[derive(Default)]
struct MappingTable {
    mappings: HashMap<MappingKey, UpnpMapping>,
    pending: HashSet<MappingKey>,
}

impl MappingTable {
    fn collision(&self, internal_port: u16, external_port: u16, protocol: Protocol) -> Option<MappingKey> {
        self.mappings
            .values()
            .map(|m| &m.mapping)
            .find(|m| m.collides_with(internal_port, external_port, protocol))
            .map(|m| m.key())
            .or_else(|| {
                self.pending
                    .iter()
                    .find(|k| {
                        k.internal_port == internal_port
                            && k.protocol == protocol
                            && (external_port == 0 || k.external_port == external_port)
                    })
                    .copied()
            })
    }
}

/// Mapping provider driving IGD gateways
pub struct UpnpProvider {
    me: Weak<UpnpProvider>,
    config: UpnpConfig,
    cleanup_interval: Duration,
    discovery: Arc<dyn GatewayDiscovery>,
    liveness: RwLock<Option<Arc<dyn LivenessSource>>>,
    gateways: RwLock<Vec<GatewayEntry>>,
    next_gateway_id: AtomicU64,
    table: RwLock<MappingTable>,
    available: AtomicBool,
    discovering: AtomicBool,
    last_error: RwLock<Option<String>>,
    shutdown: Mutex<Option<Shutdown>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UpnpProvider {
    /// Create a provider that discovers gateways over SSDP
    pub fn new(config: &UpnpConfig, monitor: &MonitorConfig) -> Arc<Self> {
        Self::with_discovery(config, monitor, Arc::new(IgdDiscovery))
    }

    /// Create a provider with a custom gateway discovery
    pub fn with_discovery(
        config: &UpnpConfig,
        monitor: &MonitorConfig,
        discovery: Arc<dyn GatewayDiscovery>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config: config.clone(),
            cleanup_interval: monitor.cleanup_interval(),
            discovery,
            liveness: RwLock::new(None),
            gateways: RwLock::new(Vec::new()),
            next_gateway_id: AtomicU64::new(0),
            table: RwLock::new(MappingTable::default()),
            available: AtomicBool::new(false),
            discovering: AtomicBool::new(false),
            last_error: RwLock::new(None),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Reconcile manual mappings against a liveness source
    pub async fn set_liveness(&self, source: Arc<dyn LivenessSource>) {
        *self.liveness.write().await = Some(source);
    }

    async fn set_error(&self, error: &MappingError) {
        *self.last_error.write().await = Some(error.to_string());
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, MappingError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, MappingError> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(self.config.request_timeout(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(MappingError::Internal(format!("Task join error: {}", e))),
            Err(_) => Err(MappingError::Timeout),
        }
    }

    /// Search for gateways, retrying per configuration
    ///
    /// Replaces the gateway rotation on success. Returns the number found.
    pub async fn discover(&self) -> Result<usize, MappingError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_err = MappingError::NoGateway;

        for attempt in 1..=attempts {
            let discovery = Arc::clone(&self.discovery);
            let timeout = self.config.discovery_timeout();
            let task = tokio::task::spawn_blocking(move || discovery.discover(timeout));
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(MappingError::Internal(format!("Task join error: {}", e))),
            };

            match result {
                Ok(found) if !found.is_empty() => {
                    let now = Utc::now();
                    let entries: Vec<GatewayEntry> = found
                        .into_iter()
                        .map(|client| GatewayEntry {
                            id: self.next_gateway_id.fetch_add(1, Ordering::Relaxed),
                            client,
                            failures: 0,
                            last_seen: now,
                        })
                        .collect();
                    let count = entries.len();
                    *self.gateways.write().await = entries;
                    self.available.store(true, Ordering::Relaxed);
                    info!("UPnP discovery found {} gateway(s)", count);
                    return Ok(count);
                }
                Ok(_) => last_err = MappingError::NoGateway,
                Err(e) => last_err = e,
            }

            debug!(
                "UPnP discovery attempt {}/{} failed: {}",
                attempt, attempts, last_err
            );
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        self.available.store(false, Ordering::Relaxed);
        self.set_error(&last_err).await;
        Err(last_err)
    }

    /// Gateways currently in rotation
    pub async fn gateways(&self) -> Vec<GatewayHealth> {
        self.gateways
            .read()
            .await
            .iter()
            .map(|g| GatewayHealth {
                name: g.client.name(),
                failures: g.failures,
                last_seen: g.last_seen,
            })
            .collect()
    }

    /// Rediscover unless a discovery is already running
    async fn rediscover(&self) {
        if self.discovering.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.discover().await {
            warn!("UPnP rediscovery failed: {}", e);
        }
        self.discovering.store(false, Ordering::SeqCst);
    }

    async fn rotation(&self) -> Vec<(u64, Arc<dyn GatewayClient>)> {
        self.gateways
            .read()
            .await
            .iter()
            .map(|g| (g.id, Arc::clone(&g.client)))
            .collect()
    }

    async fn record_result(&self, id: u64, ok: bool) {
        let max_failures = self.config.max_failure_count.max(1);
        let mut gateways = self.gateways.write().await;
        if let Some(entry) = gateways.iter_mut().find(|g| g.id == id) {
            if ok {
                entry.failures = 0;
                entry.last_seen = Utc::now();
            } else {
                entry.failures += 1;
            }
        }
        gateways.retain(|g| {
            let keep = g.failures < max_failures;
            if !keep {
                warn!(
                    "Dropping gateway {} after {} consecutive failures",
                    g.client.name(),
                    g.failures
                );
            }
            keep
        });
        if gateways.is_empty() {
            self.available.store(false, Ordering::Relaxed);
        }
    }

    /// Run `op` against each gateway in rotation until one accepts
    async fn on_first_gateway<T, F>(&self, op: F) -> Result<(T, Arc<dyn GatewayClient>), MappingError>
    where
        T: Send + 'static,
        F: Fn(&dyn GatewayClient) -> Result<T, MappingError> + Clone + Send + 'static,
    {
        let rotation = self.rotation().await;
        if rotation.is_empty() {
            return Err(MappingError::NoGateway);
        }

        let mut last_err = MappingError::NoGateway;
        for (id, client) in rotation {
            let call = op.clone();
            let target = Arc::clone(&client);
            match self.run_blocking(move || call(target.as_ref())).await {
                Ok(value) => {
                    self.record_result(id, true).await;
                    return Ok((value, client));
                }
                Err(e) => {
                    warn!("Gateway {} failed: {}", client.name(), e);
                    self.record_result(id, false).await;
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Probe every gateway with `GetExternalIPAddress`
    ///
    /// Rediscovers when no gateway is left.
    pub async fn health_check(&self) -> usize {
        for (id, client) in self.rotation().await {
            let target = Arc::clone(&client);
            let ok = match self.run_blocking(move || target.external_ip()).await {
                Ok(ip) => {
                    debug!("Gateway {} healthy (external IP {})", client.name(), ip);
                    true
                }
                Err(e) => {
                    warn!("Gateway {} health check failed: {}", client.name(), e);
                    false
                }
            };
            self.record_result(id, ok).await;
        }

        if self.gateways.read().await.is_empty() {
            self.rediscover().await;
        }
        self.gateways.read().await.len()
    }

    /// Re-add mappings whose lease is 80% spent
    pub async fn renew_leases(&self) -> usize {
        let now = Utc::now();
        let due: Vec<(MappingKey, String, u32)> = self
            .table
            .read()
            .await
            .mappings
            .values()
            .filter(|m| m.mapping.status != MappingStatus::Failed && m.lease_secs > 0)
            .filter(|m| {
                let elapsed = (now - m.renewed_at).num_milliseconds() as f64 / 1000.0;
                elapsed >= m.lease_secs as f64 * RENEWAL_RATIO
            })
            .map(|m| (m.mapping.key(), m.mapping.description.clone(), m.lease_secs))
            .collect();

        let mut renewed = 0;
        for (key, description, lease) in due {
            let result = self
                .on_first_gateway(move |gw| {
                    gw.add_port(key.protocol, key.external_port, key.internal_port, lease, &description)
                })
                .await;

            let mut table = self.table.write().await;
            let Some(entry) = table.mappings.get_mut(&key) else {
                continue;
            };
            match result {
                Ok(_) => {
                    entry.renewed_at = Utc::now();
                    entry.mapping.last_activity = entry.renewed_at;
                    renewed += 1;
                    debug!("Renewed UPnP lease for {}", key);
                }
                Err(e) => {
                    error!("Lease renewal for {} failed: {}", key, e);
                    entry.mapping.status = MappingStatus::Failed;
                    entry.mapping.error = Some(e.to_string());
                }
            }
        }
        renewed
    }

    /// Mark manual mappings active or inactive from the liveness source
    pub async fn reconcile_manual(&self) -> usize {
        let Some(source) = self.liveness.read().await.clone() else {
            return 0;
        };

        let manual: Vec<(MappingKey, u16)> = self
            .table
            .read()
            .await
            .mappings
            .values()
            .filter(|m| m.mapping.add_type == AddType::Manual)
            .map(|m| (m.mapping.key(), m.mapping.internal_port))
            .collect();

        let mut changed = 0;
        for (key, port) in manual {
            let Some(active) = source.is_port_active(port).await else {
                continue;
            };
            let mut table = self.table.write().await;
            let Some(entry) = table.mappings.get_mut(&key) else {
                continue;
            };
            let next = match (entry.mapping.status, active) {
                (MappingStatus::Inactive, true) => MappingStatus::Active,
                (MappingStatus::Active, false) => MappingStatus::Inactive,
                _ => continue,
            };
            info!("Manual mapping {} is now {:?}", key, next);
            entry.mapping.status = next;
            entry.mapping.last_activity = Utc::now();
            changed += 1;
        }
        changed
    }

    /// Drop failed mappings older than the cleanup interval
    pub async fn sweep_failed(&self) -> usize {
        let horizon = Utc::now()
            - chrono::Duration::from_std(self.cleanup_interval).unwrap_or(chrono::Duration::zero());
        let expired: Vec<PortMapping> = {
            let mut table = self.table.write().await;
            let keys: Vec<MappingKey> = table
                .mappings
                .values()
                .filter(|m| m.mapping.status == MappingStatus::Failed)
                .filter(|m| m.mapping.last_activity <= horizon)
                .map(|m| m.mapping.key())
                .collect();
            keys.iter()
                .filter_map(|k| table.mappings.remove(k))
                .map(|m| m.mapping)
                .collect()
        };

        for mapping in &expired {
            let (protocol, port) = (mapping.protocol, mapping.external_port);
            if let Err(e) = self
                .on_first_gateway(move |gw| gw.remove_port(protocol, port))
                .await
            {
                debug!("Cleanup of {} on gateway failed: {}", mapping.key(), e);
            }
            info!("Expired failed UPnP mapping {}", mapping.key());
        }
        expired.len()
    }

    /// One maintenance pass: renewals, reconciliation, expiry
    pub async fn maintain(&self) {
        self.renew_leases().await;
        self.reconcile_manual().await;
        self.sweep_failed().await;
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        shutdown: &Shutdown,
        interval: Duration,
        name: &'static str,
        body: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        let mut signal = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = signal.recv() => break,
                    _ = ticker.tick() => body(Arc::clone(&this)).await,
                }
            }
            debug!("UPnP {} loop stopped", name);
        })
    }

    async fn start_background(self: &Arc<Self>, poll_interval: Duration) {
        let mut guard = self.shutdown.lock().await;
        if guard.is_some() {
            return;
        }
        let shutdown = Shutdown::new();
        let maintenance = self.spawn_loop(&shutdown, poll_interval, "maintenance", |p| async move {
            p.maintain().await
        });
        let health = self.spawn_loop(
            &shutdown,
            self.config.health_check_interval(),
            "health",
            |p| async move {
                p.health_check().await;
            },
        );
        self.tasks.lock().await.extend([maintenance, health]);
        *guard = Some(shutdown);
    }
}

#[async_trait]
impl MappingProvider for UpnpProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Upnp
    }

    fn name(&self) -> &str {
        "UPnP"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn start(&self, poll_interval: Duration) -> Result<(), MappingError> {
        info!("Starting UPnP provider");
        if let Err(e) = self.discover().await {
            warn!("UPnP discovery failed at start, provider unavailable: {}", e);
        }
        if let Some(this) = self.me.upgrade() {
            this.start_background(poll_interval).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), MappingError> {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            shutdown.trigger();
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let mappings: Vec<PortMapping> = self
            .table
            .write()
            .await
            .mappings
            .drain()
            .map(|(_, m)| m.mapping)
            .collect();
        for mapping in mappings {
            let (protocol, port) = (mapping.protocol, mapping.external_port);
            if let Err(e) = self
                .on_first_gateway(move |gw| gw.remove_port(protocol, port))
                .await
            {
                warn!("Failed to remove {} during stop: {}", mapping.key(), e);
            }
        }

        self.available.store(false, Ordering::Relaxed);
        info!("UPnP provider stopped");
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
        let external_port = if external_port == 0 {
            internal_port
        } else {
            external_port
        };
        let key = MappingKey::new(internal_port, external_port, protocol);

        {
            let mut table = self.table.write().await;
            if let Some(existing) = table.collision(internal_port, external_port, protocol) {
                return Err(MappingError::Conflict(existing));
            }
            table.pending.insert(key);
        }

        let result = self.add_on_gateway(key, description).await;

        let mut table = self.table.write().await;
        table.pending.remove(&key);
        match result {
            Ok(external_ip) => {
                let mut mapping = PortMapping::new(key, description, add_type, ProviderType::Upnp);
                mapping.external_address = external_ip.map(|ip| ip.to_string());
                table.mappings.insert(
                    key,
                    UpnpMapping {
                        mapping: mapping.clone(),
                        lease_secs: self.config.lease_duration_secs,
                        renewed_at: mapping.created_at,
                    },
                );
                info!("UPnP mapping {} created", key);
                Ok(mapping)
            }
            Err(e) => {
                drop(table);
                self.set_error(&e).await;
                Err(e)
            }
        }
    }

    async fn remove_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        add_type: AddType,
    ) -> Result<PortMapping, MappingError> {
        let requested = MappingKey::new(internal_port, external_port, protocol);
        let key = self
            .table
            .read()
            .await
            .mappings
            .values()
            .map(|m| &m.mapping)
            .find(|m| m.collides_with(internal_port, external_port, protocol) && m.add_type == add_type)
            .map(|m| m.key())
            .ok_or(MappingError::NotFound(requested))?;

        let result = self
            .on_first_gateway(move |gw| gw.remove_port(key.protocol, key.external_port))
            .await;

        let mut table = self.table.write().await;
        match result {
            Ok(_) => {
                let removed = table
                    .mappings
                    .remove(&key)
                    .map(|m| m.mapping)
                    .ok_or(MappingError::NotFound(key))?;
                info!("UPnP mapping {} removed", key);
                Ok(removed)
            }
            Err(e) => {
                if let Some(entry) = table.mappings.get_mut(&key) {
                    entry.mapping.status = MappingStatus::Failed;
                    entry.mapping.error = Some(e.to_string());
                    entry.mapping.last_activity = Utc::now();
                }
                drop(table);
                self.set_error(&e).await;
                Err(e)
            }
        }
    }

    async fn get_mappings(&self) -> Vec<PortMapping> {
        let mut mappings: Vec<PortMapping> = self
            .table
            .read()
            .await
            .mappings
            .values()
            .map(|m| m.mapping.clone())
            .collect();
        mappings.sort_by_key(|m| (m.internal_port, m.external_port, m.protocol.as_str()));
        mappings
    }

    async fn get_status(&self) -> ProviderStatus {
        let (healthy, total) = {
            let gateways = self.gateways.read().await;
            (
                gateways.iter().filter(|g| g.failures == 0).count(),
                gateways.len(),
            )
        };
        ProviderStatus {
            provider: ProviderType::Upnp,
            name: self.name().to_string(),
            available: self.is_available(),
            mapping_count: self.table.read().await.mappings.len(),
            healthy,
            total,
            last_error: self.last_error.read().await.clone(),
        }
    }
}

impl UpnpProvider {
    async fn add_on_gateway(
        &self,
        key: MappingKey,
        description: &str,
    ) -> Result<Option<IpAddr>, MappingError> {
        if !self.is_available() {
            debug!("UPnP unavailable, attempting discovery before {}", key);
            self.rediscover().await;
            if !self.is_available() {
                return Err(MappingError::Unavailable(
                    "no UPnP gateway discovered".to_string(),
                ));
            }
        }

        let lease = self.config.lease_duration_secs;
        let desc = description.to_string();
        let (_, gateway) = self
            .on_first_gateway(move |gw| {
                gw.add_port(key.protocol, key.external_port, key.internal_port, lease, &desc)
            })
            .await?;

        let target = Arc::clone(&gateway);
        match self.run_blocking(move || target.external_ip()).await {
            Ok(ip) => Ok(Some(ip)),
            Err(e) => {
                warn!("Mapped {} but could not read external IP: {}", key, e);
                Ok(None)
            }
        }
    }
}
