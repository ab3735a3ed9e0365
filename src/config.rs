//! Daemon configuration
//!
//! Configuration is stored in JSON. Every section is optional and falls back
//! to its defaults, so an empty or missing file yields a usable setup.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default public STUN servers used for NAT classification
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Top-level configuration
///
/// # Example
/// ```rust,no_run
/// use natmapper::config::Config;
///
/// let config = Config::load("natmapper.json").expect("Failed to load");
/// config.validate().expect("Invalid config");
/// println!("Watching {}..={}", config.port_range.start, config.port_range.end);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Ports watched by the auto monitor
    pub port_range: PortRange,
    /// Monitor intervals
    pub monitor: MonitorConfig,
    /// UPnP provider tunables
    pub upnp: UpnpConfig,
    /// TURN provider tunables
    pub turn: TurnConfig,
    /// STUN servers for NAT classification
    pub stun: StunConfig,
    /// Directory for persisted manual mappings
    pub data_dir: PathBuf,
}

impl Config {
    /// Load configuration from a JSON file
    ///
    /// Returns the defaults if the file doesn't exist or is empty.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
            }
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject configurations the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        let range = &self.port_range;
        if range.start == 0 || range.end < range.start {
            return Err(Error::Config(format!(
                "Invalid port range {}..={}",
                range.start, range.end
            )));
        }
        if range.step == 0 {
            return Err(Error::Config("Port range step must be positive".to_string()));
        }
        if self.monitor.check_interval_secs == 0 || self.monitor.cleanup_interval_secs == 0 {
            return Err(Error::Config("Monitor intervals must be positive".to_string()));
        }
        if self.upnp.health_check_interval_secs == 0 || self.turn.health_check_interval_secs == 0 {
            return Err(Error::Config("Health check intervals must be positive".to_string()));
        }
        if self.turn.keep_alive_interval_secs == 0 {
            return Err(Error::Config("TURN keep-alive interval must be positive".to_string()));
        }
        if self.turn.enabled && self.turn.servers.is_empty() {
            return Err(Error::Config(
                "TURN is enabled but no TURN servers are configured".to_string(),
            ));
        }
        if !self.upnp.enabled && !self.turn.enabled {
            return Err(Error::Config("At least one provider must be enabled".to_string()));
        }
        Ok(())
    }

    /// Path of the manual mapping store
    pub fn mappings_path(&self) -> PathBuf {
        self.data_dir.join(crate::storage::MAPPINGS_FILE)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            monitor: MonitorConfig::default(),
            upnp: UpnpConfig::default(),
            turn: TurnConfig::default(),
            stun: StunConfig::default(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Inclusive port range with a step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortRange {
    /// First port
    pub start: u16,
    /// Last port (inclusive)
    pub end: u16,
    /// Distance between watched ports
    pub step: u16,
}

impl PortRange {
    /// Build a range
    pub fn new(start: u16, end: u16, step: u16) -> Self {
        Self { start, end, step }
    }

    /// Every port in the range
    pub fn ports(&self) -> Vec<u16> {
        if self.step == 0 || self.end < self.start {
            return Vec::new();
        }
        (self.start..=self.end).step_by(self.step as usize).collect()
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 18000,
            end: 18010,
            step: 1,
        }
    }
}

/// Port monitor intervals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between probe sweeps
    pub check_interval_secs: u64,
    /// Seconds between expiry sweeps
    pub cleanup_interval_secs: u64,
    /// Timeout for connect/echo probes in milliseconds
    pub probe_timeout_ms: u64,
    /// Seconds a single event listener may run
    pub callback_timeout_secs: u64,
}

impl MonitorConfig {
    /// Probe sweep interval
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Expiry sweep interval
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Connect/echo probe timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Listener timeout
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
            cleanup_interval_secs: 60,
            probe_timeout_ms: 500,
            callback_timeout_secs: 5,
        }
    }
}

/// UPnP provider tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpnpConfig {
    /// Whether the UPnP provider is registered
    pub enabled: bool,
    /// Gateway discovery timeout in seconds
    pub discovery_timeout_secs: u64,
    /// Requested lease in seconds (0 = permanent)
    pub lease_duration_secs: u32,
    /// Attempts per SOAP call
    pub retry_attempts: u32,
    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Seconds between gateway health probes
    pub health_check_interval_secs: u64,
    /// Consecutive failures before a gateway is dropped
    pub max_failure_count: u32,
    /// Timeout for a single SOAP call in seconds
    pub request_timeout_secs: u64,
}

impl UpnpConfig {
    /// Discovery timeout
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    /// Delay between attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Health probe interval
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// SOAP call timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for UpnpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discovery_timeout_secs: 10,
            lease_duration_secs: 3600,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            health_check_interval_secs: 60,
            max_failure_count: 3,
            request_timeout_secs: 10,
        }
    }
}

/// Credentials for one TURN server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnServer {
    /// `host:port` of the server
    pub address: String,
    /// Long-term credential username
    pub username: String,
    /// Long-term credential password
    pub password: String,
    /// Realm; learned from the server when empty
    #[serde(default)]
    pub realm: String,
}

/// TURN provider tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TurnConfig {
    /// Whether the TURN provider is registered
    pub enabled: bool,
    /// Servers tried in order
    pub servers: Vec<TurnServer>,
    /// Seconds between keep-alive refreshes of allocations
    pub keep_alive_interval_secs: u64,
    /// Seconds between hole health checks
    pub health_check_interval_secs: u64,
    /// Seconds an allocation may stay unused before the sweep releases it
    pub allocation_idle_timeout_secs: u64,
    /// Timeout for TURN handshakes in seconds
    pub request_timeout_secs: u64,
    /// Wait for a local UDP response in milliseconds
    pub udp_response_timeout_ms: u64,
    /// Idle time after which a relayed TCP session is closed
    pub tcp_idle_timeout_secs: u64,
}

impl TurnConfig {
    /// Keep-alive interval
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    /// Health check interval
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Idle allocation threshold
    pub fn allocation_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.allocation_idle_timeout_secs)
    }

    /// Handshake timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Local UDP response wait
    pub fn udp_response_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_response_timeout_ms)
    }

    /// Relayed TCP session idle timeout
    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout_secs)
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            servers: Vec::new(),
            keep_alive_interval_secs: 30,
            health_check_interval_secs: 30,
            allocation_idle_timeout_secs: 600,
            request_timeout_secs: 5,
            udp_response_timeout_ms: 2000,
            tcp_idle_timeout_secs: 120,
        }
    }
}

/// STUN servers for NAT classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StunConfig {
    /// `host:port` list, tried in order
    pub servers: Vec<String>,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl StunConfig {
    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            timeout_ms: 3000,
        }
    }
}
