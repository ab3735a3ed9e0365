//! NAT type detection from STUN observations

use super::cgnat::{is_cgnat, is_private_range};
use super::stun::{StunClient, StunProbe};
use super::{detect_local_ip, NatError, NatInfo, NatType};
use crate::config::StunConfig;
use chrono::Utc;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Number of servers compared when the first answer is inconclusive
const SAMPLE_SERVERS: usize = 3;

/// Classify a set of mapped addresses observed from one local socket
///
/// - one distinct IP and one distinct port: full cone
/// - one distinct IP, several ports: restricted cone
/// - several distinct IPs: symmetric
/// - anything else (no samples): port-restricted, the common default
pub fn classify_samples(samples: &[SocketAddr]) -> NatType {
    let ips: HashSet<IpAddr> = samples.iter().map(|s| s.ip()).collect();
    let ports: HashSet<u16> = samples.iter().map(|s| s.port()).collect();

    match (ips.len(), ports.len()) {
        (1, 1) => NatType::FullCone,
        (1, _) => NatType::RestrictedCone,
        (n, _) if n > 1 => NatType::Symmetric,
        _ => NatType::PortRestricted,
    }
}

/// Runs the classification against a STUN server list
pub struct NatClassifier {
    servers: Vec<String>,
    timeout: Duration,
}

impl NatClassifier {
    /// Create a classifier from configuration
    pub fn new(config: &StunConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            timeout: config.timeout(),
        }
    }

    /// Servers queried, in order
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Detect the NAT type using the real network
    ///
    /// Binds one UDP socket and sends a binding request to each configured
    /// STUN server, then compares the reflexive addresses.
    ///
    /// # Returns
    ///
    /// Returns `Ok(NatInfo)` with the classification and public endpoint,
    /// or `Err(NatError)` when no local address is usable or no server
    /// answered.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use natmapper::config::StunConfig;
    /// use natmapper::nat::NatClassifier;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let classifier = NatClassifier::new(&StunConfig::default());
    /// let info = classifier.detect_nat_type().await?;
    /// println!("{:?} behind {:?}", info.nat_type, info.public_ip);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn detect_nat_type(&self) -> Result<NatInfo, NatError> {
        let local_ip = detect_local_ip()?;
        let client = StunClient::bind(self.timeout).await?;
        self.detect_with(local_ip, &client).await
    }

    /// Detect the NAT type from a given local address and STUN source
    pub async fn detect_with(
        &self,
        local_ip: IpAddr,
        probe: &dyn StunProbe,
    ) -> Result<NatInfo, NatError> {
        info!("Starting NAT type detection (local IP {})", local_ip);

        let mut first = None;
        for (index, server) in self.servers.iter().enumerate() {
            match probe.mapped_address(server).await {
                Ok(mapped) => {
                    first = Some((index, mapped));
                    break;
                }
                Err(e) => debug!("STUN server {} failed: {}", server, e),
            }
        }
        let Some((first_index, mapped)) = first else {
            warn!("No STUN server responded; NAT type unknown");
            return Err(NatError::NoStunResponse);
        };

        let nat_type = if local_ip == mapped.ip() {
            NatType::FullCone
        } else if !is_private_range(local_ip) {
            NatType::Unknown
        } else if is_private_range(mapped.ip()) {
            NatType::Symmetric
        } else {
            let mut samples = vec![mapped];
            for server in self.servers.iter().skip(first_index + 1) {
                if samples.len() >= SAMPLE_SERVERS {
                    break;
                }
                match probe.mapped_address(server).await {
                    Ok(addr) => samples.push(addr),
                    Err(e) => debug!("STUN server {} failed: {}", server, e),
                }
            }
            classify_samples(&samples)
        };

        let mut description = nat_type.description().to_string();
        if is_cgnat(mapped.ip()) {
            description.push_str("; carrier-grade NAT address space detected");
        } else if nat_type == NatType::Symmetric && is_private_range(mapped.ip()) {
            description.push_str("; mapped address is private (double NAT)");
        }

        info!("NAT type detected: {} (public {})", nat_type, mapped);

        Ok(NatInfo {
            nat_type,
            public_ip: Some(mapped.ip()),
            public_port: Some(mapped.port()),
            local_ip: Some(local_ip),
            description,
            detected_at: Utc::now(),
        })
    }
}

/// Explicitly constructed holder of system network facts
///
/// Passed to whatever needs NAT classification; each [`SystemInfo::sniff`]
/// computes a fresh, immutable [`NatInfo`].
pub struct SystemInfo {
    classifier: NatClassifier,
    nat_info: RwLock<Option<NatInfo>>,
}

impl SystemInfo {
    /// Create with a classifier
    pub fn new(classifier: NatClassifier) -> Self {
        Self {
            classifier,
            nat_info: RwLock::new(None),
        }
    }

    /// Classify now and remember the result
    pub async fn sniff(&self) -> Result<NatInfo, NatError> {
        let info = self.classifier.detect_nat_type().await?;
        *self.nat_info.write().await = Some(info.clone());
        Ok(info)
    }

    /// Classify from a given source and remember the result
    pub async fn sniff_with(
        &self,
        local_ip: IpAddr,
        probe: &dyn StunProbe,
    ) -> Result<NatInfo, NatError> {
        let info = self.classifier.detect_with(local_ip, probe).await?;
        *self.nat_info.write().await = Some(info.clone());
        Ok(info)
    }

    /// Last classification, if any
    pub async fn nat_info(&self) -> Option<NatInfo> {
        self.nat_info.read().await.clone()
    }
}
