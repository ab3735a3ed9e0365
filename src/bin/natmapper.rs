//! Natmapper daemon
//!
//! Usage: `natmapper [config.json]`

use anyhow::Context;
use natmapper::config::Config;
use natmapper::nat::{NatClassifier, SystemInfo};
use natmapper::service::NatService;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "natmapper.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    natmapper::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    config.validate().context("Invalid configuration")?;

    info!(
        "Natmapper starting (ports {}..={} step {})",
        config.port_range.start, config.port_range.end, config.port_range.step
    );

    let system = SystemInfo::new(NatClassifier::new(&config.stun));
    match system.sniff().await {
        Ok(nat) => {
            info!("NAT: {} - {}", nat.nat_type, nat.description);
            for hint in nat.recommendations() {
                info!("  hint: {}", hint);
            }
        }
        Err(e) => warn!("NAT detection failed: {}", e),
    }

    let service = NatService::new(&config).await;
    service.start().await.context("Failed to start service")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    service.stop().await;
    Ok(())
}
