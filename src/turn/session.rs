//! TURN allocations backed by the webrtc-rs TURN client

use super::relay::{RelayConn, RelayConnector};
use super::TurnError;
use crate::config::{TurnConfig, TurnServer};
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::turn::client::{Client, ClientConfig};
use webrtc::util::Conn;

const SOFTWARE: &str = "natmapper";

/// Floor for the keep-alive period; `tokio::time::interval` rejects zero
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(1);

fn io_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

/// One relay allocation with its own TURN client and keep-alive
///
/// The keep-alive sends a STUN binding request through the client on every
/// tick; a failed request marks the session disconnected.
pub struct TurnSession {
    server: String,
    client: Arc<Client>,
    relay: Arc<dyn Conn + Send + Sync>,
    relayed_addr: SocketAddr,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown: Shutdown,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl TurnSession {
    /// Authenticate against `server` and allocate a relay address
    pub async fn allocate(
        server: &TurnServer,
        request_timeout: Duration,
        keep_alive_interval: Duration,
    ) -> Result<Self, TurnError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let config = ClientConfig {
            stun_serv_addr: server.address.clone(),
            turn_serv_addr: server.address.clone(),
            username: server.username.clone(),
            password: server.password.clone(),
            realm: server.realm.clone(),
            software: SOFTWARE.to_string(),
            rto_in_ms: 0,
            conn: Arc::new(socket),
            vnet: None,
        };

        let client = Client::new(config)
            .await
            .map_err(|e| TurnError::Protocol(format!("Failed to create TURN client: {}", e)))?;
        client
            .listen()
            .await
            .map_err(|e| TurnError::Protocol(format!("Failed to start TURN client: {}", e)))?;

        let relay = match tokio::time::timeout(request_timeout, client.allocate()).await {
            Ok(Ok(relay)) => relay,
            Ok(Err(e)) => {
                let _ = client.close().await;
                return Err(TurnError::Auth(e.to_string()));
            }
            Err(_) => {
                let _ = client.close().await;
                return Err(TurnError::Timeout);
            }
        };
        let relay: Arc<dyn Conn + Send + Sync> = Arc::new(relay);
        let relayed_addr = match relay.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = relay.close().await;
                let _ = client.close().await;
                return Err(TurnError::Protocol(format!("No relayed address: {}", e)));
            }
        };

        info!("Allocated relay {} on {}", relayed_addr, server.address);

        let session = Self {
            server: server.address.clone(),
            client: Arc::new(client),
            relay,
            relayed_addr,
            connected: Arc::new(AtomicBool::new(true)),
            closed: AtomicBool::new(false),
            shutdown: Shutdown::new(),
            keep_alive: Mutex::new(None),
        };
        session
            .spawn_keep_alive(keep_alive_interval, request_timeout)
            .await;
        Ok(session)
    }

    async fn spawn_keep_alive(&self, interval: Duration, request_timeout: Duration) {
        let client = Arc::clone(&self.client);
        let connected = Arc::clone(&self.connected);
        let server = self.server.clone();
        let mut signal = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_KEEP_ALIVE));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = signal.recv() => break,
                    _ = ticker.tick() => {
                        let alive = matches!(
                            tokio::time::timeout(request_timeout, client.send_binding_request()).await,
                            Ok(Ok(_))
                        );
                        if !alive {
                            warn!("TURN keep-alive to {} failed", server);
                        }
                        connected.store(alive, Ordering::Relaxed);
                    }
                }
            }
            debug!("Keep-alive for {} stopped", server);
        });

        *self.keep_alive.lock().await = Some(handle);
    }
}

#[async_trait]
impl RelayConn for TurnSession {
    fn relayed_addr(&self) -> SocketAddr {
        self.relayed_addr
    }

    fn server(&self) -> &str {
        &self.server
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.relay.recv_from(buf).await.map_err(io_error)
    }

    async fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.relay.send_to(data, peer).await.map_err(io_error)
    }

    async fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.trigger();
        if let Some(handle) = self.keep_alive.lock().await.take() {
            let _ = handle.await;
        }
        if let Err(e) = self.relay.close().await {
            debug!("Closing relay {}: {}", self.relayed_addr, e);
        }
        if let Err(e) = self.client.close().await {
            debug!("Closing TURN client for {}: {}", self.server, e);
        }
        self.connected.store(false, Ordering::Relaxed);
        info!("Released relay {} on {}", self.relayed_addr, self.server);
    }
}

/// Connector that opens real [`TurnSession`]s
#[derive(Debug, Clone)]
pub struct TurnRelayConnector {
    request_timeout: Duration,
    keep_alive_interval: Duration,
}

impl TurnRelayConnector {
    /// Create a connector from configuration
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            keep_alive_interval: config.keep_alive_interval(),
        }
    }
}

#[async_trait]
impl RelayConnector for TurnRelayConnector {
    async fn allocate(&self, server: &TurnServer) -> Result<Arc<dyn RelayConn>, TurnError> {
        let session =
            TurnSession::allocate(server, self.request_timeout, self.keep_alive_interval).await?;
        Ok(Arc::new(session))
    }
}
