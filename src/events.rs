//! Typed event records and listener dispatch
//!
//! Producers (monitors, providers, the hole puncher) emit event records onto an
//! [`EventBus`]. Each registered listener runs as its own task, isolated from
//! panics and bounded by a timeout, so an observer can never stall the
//! producer or break the loop that emitted the event.

use crate::mapping::{AddType, Protocol, ProviderType};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Default time a single listener invocation may take before it is abandoned
pub const DEFAULT_LISTENER_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener callback type
pub type Listener<E> = Arc<dyn Fn(E) + Send + Sync>;

/// A registered list of listeners for one event type
pub struct EventBus<E> {
    listeners: RwLock<Vec<Listener<E>>>,
    timeout: Duration,
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    /// Create an empty bus with the default listener timeout
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_LISTENER_TIMEOUT)
    }

    /// Create an empty bus with a custom listener timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Register a listener
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(Arc::new(listener));
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Deliver an event to every listener without waiting for them
    ///
    /// Must be called from within a tokio runtime.
    pub fn emit(&self, event: E) {
        let listeners: Vec<Listener<E>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };

        for listener in listeners {
            let event = event.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                let call = tokio::task::spawn_blocking(move || {
                    catch_unwind(AssertUnwindSafe(|| listener(event)))
                });
                match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(_))) => warn!("Event listener panicked; continuing"),
                    Ok(Err(e)) => warn!("Event listener task failed: {}", e),
                    Err(_) => debug!("Event listener exceeded {:?}; abandoned", timeout),
                }
            });
        }
    }
}

impl<E> Default for EventBus<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Port liveness transition reported by a monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEvent {
    /// The watched port
    pub port: u16,
    /// New liveness state
    pub active: bool,
    /// Protocol, known only for manually registered ports
    pub protocol: Option<Protocol>,
}

/// Mapping lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingEvent {
    /// A provider established a mapping
    Created {
        /// Internal (local) port
        internal_port: u16,
        /// External port handed out
        external_port: u16,
        /// Transport protocol
        protocol: Protocol,
        /// Provider that satisfied the request
        provider: ProviderType,
        /// How the mapping was requested
        add_type: AddType,
    },
    /// A mapping was removed
    Removed {
        /// Internal (local) port
        internal_port: u16,
        /// External port
        external_port: u16,
        /// Transport protocol
        protocol: Protocol,
        /// Provider the mapping was removed from
        provider: ProviderType,
        /// How the mapping was requested
        add_type: AddType,
    },
    /// Every provider refused the request
    Failed {
        /// Internal (local) port
        internal_port: u16,
        /// Requested external port
        external_port: u16,
        /// Transport protocol
        protocol: Protocol,
        /// Last provider that was tried
        provider: ProviderType,
        /// How the mapping was requested
        add_type: AddType,
        /// Failure description
        error: String,
    },
}

/// TURN traversal session notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoleEvent {
    /// A relay allocation is forwarding to a local port
    Created {
        /// Local port
        port: u16,
        /// Relay port allocated on the TURN server
        external_port: u16,
        /// Transport protocol
        protocol: Protocol,
        /// Public relay address
        external_address: String,
    },
    /// A hole was torn down
    Closed {
        /// Local port
        port: u16,
        /// Transport protocol
        protocol: Protocol,
    },
    /// Allocating or repairing a hole failed
    Failed {
        /// Local port
        port: u16,
        /// Transport protocol
        protocol: Protocol,
        /// Failure description
        error: String,
    },
}
