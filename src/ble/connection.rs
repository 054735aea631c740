//! BLE connection management.
//!
//! Connects to the adapter peripheral and tracks whether the link is still
//! up. Every state change is broadcast, so the notification listener can
//! stop as soon as the platform reports the adapter gone.

use btleplug::api::{Central, CentralEvent, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Connection state of the adapter peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected and services discovered.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }

    /// Whether the link is gone or going.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// A link state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Platform identifier of the peripheral.
    pub identifier: String,
    /// State before the transition.
    pub previous: ConnectionState,
    /// State after the transition.
    pub state: ConnectionState,
}

/// State of one link plus the channel announcing its transitions.
#[derive(Debug)]
pub struct LinkState {
    identifier: String,
    state: RwLock<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl LinkState {
    /// Start out disconnected.
    pub fn new(identifier: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            identifier: identifier.into(),
            state: RwLock::new(ConnectionState::Disconnected),
            event_tx,
        }
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Receive every later transition.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Move to `next` and return the previous state.
    pub fn set(&self, next: ConnectionState) -> ConnectionState {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        self.announce(previous, next);
        previous
    }

    /// Claim the link for a connect attempt.
    ///
    /// Returns `Ok(false)` when already connected.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionFailed`] while another transition is running.
    pub fn begin_connect(&self) -> Result<bool> {
        let previous = {
            let mut state = self.state.write();
            match *state {
                ConnectionState::Connected => return Ok(false),
                current if current.is_transitioning() => {
                    return Err(Error::ConnectionFailed {
                        reason: format!("link is {}", current),
                    })
                }
                current => {
                    *state = ConnectionState::Connecting;
                    current
                }
            }
        };
        self.announce(previous, ConnectionState::Connecting);
        Ok(true)
    }

    /// Claim the link for a disconnect. Returns `false` when it is already
    /// down.
    pub fn begin_disconnect(&self) -> bool {
        let previous = {
            let mut state = self.state.write();
            if state.is_down() {
                return false;
            }
            std::mem::replace(&mut *state, ConnectionState::Disconnecting)
        };
        self.announce(previous, ConnectionState::Disconnecting);
        true
    }

    fn announce(&self, previous: ConnectionState, state: ConnectionState) {
        if previous == state {
            return;
        }
        debug!("Connection state changed: {} -> {}", previous, state);
        let _ = self.event_tx.send(ConnectionEvent {
            identifier: self.identifier.clone(),
            previous,
            state,
        });
    }
}

/// Manages the GATT connection to one adapter.
pub struct ConnectionManager {
    peripheral: Peripheral,
    link: LinkState,
    /// Connection attempts per [`connect`](Self::connect) call.
    max_connect_attempts: u32,
    /// Delay between attempts.
    retry_delay: Duration,
}

impl ConnectionManager {
    /// Create a new connection manager for a peripheral.
    pub fn new(peripheral: Peripheral) -> Self {
        let link = LinkState::new(peripheral.id().to_string());
        Self {
            peripheral,
            link,
            max_connect_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.link.get()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.link.subscribe()
    }

    /// Connect and discover services, retrying on failure.
    pub async fn connect(&self) -> Result<()> {
        if !self.link.begin_connect()? {
            debug!("Already connected");
            return Ok(());
        }

        let max_attempts = self.max_connect_attempts.max(1);

        for attempt in 1..=max_attempts {
            debug!("Connection attempt {} of {}", attempt, max_attempts);

            let connected = if self.peripheral.is_connected().await.unwrap_or(false) {
                info!("Peripheral already connected at BLE level");
                Ok(())
            } else {
                self.peripheral.connect().await
            };

            match connected {
                Ok(()) => match self.peripheral.discover_services().await {
                    Ok(()) => {
                        info!("Connected to adapter");
                        self.link.set(ConnectionState::Connected);
                        return Ok(());
                    }
                    Err(e) => warn!("Failed to discover services: {}", e),
                },
                Err(e) => warn!("Connection attempt {} failed: {}", attempt, e),
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        self.link.set(ConnectionState::Disconnected);
        Err(Error::ConnectionFailed {
            reason: format!("Failed after {} attempts", max_attempts),
        })
    }

    /// Disconnect from the adapter.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.link.begin_disconnect() {
            return Ok(());
        }

        let result = self.peripheral.disconnect().await;
        self.link.set(ConnectionState::Disconnected);
        match result {
            Ok(()) => {
                info!("Disconnected from adapter");
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                Err(Error::Bluetooth(e))
            }
        }
    }

    /// Record that the link is gone without us closing it.
    pub fn mark_disconnected(&self) {
        if self.link.set(ConnectionState::Disconnected).is_connected() {
            warn!("Adapter link dropped");
        }
    }

    /// Mark the link down when `adapter` reports this peripheral
    /// disconnected.
    ///
    /// The task holds only a weak reference and ends after the first
    /// matching event.
    pub async fn watch_adapter(self: &Arc<Self>, adapter: &Adapter) -> Result<JoinHandle<()>> {
        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;
        let id = self.peripheral.id();
        let manager: Weak<Self> = Arc::downgrade(self);

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDisconnected(gone) = event else {
                    continue;
                };
                if gone != id {
                    continue;
                }
                if let Some(manager) = manager.upgrade() {
                    manager.mark_disconnected();
                }
                break;
            }
            debug!("Adapter watcher stopped");
        }))
    }

    /// Set the retry parameters for [`connect`](Self::connect).
    pub fn set_reconnect_params(&mut self, max_attempts: u32, delay: Duration) {
        self.max_connect_attempts = max_attempts;
        self.retry_delay = delay;
    }
}
