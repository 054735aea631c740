//! GATT characteristic handling.
//!
//! Resolves the adapter's serial characteristics, writes commands and
//! forwards notifications into a [`NotificationSink`].

use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::ble::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::transport::NotificationSink;

/// Handler for the GATT characteristics of one adapter.
pub struct CharacteristicHandler {
    /// The peripheral to communicate with.
    peripheral: Peripheral,
    /// Cached characteristics by (service, characteristic).
    characteristics: Arc<RwLock<HashMap<(Uuid, Uuid), Characteristic>>>,
    /// Whether we're currently listening for notifications.
    is_listening: Arc<RwLock<bool>>,
    /// Handle to the notification listener task.
    listener_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl CharacteristicHandler {
    /// Create a new characteristic handler for a peripheral.
    ///
    /// Note: Services must be discovered before using this handler.
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            is_listening: Arc::new(RwLock::new(false)),
            listener_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Discover and cache all characteristics.
    ///
    /// This should be called after connecting and discovering services.
    pub fn discover_characteristics(&self) -> usize {
        let services = self.peripheral.services();

        let mut chars = self.characteristics.write();
        chars.clear();

        for service in services {
            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} in service {} ({:?})",
                    characteristic.uuid, service.uuid, characteristic.properties
                );
                chars.insert((service.uuid, characteristic.uuid), characteristic);
            }
        }

        debug!("Discovered {} characteristics", chars.len());
        chars.len()
    }

    /// Whether any characteristic of `service` was discovered.
    pub fn has_service(&self, service: &Uuid) -> bool {
        self.characteristics
            .read()
            .keys()
            .any(|(s, _)| s == service)
    }

    /// Look up a characteristic of `service`.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`] if the service is absent,
    /// [`Error::CharacteristicNotFound`] if only the characteristic is.
    pub fn get_characteristic(&self, service: &Uuid, uuid: &Uuid) -> Result<Characteristic> {
        if let Some(characteristic) = self.characteristics.read().get(&(*service, *uuid)) {
            return Ok(characteristic.clone());
        }

        if !self.has_service(service) {
            return Err(Error::ServiceNotFound {
                uuid: service.to_string(),
            });
        }

        for (s, c) in self.characteristics.read().keys() {
            debug!("  Available characteristic: {} in {}", c, s);
        }
        Err(Error::CharacteristicNotFound {
            uuid: uuid.to_string(),
        })
    }

    /// Write to a characteristic.
    pub async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(|e| Error::Write {
                reason: e.to_string(),
            })?;

        trace!(
            "Wrote {} bytes to characteristic {}",
            data.len(),
            characteristic.uuid
        );

        Ok(())
    }

    /// Subscribe to notifications from a characteristic.
    pub async fn subscribe(&self, characteristic: &Characteristic) -> Result<()> {
        self.peripheral
            .subscribe(characteristic)
            .await
            .map_err(|e| {
                debug!("Failed to subscribe to {}: {:?}", characteristic.uuid, e);
                Error::Bluetooth(e)
            })?;

        debug!(
            "Subscribed to notifications from {}",
            characteristic.uuid
        );

        Ok(())
    }

    /// Unsubscribe from notifications from a characteristic.
    pub async fn unsubscribe(&self, characteristic: &Characteristic) -> Result<()> {
        self.peripheral
            .unsubscribe(characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        debug!(
            "Unsubscribed from notifications from {}",
            characteristic.uuid
        );

        Ok(())
    }

    /// Start forwarding notifications of `characteristic` into `sink`.
    ///
    /// Notifications from other characteristics are ignored. The listener
    /// stops when `connection` goes down, and marks it down itself if the
    /// notification stream ends. Either way `sink` is dropped with it, which
    /// closes the queue behind it.
    pub async fn start_notifications(
        &self,
        characteristic: Uuid,
        sink: NotificationSink,
        connection: Arc<ConnectionManager>,
    ) -> Result<()> {
        if *self.is_listening.read() {
            return Ok(());
        }

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(Error::Bluetooth)?;
        let mut link_events = connection.subscribe();

        *self.is_listening.write() = true;

        let is_listening = self.is_listening.clone();

        let handle = tokio::spawn(async move {
            debug!("Notification listener started for {}", characteristic);

            while *is_listening.read() {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(notification) = notification else {
                            error!("Notification stream ended");
                            connection.mark_disconnected();
                            break;
                        };

                        if notification.uuid != characteristic {
                            trace!("Ignoring notification from {}", notification.uuid);
                            continue;
                        }

                        sink.deliver(notification.value);
                    }
                    event = link_events.recv() => match event {
                        Ok(event) if event.state.is_down() => {
                            debug!("Link {}, stopping notifications", event.state);
                            break;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {
                        if !*is_listening.read() {
                            break;
                        }
                    }
                }
            }

            *is_listening.write() = false;
            debug!("Notification listener stopped");
        });

        *self.listener_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop listening for notifications.
    pub async fn stop_notifications(&self) {
        *self.is_listening.write() = false;

        let handle = self.listener_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether the notification listener is running.
    pub fn is_listening(&self) -> bool {
        *self.is_listening.read()
    }
}

impl Drop for CharacteristicHandler {
    fn drop(&mut self) {
        *self.is_listening.write() = false;
    }
}
