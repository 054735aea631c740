//! [`Transport`] over a btleplug GATT connection.

use async_trait::async_trait;
use btleplug::api::Characteristic;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::characteristics::CharacteristicHandler;
use crate::ble::connection::ConnectionManager;
use crate::ble::scanner::{BleScanner, DEFAULT_SCAN_TIMEOUT};
use crate::ble::uuids::write_characteristic_for;
use crate::error::{Error, Result};
use crate::transport::{NotificationSink, Transport};

struct Link {
    connection: Arc<ConnectionManager>,
    characteristics: CharacteristicHandler,
    notify: Characteristic,
    write: Characteristic,
    watcher: Option<JoinHandle<()>>,
}

/// Bluetooth LE link to an ELM327 adapter.
///
/// Commands are written without response by default, which is what most
/// clones expect.
///
/// The registered [`NotificationSink`] is handed to the link's listener on
/// connect and dropped when the link goes down, so the reader behind it
/// sees the queue close. Writes after a drop fail with
/// [`Error::ConnectionLost`].
pub struct BleTransport {
    scan_timeout: Duration,
    connect_attempts: u32,
    retry_delay: Duration,
    write_with_response: bool,
    sink: Mutex<Option<NotificationSink>>,
    link: RwLock<Option<Arc<Link>>>,
}

impl BleTransport {
    /// Create a transport with default scan and connect settings.
    pub fn new() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connect_attempts: 3,
            retry_delay: Duration::from_secs(1),
            write_with_response: false,
            sink: Mutex::new(None),
            link: RwLock::new(None),
        }
    }

    /// Set how long to scan for the adapter.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the GATT connect retries.
    pub fn with_connect_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    /// Use acknowledged writes.
    pub fn with_write_response(mut self, with_response: bool) -> Self {
        self.write_with_response = with_response;
        self
    }

    /// Whether a GATT link is up.
    pub fn is_connected(&self) -> bool {
        self.link
            .read()
            .as_ref()
            .map(|link| link.connection.is_connected())
            .unwrap_or(false)
    }

    fn current_link(&self) -> Result<Arc<Link>> {
        self.link.read().clone().ok_or(Error::NotConnected)
    }

    async fn open(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        sink: NotificationSink,
    ) -> Result<Link> {
        let scanner = BleScanner::new().await?;
        let peripheral = scanner
            .find_peripheral(address, self.scan_timeout)
            .await?;

        let mut connection = ConnectionManager::new(peripheral.clone());
        connection.set_reconnect_params(self.connect_attempts, self.retry_delay);
        let connection = Arc::new(connection);
        connection.connect().await?;

        let characteristics = CharacteristicHandler::new(peripheral);
        characteristics.discover_characteristics();

        let resolved = characteristics
            .get_characteristic(&service, &characteristic)
            .and_then(|notify| {
                let write = characteristics
                    .get_characteristic(&service, &write_characteristic_for(characteristic))?;
                Ok((notify, write))
            });

        let (notify, write) = match resolved {
            Ok(pair) => pair,
            Err(e) => {
                let _ = connection.disconnect().await;
                return Err(e);
            }
        };

        characteristics.subscribe(&notify).await?;
        characteristics
            .start_notifications(notify.uuid, sink, Arc::clone(&connection))
            .await?;

        let watcher = match connection.watch_adapter(scanner.adapter()).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Adapter disconnect events unavailable: {}", e);
                None
            }
        };

        Ok(Link {
            connection,
            characteristics,
            notify,
            write,
            watcher,
        })
    }
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self, address: &str, service: Uuid, characteristic: Uuid) -> Result<()> {
        if self.link.read().is_some() {
            debug!("Replacing existing link");
            self.disconnect().await?;
        }

        let sink = self.sink.lock().take().ok_or_else(|| {
            Error::Internal("no notification sink registered before connect".to_string())
        })?;

        let link = self.open(address, service, characteristic, sink).await?;
        info!(
            "Link to {} ready (notify {}, write {})",
            address, link.notify.uuid, link.write.uuid
        );
        *self.link.write() = Some(Arc::new(link));
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let link = self.current_link()?;
        if !link.connection.is_connected() {
            return Err(Error::ConnectionLost);
        }

        let result = link
            .characteristics
            .write(&link.write, bytes, self.write_with_response)
            .await;

        if let Err(e) = &result {
            warn!("Write failed, marking link down: {}", e);
            link.connection.mark_disconnected();
        }
        result
    }

    fn on_notification(&self, sink: NotificationSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn disconnect(&self) -> Result<()> {
        let link = self.link.write().take();
        let Some(link) = link else {
            return Ok(());
        };

        if let Some(watcher) = &link.watcher {
            watcher.abort();
        }
        link.characteristics.stop_notifications().await;
        if let Err(e) = link.characteristics.unsubscribe(&link.notify).await {
            debug!("Unsubscribe failed: {}", e);
        }
        link.connection.disconnect().await
    }
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("connected", &self.is_connected())
            .field("write_with_response", &self.write_with_response)
            .finish()
    }
}
