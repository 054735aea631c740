//! BLE scanning functionality.
//!
//! Finds the adapter peripheral by address before connecting.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::ble::uuids::is_adapter_service;
use crate::error::{Error, Result};

/// Default time to scan for a peripheral before giving up.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether a peripheral seen as `address`/`identifier` is the one the
/// caller asked for.
///
/// Compares case-insensitively against both. Identifiers stand in for
/// addresses on macOS.
pub fn matches_address(wanted: &str, address: &str, identifier: &str) -> bool {
    let wanted = wanted.trim();
    !wanted.is_empty()
        && (address.eq_ignore_ascii_case(wanted) || identifier.eq_ignore_ascii_case(wanted))
}

#[derive(Clone)]
struct Sighting {
    address: String,
    identifier: String,
    peripheral: Peripheral,
}

/// BLE scanner for locating adapters.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Peripherals seen so far, by identifier.
    seen: Arc<RwLock<HashMap<String, Sighting>>>,
}

impl BleScanner {
    /// Create a scanner on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a new BLE scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            seen: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Scan until the peripheral at `address` shows up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if nothing matches within
    /// `timeout`.
    pub async fn find_peripheral(&self, address: &str, timeout: Duration) -> Result<Peripheral> {
        if let Some(peripheral) = self.lookup(address) {
            return Ok(peripheral);
        }

        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        info!("Scanning for adapter {}", address);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        // Peripherals the platform already knows about emit no discovery event.
        for peripheral in self.adapter.peripherals().await.map_err(Error::Bluetooth)? {
            self.process_peripheral(peripheral.id()).await;
        }

        let found = tokio::time::timeout(timeout, async {
            loop {
                if let Some(peripheral) = self.lookup(address) {
                    return Some(peripheral);
                }

                match events.next().await {
                    Some(event) => self.handle_event(event).await,
                    None => return None,
                }
            }
        })
        .await;

        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }

        match found {
            Ok(Some(peripheral)) => {
                info!("Found adapter {}", address);
                Ok(peripheral)
            }
            _ => Err(Error::DeviceNotFound {
                address: address.to_string(),
            }),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn lookup(&self, address: &str) -> Option<Peripheral> {
        self.seen
            .read()
            .values()
            .find(|s| matches_address(address, &s.address, &s.identifier))
            .map(|s| s.peripheral.clone())
    }

    /// Handle a BLE central event.
    async fn handle_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) => {
                trace!("Device discovered: {:?}", id);
                self.process_peripheral(id).await;
            }
            CentralEvent::DeviceUpdated(id) => {
                trace!("Device updated: {:?}", id);
                self.process_peripheral(id).await;
            }
            CentralEvent::ServicesAdvertisement { id, services } => {
                if services.iter().any(is_adapter_service) {
                    trace!("Adapter service advertised by {:?}", id);
                    self.process_peripheral(id).await;
                }
            }
            _ => {}
        }
    }

    /// Record a peripheral's address.
    async fn process_peripheral(&self, id: PeripheralId) {
        let peripheral = match self.adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let identifier = id.to_string();
        trace!(
            "Saw {} ({:?}, rssi {:?}, adapter service: {})",
            properties.address,
            properties.local_name,
            properties.rssi,
            properties.services.iter().any(is_adapter_service)
        );

        self.seen.write().insert(
            identifier.clone(),
            Sighting {
                address: properties.address.to_string(),
                identifier,
                peripheral,
            },
        );
    }
}
