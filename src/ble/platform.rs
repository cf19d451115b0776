//! btleplug-backed [`BleAdapter`].
//!
//! Every command spawns a tokio task that performs the btleplug call and
//! reports the outcome on the event channel. Central events (discovery,
//! connection, power state) are pumped into the same channel.

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::{
    AdapterEvent, AdapterState, BleAdapter, CharacteristicHandle, PeripheralHandle, ServiceHandle,
};
use crate::error::{Error, Result};

type PeripheralMap = Arc<RwLock<HashMap<String, Peripheral>>>;
type TaskMap = Arc<RwLock<HashMap<String, JoinHandle<()>>>>;

/// [`BleAdapter`] implementation over the platform Bluetooth stack.
pub struct BtleplugAdapter {
    /// The BLE adapter in use.
    adapter: Adapter,
    /// Peripherals seen while scanning, by identifier.
    peripherals: PeripheralMap,
    /// Notification listener per peripheral.
    notification_tasks: TaskMap,
    /// Sink for adapter events.
    event_tx: mpsc::UnboundedSender<AdapterEvent>,
    /// Command tasks that may still be running.
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Central event pump.
    pump_handle: JoinHandle<()>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter on this system.
    ///
    /// Returns the adapter and the receiving end of its event channel.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<AdapterEvent>)> {
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

        Self::with_adapter(adapter).await
    }

    /// Wrap a specific btleplug adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter's event stream cannot be opened.
    pub async fn with_adapter(
        adapter: Adapter,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AdapterEvent>)> {
        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let peripherals: PeripheralMap = Arc::new(RwLock::new(HashMap::new()));
        let notification_tasks: TaskMap = Arc::new(RwLock::new(HashMap::new()));

        let pump_handle = {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            let notification_tasks = notification_tasks.clone();
            let event_tx = event_tx.clone();

            tokio::spawn(async move {
                let initial = match adapter.adapter_state().await {
                    Ok(state) => adapter_state_from(state),
                    Err(e) => {
                        // Later StateUpdate events still correct this.
                        warn!("Failed to query adapter state: {}", e);
                        AdapterState::PoweredOn
                    }
                };
                debug!("Initial adapter state: {}", initial);
                let _ = event_tx.send(AdapterEvent::AdapterStateChanged(initial));

                while let Some(event) = events.next().await {
                    Self::handle_central_event(
                        event,
                        &adapter,
                        &peripherals,
                        &notification_tasks,
                        &event_tx,
                    )
                    .await;
                }

                debug!("Central event stream ended");
            })
        };

        Ok((
            Self {
                adapter,
                peripherals,
                notification_tasks,
                event_tx,
                in_flight: Arc::new(Mutex::new(Vec::new())),
                pump_handle,
            },
            event_rx,
        ))
    }

    async fn handle_central_event(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &PeripheralMap,
        notification_tasks: &TaskMap,
        event_tx: &mpsc::UnboundedSender<AdapterEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                Self::process_peripheral(adapter, id, peripherals, event_tx).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
                let _ = event_tx.send(AdapterEvent::Connected(handle_for(&id)));
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let handle = handle_for(&id);
                if let Some(task) = notification_tasks.write().remove(handle.identifier()) {
                    task.abort();
                }
                let _ = event_tx.send(AdapterEvent::Disconnected {
                    peripheral: handle,
                    error: None,
                });
            }
            CentralEvent::StateUpdate(state) => {
                let _ = event_tx.send(AdapterEvent::AdapterStateChanged(adapter_state_from(state)));
            }
            _ => {}
        }
    }

    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &PeripheralMap,
        event_tx: &mpsc::UnboundedSender<AdapterEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        };

        let handle = handle_for(&id);
        peripherals
            .write()
            .insert(handle.identifier().to_string(), peripheral);

        let _ = event_tx.send(AdapterEvent::PeripheralDiscovered {
            peripheral: handle,
            name,
        });
    }

    fn peripheral(&self, handle: &PeripheralHandle) -> Option<Peripheral> {
        self.peripherals.read().get(handle.identifier()).cloned()
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|task| !task.is_finished());
        in_flight.push(handle);
    }

    fn send(&self, event: AdapterEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    /// Start the notification listener for a peripheral if not already running.
    fn ensure_notification_listener(&self, peripheral: &Peripheral, handle: &PeripheralHandle) {
        let mut tasks = self.notification_tasks.write();
        if tasks
            .get(handle.identifier())
            .map_or(false, |task| !task.is_finished())
        {
            return;
        }

        let peripheral = peripheral.clone();
        let owner = handle.clone();
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );

                let service_uuid = peripheral
                    .characteristics()
                    .iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid)
                    .unwrap_or_default();

                let event = AdapterEvent::ValueUpdated {
                    characteristic: CharacteristicHandle {
                        peripheral: owner.clone(),
                        service_uuid,
                        uuid: notification.uuid,
                    },
                    value: Some(Bytes::from(notification.value)),
                    error: None,
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }

            debug!("Notification listener stopped");
        });

        tasks.insert(handle.identifier().to_string(), task);
    }
}

impl BleAdapter for BtleplugAdapter {
    fn start_scan(&self, services: &[Uuid]) {
        let adapter = self.adapter.clone();
        let filter = ScanFilter {
            services: services.to_vec(),
        };

        self.spawn(async move {
            info!("Starting BLE scan");
            if let Err(e) = adapter.start_scan(filter).await {
                error!("Failed to start scan: {}", e);
            }
        });
    }

    fn stop_scan(&self) {
        let adapter = self.adapter.clone();

        self.spawn(async move {
            info!("Stopping BLE scan");
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
    }

    fn connect(&self, handle: &PeripheralHandle) {
        let Some(peripheral) = self.peripheral(handle) else {
            self.send(AdapterEvent::Disconnected {
                peripheral: handle.clone(),
                error: Some(
                    Error::PeripheralNotFound {
                        identifier: handle.to_string(),
                    }
                    .to_string(),
                ),
            });
            return;
        };

        let handle = handle.clone();
        let event_tx = self.event_tx.clone();

        self.spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => AdapterEvent::Connected(handle),
                Err(e) => {
                    warn!("Connection to {} failed: {}", handle, e);
                    AdapterEvent::Disconnected {
                        peripheral: handle,
                        error: Some(e.to_string()),
                    }
                }
            };
            let _ = event_tx.send(event);
        });
    }

    fn disconnect(&self, handle: &PeripheralHandle) {
        if let Some(task) = self.notification_tasks.write().remove(handle.identifier()) {
            task.abort();
        }

        let peripheral = self.peripheral(handle);
        let handle = handle.clone();
        let event_tx = self.event_tx.clone();

        self.spawn(async move {
            let (was_connected, result) = match peripheral {
                Some(peripheral) => {
                    let was_connected = peripheral.is_connected().await.unwrap_or(false);
                    let result = peripheral.disconnect().await.map_err(|e| e.to_string());
                    (was_connected, result)
                }
                None => (false, Ok(())),
            };
            if let Err(e) = &result {
                warn!("Disconnect from {} failed: {}", handle, e);
            }
            if let Some(event) = disconnect_event(handle, was_connected, result) {
                let _ = event_tx.send(event);
            }
        });
    }

    fn discover_services(&self, handle: &PeripheralHandle, services: &[Uuid]) {
        let Some(peripheral) = self.peripheral(handle) else {
            self.send(AdapterEvent::ServicesDiscovered {
                peripheral: handle.clone(),
                services: Vec::new(),
                error: Some(
                    Error::PeripheralNotFound {
                        identifier: handle.to_string(),
                    }
                    .to_string(),
                ),
            });
            return;
        };

        let handle = handle.clone();
        let wanted = services.to_vec();
        let event_tx = self.event_tx.clone();

        self.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral
                        .services()
                        .into_iter()
                        .filter(|s| wanted.is_empty() || wanted.contains(&s.uuid))
                        .map(|s| ServiceHandle {
                            peripheral: handle.clone(),
                            uuid: s.uuid,
                        })
                        .collect();
                    AdapterEvent::ServicesDiscovered {
                        peripheral: handle,
                        services,
                        error: None,
                    }
                }
                Err(e) => AdapterEvent::ServicesDiscovered {
                    peripheral: handle,
                    services: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            let _ = event_tx.send(event);
        });
    }

    fn discover_characteristics(&self, service: &ServiceHandle) {
        // btleplug resolves characteristics together with services.
        let found = self.peripheral(&service.peripheral).and_then(|p| {
            p.services()
                .into_iter()
                .find(|s| s.uuid == service.uuid)
        });

        let event = match found {
            Some(gatt_service) => AdapterEvent::CharacteristicsDiscovered {
                service: service.clone(),
                characteristics: gatt_service
                    .characteristics
                    .iter()
                    .map(|c| CharacteristicHandle {
                        peripheral: service.peripheral.clone(),
                        service_uuid: c.service_uuid,
                        uuid: c.uuid,
                    })
                    .collect(),
                error: None,
            },
            None => AdapterEvent::CharacteristicsDiscovered {
                service: service.clone(),
                characteristics: Vec::new(),
                error: Some(format!("Service not found: {}", service.uuid)),
            },
        };

        self.send(event);
    }

    fn read_value(&self, handle: &CharacteristicHandle) {
        let found = self
            .peripheral(&handle.peripheral)
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: handle.peripheral.to_string(),
            })
            .and_then(|p| find_characteristic(&p, handle).map(|c| (p, c)));

        let handle = handle.clone();
        let event_tx = self.event_tx.clone();

        self.spawn(async move {
            let result = match found {
                Ok((peripheral, characteristic)) => peripheral
                    .read(&characteristic)
                    .await
                    .map_err(Error::Bluetooth),
                Err(e) => Err(e),
            };

            let event = match result {
                Ok(data) => AdapterEvent::ValueUpdated {
                    characteristic: handle,
                    value: Some(Bytes::from(data)),
                    error: None,
                },
                Err(e) => AdapterEvent::ValueUpdated {
                    characteristic: handle,
                    value: None,
                    error: Some(e.to_string()),
                },
            };
            let _ = event_tx.send(event);
        });
    }

    fn set_notify(&self, enabled: bool, handle: &CharacteristicHandle) {
        let Some(peripheral) = self.peripheral(&handle.peripheral) else {
            warn!("Cannot set notify: unknown peripheral {}", handle.peripheral);
            return;
        };
        let characteristic = match find_characteristic(&peripheral, handle) {
            Ok(c) => c,
            Err(e) => {
                warn!("Cannot set notify: {}", e);
                return;
            }
        };

        if enabled {
            self.ensure_notification_listener(&peripheral, &handle.peripheral);
        }

        let uuid = handle.uuid;
        self.spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };

            match result {
                Ok(()) => debug!("Notifications on {} set to {}", uuid, enabled),
                Err(e) => warn!("Failed to set notifications on {}: {}", uuid, e),
            }
        });
    }

    fn drain(&self) -> BoxFuture<'static, ()> {
        let pending: Vec<_> = self.in_flight.lock().drain(..).collect();
        Box::pin(async move {
            for task in pending {
                let _ = task.await;
            }
        })
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        self.pump_handle.abort();
        for (_, task) in self.notification_tasks.write().drain() {
            task.abort();
        }
    }
}

fn adapter_state_from(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

/// Event to report for a finished disconnect command.
///
/// A link that was up is reported by the platform's own
/// `DeviceDisconnected` event, so only failures and never-connected
/// peripherals are reported here.
fn disconnect_event(
    peripheral: PeripheralHandle,
    was_connected: bool,
    result: std::result::Result<(), String>,
) -> Option<AdapterEvent> {
    match result {
        Ok(()) if was_connected => None,
        Ok(()) => Some(AdapterEvent::Disconnected {
            peripheral,
            error: None,
        }),
        Err(error) => Some(AdapterEvent::Disconnected {
            peripheral,
            error: Some(error),
        }),
    }
}

fn handle_for(id: &PeripheralId) -> PeripheralHandle {
    PeripheralHandle::new(id.to_string())
}

fn find_characteristic(
    peripheral: &Peripheral,
    handle: &CharacteristicHandle,
) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service_uuid)
        .ok_or_else(|| Error::CharacteristicNotFound {
            uuid: handle.uuid.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_central_state_mapping() {
        assert_eq!(adapter_state_from(CentralState::PoweredOn), AdapterState::PoweredOn);
        assert_eq!(adapter_state_from(CentralState::PoweredOff), AdapterState::PoweredOff);
        assert_eq!(adapter_state_from(CentralState::Unknown), AdapterState::Unknown);
    }

    #[test]
    fn test_disconnect_of_live_link_left_to_platform_event() {
        let handle = PeripheralHandle::new("dev-1");
        assert_eq!(disconnect_event(handle, true, Ok(())), None);
    }

    #[test]
    fn test_disconnect_of_idle_link_is_reported() {
        let handle = PeripheralHandle::new("dev-1");
        assert_eq!(
            disconnect_event(handle.clone(), false, Ok(())),
            Some(AdapterEvent::Disconnected {
                peripheral: handle,
                error: None,
            })
        );
    }

    #[test]
    fn test_failed_disconnect_is_reported() {
        let handle = PeripheralHandle::new("dev-1");
        assert_eq!(
            disconnect_event(handle.clone(), true, Err("not connected".to_string())),
            Some(AdapterEvent::Disconnected {
                peripheral: handle,
                error: Some("not connected".to_string()),
            })
        );
    }
}
