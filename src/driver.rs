//! Driver task owning the connection state machine.
//!
//! The driver drains adapter events one at a time in arrival order, so the
//! session is only ever touched by a single task. Consumers observe it
//! through broadcast updates and cloned snapshots.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ble::adapter::{AdapterEvent, BleAdapter};
use crate::ble::filter::DeviceFilter;
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::protocol::Reading;
use crate::session::{ConnectionSession, ConnectionState};
use crate::state_machine::ConnectionStateMachine;
use crate::status::DriverUpdate;

/// Handle to a running driver task.
pub struct Driver {
    /// Update channel.
    updates: broadcast::Sender<DriverUpdate>,
    /// Latest session snapshot.
    session: Arc<RwLock<ConnectionSession>>,
    /// Latest accepted reading.
    current_reading: Arc<RwLock<Option<Reading>>>,
    /// Stop signal for the task.
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// The driver task.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    /// Spawn the driver task.
    ///
    /// `events` must be the event channel belonging to `adapter`. The
    /// session stays `Idle` until the adapter reports that it is powered on.
    pub fn start<A>(
        adapter: A,
        events: mpsc::UnboundedReceiver<AdapterEvent>,
        config: DriverConfig,
    ) -> Self
    where
        A: BleAdapter + Send + 'static,
    {
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let session = Arc::new(RwLock::new(ConnectionSession::new()));
        let current_reading = Arc::new(RwLock::new(None));

        let machine = ConnectionStateMachine::new(
            adapter,
            updates.clone(),
            DeviceFilter::new(config.identity.clone()),
        );

        let task = tokio::spawn(run(
            machine,
            events,
            shutdown_rx,
            config.discovery_timeout,
            session.clone(),
            current_reading.clone(),
        ));

        Self {
            updates,
            session,
            current_reading,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Subscribe to status, state and reading updates.
    pub fn subscribe(&self) -> broadcast::Receiver<DriverUpdate> {
        self.updates.subscribe()
    }

    /// Snapshot of the connection session.
    pub fn session(&self) -> ConnectionSession {
        self.session.read().clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.session.read().state()
    }

    /// Last accepted reading.
    pub fn current_reading(&self) -> Option<Reading> {
        self.current_reading.read().clone()
    }

    /// Check if the driver task is still running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Release the peripheral, stop the task and wait for it to finish.
    ///
    /// Resolves only after the adapter has finished the release commands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the driver task panicked.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down driver");

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let task = self.task.lock().take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| Error::Internal(format!("Driver task failed: {}", e))),
            None => Ok(()),
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run<A>(
    mut machine: ConnectionStateMachine<A, broadcast::Sender<DriverUpdate>>,
    mut events: mpsc::UnboundedReceiver<AdapterEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    discovery_timeout: Option<Duration>,
    session: Arc<RwLock<ConnectionSession>>,
    current_reading: Arc<RwLock<Option<Reading>>>,
) where
    A: BleAdapter,
{
    let mut deadline: Option<Instant> = None;

    loop {
        let previous = machine.state();

        tokio::select! {
            _ = &mut shutdown_rx => {
                machine.shutdown();
                *session.write() = machine.session().clone();
                let pending = machine.adapter().drain();
                pending.await;
                break;
            }
            event = events.recv() => match event {
                Some(event) => machine.handle_event(event),
                None => {
                    debug!("Adapter event channel closed");
                    break;
                }
            },
            _ = sleep_until(deadline) => {
                machine.handle_discovery_timeout();
                // Keep retrying until the disconnect lands.
                deadline = discovery_timeout.map(|d| Instant::now() + d);
            }
        }

        let state = machine.state();
        if state != previous {
            deadline = match discovery_timeout {
                Some(d) if state.is_discovering() => Some(Instant::now() + d),
                _ => None,
            };
        }

        *session.write() = machine.session().clone();
        if let Some(reading) = machine.current_reading() {
            let mut current = current_reading.write();
            if current.as_ref() != Some(reading) {
                *current = Some(reading.clone());
            }
        }
    }

    debug!("Driver task ended");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::{
        AdapterState, CharacteristicHandle, PeripheralHandle, ServiceHandle,
    };
    use crate::ble::uuids::{CHARACTERISTIC_UUID, SERVICE_UUID};
    use crate::status::Status;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Command {
        StartScan(Vec<Uuid>),
        StopScan,
        Connect(PeripheralHandle),
        Disconnect(PeripheralHandle),
        DiscoverServices(PeripheralHandle),
        DiscoverCharacteristics(Uuid),
        ReadValue(Uuid),
        SetNotify(bool, Uuid),
    }

    #[derive(Clone, Default)]
    struct RecordingAdapter {
        commands: Arc<Mutex<Vec<Command>>>,
        /// When set, disconnects complete on a background task after this delay.
        disconnect_delay: Option<Duration>,
        pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
    }

    impl RecordingAdapter {
        fn with_disconnect_delay(delay: Duration) -> Self {
            Self {
                disconnect_delay: Some(delay),
                ..Self::default()
            }
        }

        fn commands(&self) -> Vec<Command> {
            self.commands.lock().clone()
        }

        fn record(&self, command: Command) {
            self.commands.lock().push(command);
        }
    }

    impl BleAdapter for RecordingAdapter {
        fn start_scan(&self, services: &[Uuid]) {
            self.record(Command::StartScan(services.to_vec()));
        }

        fn stop_scan(&self) {
            self.record(Command::StopScan);
        }

        fn connect(&self, peripheral: &PeripheralHandle) {
            self.record(Command::Connect(peripheral.clone()));
        }

        fn disconnect(&self, peripheral: &PeripheralHandle) {
            let command = Command::Disconnect(peripheral.clone());
            match self.disconnect_delay {
                Some(delay) => {
                    let commands = self.commands.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        commands.lock().push(command);
                    });
                    self.pending.lock().push(task);
                }
                None => self.record(command),
            }
        }

        fn discover_services(&self, peripheral: &PeripheralHandle, _services: &[Uuid]) {
            self.record(Command::DiscoverServices(peripheral.clone()));
        }

        fn discover_characteristics(&self, service: &ServiceHandle) {
            self.record(Command::DiscoverCharacteristics(service.uuid));
        }

        fn read_value(&self, characteristic: &CharacteristicHandle) {
            self.record(Command::ReadValue(characteristic.uuid));
        }

        fn set_notify(&self, enabled: bool, characteristic: &CharacteristicHandle) {
            self.record(Command::SetNotify(enabled, characteristic.uuid));
        }

        fn drain(&self) -> BoxFuture<'static, ()> {
            let pending: Vec<_> = self.pending.lock().drain(..).collect();
            Box::pin(async move {
                for task in pending {
                    let _ = task.await;
                }
            })
        }
    }

    fn device() -> PeripheralHandle {
        PeripheralHandle::new("dev-1")
    }

    fn target() -> CharacteristicHandle {
        CharacteristicHandle {
            peripheral: device(),
            service_uuid: SERVICE_UUID,
            uuid: CHARACTERISTIC_UUID,
        }
    }

    async fn wait_for_state(rx: &mut broadcast::Receiver<DriverUpdate>, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(DriverUpdate::State(s)) = rx.recv().await {
                    if s == state {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state));
    }

    async fn wait_for_snapshot(driver: &Driver, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while driver.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("snapshot never reached {}", state));
    }

    async fn next_reading(rx: &mut broadcast::Receiver<DriverUpdate>) -> Reading {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(DriverUpdate::Reading(reading)) = rx.recv().await {
                    return reading;
                }
            }
        })
        .await
        .expect("timed out waiting for reading")
    }

    fn happy_path(tx: &mpsc::UnboundedSender<AdapterEvent>) {
        let events = [
            AdapterEvent::AdapterStateChanged(AdapterState::PoweredOn),
            AdapterEvent::PeripheralDiscovered {
                peripheral: PeripheralHandle::new("other"),
                name: Some("Thermo".to_string()),
            },
            AdapterEvent::PeripheralDiscovered {
                peripheral: device(),
                name: Some("JATEMP-01".to_string()),
            },
            AdapterEvent::Connected(device()),
            AdapterEvent::ServicesDiscovered {
                peripheral: device(),
                services: vec![ServiceHandle {
                    peripheral: device(),
                    uuid: SERVICE_UUID,
                }],
                error: None,
            },
            AdapterEvent::CharacteristicsDiscovered {
                service: ServiceHandle {
                    peripheral: device(),
                    uuid: SERVICE_UUID,
                },
                characteristics: vec![target()],
                error: None,
            },
        ];
        for event in events {
            tx.send(event).unwrap();
        }
    }

    #[tokio::test]
    async fn test_driver_happy_path_and_reading() {
        let adapter = RecordingAdapter::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver::start(adapter.clone(), rx, DriverConfig::default());
        let mut updates = driver.subscribe();

        happy_path(&tx);
        wait_for_state(&mut updates, ConnectionState::Subscribed).await;

        tx.send(AdapterEvent::ValueUpdated {
            characteristic: target(),
            value: Some(Bytes::from_static(b"23.5\r\n")),
            error: None,
        })
        .unwrap();
        tx.send(AdapterEvent::ValueUpdated {
            characteristic: target(),
            value: Some(Bytes::from_static(b"23.5 PW\r\n")),
            error: None,
        })
        .unwrap();

        let reading = next_reading(&mut updates).await;
        assert_eq!(reading.raw_text, "23.5 PW");

        assert_eq!(
            adapter.commands(),
            vec![
                Command::StartScan(vec![SERVICE_UUID]),
                Command::StopScan,
                Command::Connect(device()),
                Command::DiscoverServices(device()),
                Command::DiscoverCharacteristics(SERVICE_UUID),
                Command::ReadValue(CHARACTERISTIC_UUID),
                Command::SetNotify(true, CHARACTERISTIC_UUID),
            ]
        );

        driver.shutdown().await.unwrap();
        assert_eq!(
            driver.current_reading().map(|r| r.raw_text),
            Some("23.5 PW".to_string())
        );
        assert_eq!(driver.state(), ConnectionState::Idle);
        assert!(!driver.is_running());
    }

    #[tokio::test]
    async fn test_driver_rescans_after_disconnect() {
        let adapter = RecordingAdapter::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver::start(adapter.clone(), rx, DriverConfig::default());
        let mut updates = driver.subscribe();

        happy_path(&tx);
        tx.send(AdapterEvent::Disconnected {
            peripheral: device(),
            error: None,
        })
        .unwrap();
        wait_for_state(&mut updates, ConnectionState::Scanning).await;
        wait_for_state(&mut updates, ConnectionState::Subscribed).await;
        wait_for_state(&mut updates, ConnectionState::Scanning).await;
        wait_for_snapshot(&driver, ConnectionState::Scanning).await;

        let session = driver.session();
        assert_eq!(session.state(), ConnectionState::Scanning);
        assert!(session.peripheral().is_none());
        assert!(session.target_characteristic().is_none());
        assert_eq!(
            adapter.commands().last(),
            Some(&Command::StartScan(vec![SERVICE_UUID]))
        );

        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_emits_status_strings() {
        let adapter = RecordingAdapter::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver::start(adapter, rx, DriverConfig::default());
        let mut updates = driver.subscribe();

        happy_path(&tx);
        tx.send(AdapterEvent::Disconnected {
            peripheral: device(),
            error: None,
        })
        .unwrap();

        let trail = tokio::time::timeout(Duration::from_secs(2), async {
            let mut trail = Vec::new();
            while trail.len() < 5 {
                if let Ok(DriverUpdate::Status(status)) = updates.recv().await {
                    trail.push(status.to_string());
                }
            }
            trail
        })
        .await
        .expect("timed out waiting for statuses");

        assert_eq!(
            trail,
            vec![
                "Powered on",
                "Device found",
                "Connected",
                "Characteristic OK",
                "Restart Scan"
            ]
        );

        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_timeout_forces_disconnect() {
        let adapter = RecordingAdapter::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let config = DriverConfig::default().with_discovery_timeout(Duration::from_millis(50));
        let driver = Driver::start(adapter.clone(), rx, config);
        let mut updates = driver.subscribe();

        tx.send(AdapterEvent::AdapterStateChanged(AdapterState::PoweredOn))
            .unwrap();
        tx.send(AdapterEvent::PeripheralDiscovered {
            peripheral: device(),
            name: Some("JATEMP".to_string()),
        })
        .unwrap();
        tx.send(AdapterEvent::Connected(device())).unwrap();
        wait_for_state(&mut updates, ConnectionState::DiscoveringServices).await;

        // The peripheral never answers service discovery.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(adapter
            .commands()
            .contains(&Command::Disconnect(device())));

        tx.send(AdapterEvent::Disconnected {
            peripheral: device(),
            error: None,
        })
        .unwrap();
        wait_for_state(&mut updates, ConnectionState::Scanning).await;

        driver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_timeout_by_default() {
        let adapter = RecordingAdapter::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver::start(adapter.clone(), rx, DriverConfig::default());
        let mut updates = driver.subscribe();

        tx.send(AdapterEvent::AdapterStateChanged(AdapterState::PoweredOn))
            .unwrap();
        tx.send(AdapterEvent::PeripheralDiscovered {
            peripheral: device(),
            name: Some("JATEMP".to_string()),
        })
        .unwrap();
        wait_for_state(&mut updates, ConnectionState::Connecting).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(driver.state(), ConnectionState::Connecting);
        assert!(!adapter
            .commands()
            .iter()
            .any(|c| matches!(c, Command::Disconnect(_))));

        driver.shutdown().await.unwrap();
        assert_eq!(adapter.commands().last(), Some(&Command::Disconnect(device())));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_release_commands() {
        let adapter = RecordingAdapter::with_disconnect_delay(Duration::from_millis(50));
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver::start(adapter.clone(), rx, DriverConfig::default());

        happy_path(&tx);
        wait_for_snapshot(&driver, ConnectionState::Subscribed).await;

        driver.shutdown().await.unwrap();

        let commands = adapter.commands();
        assert_eq!(
            &commands[commands.len() - 2..],
            &[
                Command::SetNotify(false, CHARACTERISTIC_UUID),
                Command::Disconnect(device()),
            ]
        );
        assert_eq!(driver.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_driver_stops_when_events_close() {
        let adapter = RecordingAdapter::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver::start(adapter, rx, DriverConfig::default());

        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), async {
            while driver.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("driver did not stop");

        driver.shutdown().await.unwrap();
    }

    #[test]
    fn test_unavailable_status_does_not_leave_idle() {
        tokio_test::block_on(async {
            let adapter = RecordingAdapter::default();
            let (tx, rx) = mpsc::unbounded_channel();
            let driver = Driver::start(adapter.clone(), rx, DriverConfig::default());
            let mut updates = driver.subscribe();

            tx.send(AdapterEvent::AdapterStateChanged(AdapterState::PoweredOff))
                .unwrap();

            let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
                .await
                .expect("timed out")
                .unwrap();
            assert_eq!(
                update,
                DriverUpdate::Status(Status::AdapterUnavailable(AdapterState::PoweredOff))
            );
            assert_eq!(driver.state(), ConnectionState::Idle);
            assert!(adapter.commands().is_empty());

            driver.shutdown().await.unwrap();
        });
    }
}
