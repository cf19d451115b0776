//! Connection state machine.
//!
//! Turns the stream of [`AdapterEvent`]s into adapter commands, status
//! updates and the current reading. The cycle is
//! scan → connect → discover services → discover characteristics →
//! subscribe → receive notifications, and any disconnect goes back to
//! scanning.
//!
//! Adapter errors reported during discovery are logged and swallowed; the
//! session stays where it is until a disconnect (or the optional discovery
//! timeout driven by [`Driver`](crate::Driver)) moves it on.

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::ble::adapter::{
    AdapterEvent, AdapterState, BleAdapter, CharacteristicHandle, PeripheralHandle, ServiceHandle,
};
use crate::ble::filter::DeviceFilter;
use crate::protocol::{PayloadDecoder, Reading};
use crate::session::{ConnectionSession, ConnectionState};
use crate::status::{Status, StatusSink};

/// Single-owner state machine driving one thermometer connection.
pub struct ConnectionStateMachine<A, S> {
    adapter: A,
    sink: S,
    filter: DeviceFilter,
    session: ConnectionSession,
    current_reading: Option<Reading>,
}

impl<A: BleAdapter, S: StatusSink> ConnectionStateMachine<A, S> {
    /// Create a state machine in [`ConnectionState::Idle`].
    pub fn new(adapter: A, sink: S, filter: DeviceFilter) -> Self {
        Self {
            adapter,
            sink,
            filter,
            session: ConnectionSession::new(),
            current_reading: None,
        }
    }

    /// The session owned by this machine.
    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Last accepted reading, if any.
    pub fn current_reading(&self) -> Option<&Reading> {
        self.current_reading.as_ref()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Process one adapter event.
    pub fn handle_event(&mut self, event: AdapterEvent) {
        trace!("Handling {:?} in state {}", event, self.state());

        match event {
            AdapterEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            AdapterEvent::PeripheralDiscovered { peripheral, name } => {
                self.on_peripheral_discovered(peripheral, name)
            }
            AdapterEvent::Connected(peripheral) => self.on_connected(peripheral),
            AdapterEvent::Disconnected { peripheral, error } => {
                self.on_disconnected(peripheral, error)
            }
            AdapterEvent::ServicesDiscovered {
                peripheral,
                services,
                error,
            } => self.on_services_discovered(peripheral, services, error),
            AdapterEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                error,
            } => self.on_characteristics_discovered(service, characteristics, error),
            AdapterEvent::ValueUpdated {
                characteristic,
                value,
                error,
            } => self.on_value_updated(characteristic, value, error),
        }
    }

    /// Give up on a connection attempt that has not reached `Subscribed`.
    ///
    /// Issues a disconnect for the held peripheral; the resulting
    /// `Disconnected` event restarts the scan. Does nothing outside the
    /// discovery states.
    pub fn handle_discovery_timeout(&mut self) {
        let state = self.state();
        if !state.is_discovering() {
            return;
        }

        match self.session.peripheral.clone() {
            Some(peripheral) => {
                warn!(
                    "Timed out in state {} for {}, disconnecting",
                    state, peripheral
                );
                self.adapter.disconnect(&peripheral);
            }
            None => {
                warn!("Timed out in state {} without a peripheral", state);
                self.restart_scan();
            }
        }
    }

    /// Release the held peripheral (or the running scan) and return to `Idle`.
    pub fn shutdown(&mut self) {
        match self.state() {
            ConnectionState::Scanning => self.adapter.stop_scan(),
            state if state.is_connected() => {
                if let Some(characteristic) = self.session.target_characteristic.as_ref() {
                    self.adapter.set_notify(false, characteristic);
                }
                if let Some(peripheral) = self.session.peripheral.as_ref() {
                    info!("Disconnecting from {}", peripheral);
                    self.adapter.disconnect(peripheral);
                }
            }
            _ => {}
        }

        self.session.clear_handles();
        self.set_state(ConnectionState::Idle);
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        if state.is_powered_on() {
            // A scan requested before the radio was ready may never have started.
            if !matches!(
                self.state(),
                ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Scanning
            ) {
                debug!("Adapter powered on while {}, ignoring", self.state());
                return;
            }

            info!("Bluetooth status: {}", state);
            self.sink.status(Status::PoweredOn);
            self.adapter
                .start_scan(&[self.filter.identity().service_uuid]);
            self.set_state(ConnectionState::Scanning);
            return;
        }

        info!("Bluetooth status: {}", state);
        self.sink.status(Status::AdapterUnavailable(state));

        if !matches!(
            self.state(),
            ConnectionState::Idle | ConnectionState::Disconnected
        ) {
            self.session.clear_handles();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn on_peripheral_discovered(&mut self, peripheral: PeripheralHandle, name: Option<String>) {
        if self.state() != ConnectionState::Scanning {
            trace!("Discovered {} while {}, ignoring", peripheral, self.state());
            return;
        }

        if !self.filter.matches_advertisement(name.as_deref()) {
            if let Some(name) = name {
                debug!("Device: {}", name);
            }
            return;
        }

        info!(
            "Found device: {} ({})",
            name.as_deref().unwrap_or_default(),
            peripheral
        );
        self.sink.status(Status::DeviceFound);
        self.adapter.stop_scan();
        self.adapter.connect(&peripheral);
        self.session.peripheral = Some(peripheral);
        self.set_state(ConnectionState::Connecting);
    }

    fn on_connected(&mut self, peripheral: PeripheralHandle) {
        if self.state() != ConnectionState::Connecting || !self.is_target(&peripheral) {
            debug!("Unexpected connection from {}, ignoring", peripheral);
            return;
        }

        info!("Connected to {}", peripheral);
        self.sink.status(Status::Connected);
        self.adapter
            .discover_services(&peripheral, &[self.filter.identity().service_uuid]);
        self.set_state(ConnectionState::DiscoveringServices);
    }

    fn on_services_discovered(
        &mut self,
        peripheral: PeripheralHandle,
        services: Vec<ServiceHandle>,
        error: Option<String>,
    ) {
        if self.state() != ConnectionState::DiscoveringServices || !self.is_target(&peripheral) {
            debug!("Services discovered for {} while {}, ignoring", peripheral, self.state());
            return;
        }

        if let Some(error) = error {
            warn!("Service discovery failed on {}: {}", peripheral, error);
            return;
        }

        let mut found = false;
        for service in services
            .iter()
            .filter(|s| self.filter.matches_service(&s.uuid))
        {
            debug!("Found service: {}", service.uuid);
            self.adapter.discover_characteristics(service);
            found = true;
        }

        if found {
            self.set_state(ConnectionState::DiscoveringCharacteristics);
        } else {
            warn!(
                "Service {} not found on {}",
                self.filter.identity().service_uuid,
                peripheral
            );
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        service: ServiceHandle,
        characteristics: Vec<CharacteristicHandle>,
        error: Option<String>,
    ) {
        if !matches!(
            self.state(),
            ConnectionState::DiscoveringCharacteristics | ConnectionState::Subscribed
        ) || !self.is_target(&service.peripheral)
        {
            debug!(
                "Characteristics discovered for {} while {}, ignoring",
                service.uuid,
                self.state()
            );
            return;
        }

        if let Some(error) = error {
            warn!(
                "Characteristic discovery failed on service {}: {}",
                service.uuid, error
            );
            return;
        }

        let mut found = false;
        for characteristic in characteristics {
            self.adapter.read_value(&characteristic);

            // With duplicates, the last matching characteristic wins.
            if self.filter.matches_characteristic(&characteristic.uuid) {
                info!("Characteristic OK: {}", characteristic.uuid);
                self.sink.status(Status::CharacteristicOk);
                self.adapter.set_notify(true, &characteristic);
                self.session.target_characteristic = Some(characteristic);
                found = true;
            } else {
                debug!("Found characteristic: {}", characteristic.uuid);
            }
        }

        if found {
            self.set_state(ConnectionState::Subscribed);
        } else if self.state() == ConnectionState::DiscoveringCharacteristics {
            warn!(
                "Characteristic {} not found on service {}",
                self.filter.identity().characteristic_uuid,
                service.uuid
            );
        }
    }

    fn on_value_updated(
        &mut self,
        characteristic: CharacteristicHandle,
        value: Option<Bytes>,
        error: Option<String>,
    ) {
        if self.state() != ConnectionState::Subscribed || !self.is_target(&characteristic.peripheral)
        {
            trace!("Value for {} while {}, ignoring", characteristic.uuid, self.state());
            return;
        }

        if let Some(error) = error {
            warn!("Value update failed on {}: {}", characteristic.uuid, error);
            return;
        }

        let Some(value) = value else {
            debug!("Empty value update on {}", characteristic.uuid);
            return;
        };

        trace!("Value from {}: {:02X?}", characteristic.uuid, &value[..]);

        let reading = match PayloadDecoder::decode(&value) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Dropping notification from {}: {}", characteristic.uuid, e);
                return;
            }
        };

        debug!("Characteristic value: {}", reading.raw_text);

        if self.filter.matches_characteristic(&characteristic.uuid) && reading.accepted {
            self.sink.reading(&reading);
            self.current_reading = Some(reading);
        }
    }

    fn on_disconnected(&mut self, peripheral: PeripheralHandle, error: Option<String>) {
        if !self.state().is_connected() || !self.is_target(&peripheral) {
            debug!("Disconnect from {} while {}, ignoring", peripheral, self.state());
            return;
        }

        match error {
            Some(error) => warn!("Disconnected from {}: {}", peripheral, error),
            None => info!("Disconnected from {}", peripheral),
        }

        self.restart_scan();
    }

    fn restart_scan(&mut self) {
        info!("Restart Scan");
        self.session.clear_handles();
        self.sink.status(Status::RestartScan);
        self.adapter
            .start_scan(&[self.filter.identity().service_uuid]);
        self.set_state(ConnectionState::Scanning);
    }

    fn is_target(&self, peripheral: &PeripheralHandle) -> bool {
        self.session.peripheral.as_ref() == Some(peripheral)
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        let old_state = self.session.state;
        self.session.state = new_state;

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
            self.sink.state_changed(new_state);
        }
    }
}
