//! Status and reading updates published by the driver.

use tokio::sync::broadcast;

use crate::ble::adapter::AdapterState;
use crate::protocol::Reading;
use crate::session::ConnectionState;

/// Human-readable connection status trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The adapter powered on and scanning started.
    PoweredOn,
    /// A matching peripheral was found.
    DeviceFound,
    /// The peripheral connected.
    Connected,
    /// The reading characteristic was found and notifications requested.
    CharacteristicOk,
    /// The link dropped and scanning restarted.
    RestartScan,
    /// The adapter is not usable.
    AdapterUnavailable(AdapterState),
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoweredOn => write!(f, "Powered on"),
            Self::DeviceFound => write!(f, "Device found"),
            Self::Connected => write!(f, "Connected"),
            Self::CharacteristicOk => write!(f, "Characteristic OK"),
            Self::RestartScan => write!(f, "Restart Scan"),
            Self::AdapterUnavailable(state) => write!(f, "Bluetooth status: {}", state),
        }
    }
}

/// Update emitted to driver subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverUpdate {
    /// New status text.
    Status(Status),
    /// New accepted reading.
    Reading(Reading),
    /// The session moved to a new state.
    State(ConnectionState),
}

/// Receiver of status and reading updates.
///
/// The state machine calls into the sink but keeps no state in it.
#[cfg_attr(test, mockall::automock)]
pub trait StatusSink {
    /// Report a status transition.
    fn status(&self, status: Status);

    /// Publish an accepted reading.
    fn reading(&self, reading: &Reading);

    /// Report a session state change.
    fn state_changed(&self, _state: ConnectionState) {}
}

impl StatusSink for broadcast::Sender<DriverUpdate> {
    fn status(&self, status: Status) {
        // No subscribers is fine.
        let _ = self.send(DriverUpdate::Status(status));
    }

    fn reading(&self, reading: &Reading) {
        let _ = self.send(DriverUpdate::Reading(reading.clone()));
    }

    fn state_changed(&self, state: ConnectionState) {
        let _ = self.send(DriverUpdate::State(state));
    }
}
