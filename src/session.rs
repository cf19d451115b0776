//! Connection session state.
//!
//! A [`ConnectionSession`] is created once when the driver starts and lives
//! for the rest of the process. It is mutated only by the connection state
//! machine; everyone else sees cloned snapshots.

use crate::ble::adapter::{CharacteristicHandle, PeripheralHandle};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Waiting for the adapter to power on.
    #[default]
    Idle,
    /// Scanning for an advertising thermometer.
    Scanning,
    /// Connecting to the chosen peripheral.
    Connecting,
    /// Waiting for service discovery.
    DiscoveringServices,
    /// Waiting for characteristic discovery.
    DiscoveringCharacteristics,
    /// Notifications enabled on the reading characteristic.
    Subscribed,
    /// The adapter went away while a session was active.
    Disconnected,
}

impl ConnectionState {
    /// Check if a peripheral is (or is being) held by the session.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
                | Self::Subscribed
        )
    }

    /// Check if the session is between picking a peripheral and subscribing.
    pub fn is_discovering(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::DiscoveringCharacteristics
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::DiscoveringCharacteristics => write!(f, "Discovering characteristics"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// The single connection session owned by the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSession {
    pub(crate) state: ConnectionState,
    pub(crate) peripheral: Option<PeripheralHandle>,
    pub(crate) target_characteristic: Option<CharacteristicHandle>,
}

impl ConnectionSession {
    /// Create a fresh session in [`ConnectionState::Idle`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The targeted peripheral, once one has been picked.
    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.peripheral.as_ref()
    }

    /// The subscribed reading characteristic, once found.
    pub fn target_characteristic(&self) -> Option<&CharacteristicHandle> {
        self.target_characteristic.as_ref()
    }

    /// Drop both handles.
    pub(crate) fn clear_handles(&mut self) {
        self.peripheral = None;
        self.target_characteristic = None;
    }
}
