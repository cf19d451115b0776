//! The BLE capability surface consumed by the connection state machine.
//!
//! Commands are fire-and-forget: an implementation starts the operation
//! and reports its outcome later as an [`AdapterEvent`]. Events for one
//! adapter must be delivered to the state machine in the order they occur.

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use uuid::Uuid;

/// Opaque reference to a peripheral known to the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    /// Create a handle from the adapter's peripheral identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    /// The adapter's identifier for this peripheral.
    pub fn identifier(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a GATT service on a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    /// Owning peripheral.
    pub peripheral: PeripheralHandle,
    /// Service UUID.
    pub uuid: Uuid,
}

/// Opaque reference to a GATT characteristic on a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Owning peripheral.
    pub peripheral: PeripheralHandle,
    /// UUID of the service the characteristic belongs to.
    pub service_uuid: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

/// Power/availability state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdapterState {
    /// State not yet known.
    #[default]
    Unknown,
    /// The adapter is resetting.
    Resetting,
    /// This platform has no BLE central support.
    Unsupported,
    /// The process is not allowed to use Bluetooth.
    Unauthorized,
    /// Bluetooth is switched off.
    PoweredOff,
    /// Bluetooth is on and ready.
    PoweredOn,
}

impl AdapterState {
    /// Check if the adapter can scan and connect.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "Powered off"),
            Self::PoweredOn => write!(f, "Powered on"),
        }
    }
}

/// Events pushed by an adapter. Each is causally after the command that enabled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The local adapter changed power/availability state.
    AdapterStateChanged(AdapterState),
    /// A peripheral advertising the scanned service was seen.
    PeripheralDiscovered {
        /// The peripheral.
        peripheral: PeripheralHandle,
        /// Advertised local name, if any.
        name: Option<String>,
    },
    /// A connection was established.
    Connected(PeripheralHandle),
    /// A connection was lost, closed, or could not be established.
    Disconnected {
        /// The peripheral.
        peripheral: PeripheralHandle,
        /// Underlying error, if the platform reported one.
        error: Option<String>,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// The peripheral.
        peripheral: PeripheralHandle,
        /// Services found, limited to the requested filter when the platform honours it.
        services: Vec<ServiceHandle>,
        /// Discovery error, if any.
        error: Option<String>,
    },
    /// Characteristic discovery for one service finished.
    CharacteristicsDiscovered {
        /// The service that was inspected.
        service: ServiceHandle,
        /// Characteristics found on the service.
        characteristics: Vec<CharacteristicHandle>,
        /// Discovery error, if any.
        error: Option<String>,
    },
    /// A characteristic value arrived, from a read or a notification.
    ValueUpdated {
        /// The characteristic.
        characteristic: CharacteristicHandle,
        /// The value bytes, if the platform provided any.
        value: Option<Bytes>,
        /// Read/notification error, if any.
        error: Option<String>,
    },
}

/// Commands the connection state machine issues to the Bluetooth stack.
#[cfg_attr(test, mockall::automock)]
pub trait BleAdapter {
    /// Start scanning for peripherals advertising any of `services`.
    fn start_scan(&self, services: &[Uuid]);

    /// Stop an active scan.
    fn stop_scan(&self);

    /// Connect to a peripheral.
    fn connect(&self, peripheral: &PeripheralHandle);

    /// Disconnect from a peripheral.
    fn disconnect(&self, peripheral: &PeripheralHandle);

    /// Discover the services of a connected peripheral, limited to `services`.
    fn discover_services(&self, peripheral: &PeripheralHandle, services: &[Uuid]);

    /// Discover the characteristics of a service.
    fn discover_characteristics(&self, service: &ServiceHandle);

    /// Read a characteristic once.
    fn read_value(&self, characteristic: &CharacteristicHandle);

    /// Enable or disable value-change notifications on a characteristic.
    fn set_notify(&self, enabled: bool, characteristic: &CharacteristicHandle);

    /// Resolves once every command issued so far has reached the stack.
    fn drain(&self) -> BoxFuture<'static, ()> {
        Box::pin(future::ready(()))
    }
}
