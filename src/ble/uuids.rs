//! BLE Service and Characteristic UUIDs.
//!
//! Contains the identity of the one peripheral/characteristic pair this
//! driver targets. These values are fixed by the thermometer firmware.

use std::borrow::Cow;
use uuid::Uuid;

/// JATEMP thermometer service UUID, also used as the scan filter.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x569a_1101_b87f_490c_92cb_11ba5ea5167c);

/// JATEMP reading characteristic UUID (Read, Notify).
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x569a_2000_b87f_490c_92cb_11ba5ea5167c);

/// Substring the advertised local name must contain.
pub const DEVICE_NAME_MARKER: &str = "JATEMP";

/// Substring a decoded payload must contain to be accepted as a reading.
pub const READING_MARKER: &str = "PW";

/// Identity of the targeted peripheral and characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    /// Service UUID, used both for scanning and for service discovery.
    pub service_uuid: Uuid,
    /// UUID of the notifying characteristic.
    pub characteristic_uuid: Uuid,
    /// Substring the advertised name must contain.
    pub name_marker: Cow<'static, str>,
}

impl DeviceIdentity {
    /// The JATEMP thermometer identity.
    pub const JATEMP: DeviceIdentity = DeviceIdentity {
        service_uuid: SERVICE_UUID,
        characteristic_uuid: CHARACTERISTIC_UUID,
        name_marker: Cow::Borrowed(DEVICE_NAME_MARKER),
    };
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::JATEMP
    }
}
