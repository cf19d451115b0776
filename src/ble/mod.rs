//! BLE communication module.
//!
//! This module provides the capability surface the connection state machine
//! drives, the identity matching for JATEMP thermometers, and the btleplug
//! implementation used on real hardware.

pub mod adapter;
pub mod filter;
pub mod platform;
pub mod uuids;

pub use adapter::{
    AdapterEvent, AdapterState, BleAdapter, CharacteristicHandle, PeripheralHandle, ServiceHandle,
};
pub use filter::DeviceFilter;
pub use platform::BtleplugAdapter;
pub use uuids::*;
