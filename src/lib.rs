// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # jatemp-ble
//!
//! A Rust driver for JATEMP Bluetooth Low Energy thermometers.
//!
//! The driver scans for a peripheral advertising the JATEMP service,
//! connects, discovers the reading characteristic, subscribes to its
//! notifications and turns each marked payload into a [`Reading`]. When the
//! link drops it rescans on its own.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jatemp_ble::{DriverUpdate, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let driver = jatemp_ble::connect().await?;
//!     let mut updates = driver.subscribe();
//!
//!     while let Ok(update) = updates.recv().await {
//!         match update {
//!             DriverUpdate::Status(status) => println!("status: {}", status),
//!             DriverUpdate::Reading(reading) => println!("value: {}", reading.raw_text),
//!             DriverUpdate::State(_) => {}
//!         }
//!     }
//!
//!     driver.shutdown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`ConnectionStateMachine`] owns the [`ConnectionSession`] and reacts to
//!   [`AdapterEvent`]s one at a time, issuing [`BleAdapter`] commands.
//! - [`Driver`] runs the state machine on a tokio task and publishes
//!   [`DriverUpdate`]s.
//! - [`BtleplugAdapter`] implements [`BleAdapter`] on the platform stack.
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for config and data types

// Public modules
pub mod ble;
pub mod config;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod session;
pub mod state_machine;
pub mod status;

// Re-exports for convenience
pub use ble::{
    AdapterEvent, AdapterState, BleAdapter, BtleplugAdapter, CharacteristicHandle, DeviceFilter,
    DeviceIdentity, PeripheralHandle, ServiceHandle,
};
pub use config::DriverConfig;
pub use driver::Driver;
pub use error::{DecodeError, Error, Result};
pub use protocol::{PayloadDecoder, Reading};
pub use session::{ConnectionSession, ConnectionState};
pub use state_machine::ConnectionStateMachine;
pub use status::{DriverUpdate, Status, StatusSink};

/// Open the first Bluetooth adapter and start a driver with the default configuration.
///
/// # Errors
///
/// Returns an error if Bluetooth is not available.
pub async fn connect() -> Result<Driver> {
    connect_with_config(DriverConfig::default()).await
}

/// Open the first Bluetooth adapter and start a driver with `config`.
///
/// # Errors
///
/// Returns an error if Bluetooth is not available.
pub async fn connect_with_config(config: DriverConfig) -> Result<Driver> {
    let (adapter, events) = BtleplugAdapter::new().await?;
    Ok(Driver::start(adapter, events, config))
}
