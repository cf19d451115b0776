//! Driver configuration.

use std::time::Duration;

use crate::ble::uuids::DeviceIdentity;

/// Configuration for a [`Driver`](crate::Driver).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriverConfig {
    /// Peripheral and characteristic to target.
    pub identity: DeviceIdentity,
    /// Deadline for getting from a chosen peripheral to a subscribed
    /// characteristic. `None` waits forever.
    pub discovery_timeout: Option<Duration>,
    /// Capacity of the update broadcast channel.
    pub update_capacity: usize,
}

impl DriverConfig {
    /// Default update channel capacity.
    pub const DEFAULT_UPDATE_CAPACITY: usize = 64;

    /// Replace the targeted identity.
    pub fn with_identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Abort a stalled connection attempt after `timeout` and rescan.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = Some(timeout);
        self
    }

    /// Set the update channel capacity (minimum 1).
    pub fn with_update_capacity(mut self, capacity: usize) -> Self {
        self.update_capacity = capacity.max(1);
        self
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            identity: DeviceIdentity::default(),
            discovery_timeout: None,
            update_capacity: Self::DEFAULT_UPDATE_CAPACITY,
        }
    }
}
