//! Advertisement and GATT identity matching.

use uuid::Uuid;

use crate::ble::uuids::DeviceIdentity;

/// Pure predicates deciding which peripheral, service and characteristic
/// belong to the targeted thermometer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    identity: DeviceIdentity,
}

impl DeviceFilter {
    /// Create a filter for the given identity.
    pub fn new(identity: DeviceIdentity) -> Self {
        Self { identity }
    }

    /// The identity this filter matches against.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// True iff an advertised name is present and contains the name marker.
    pub fn matches_advertisement(&self, name: Option<&str>) -> bool {
        name.map_or(false, |n| n.contains(self.identity.name_marker.as_ref()))
    }

    /// True iff `uuid` is the target service.
    pub fn matches_service(&self, uuid: &Uuid) -> bool {
        *uuid == self.identity.service_uuid
    }

    /// True iff `uuid` is the target characteristic.
    pub fn matches_characteristic(&self, uuid: &Uuid) -> bool {
        *uuid == self.identity.characteristic_uuid
    }
}
