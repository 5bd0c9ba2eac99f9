//! GATT service container.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::characteristics::Characteristic;
use crate::ble::uuids::SENSOR_SERVICE_UUID;
use crate::protocol::CharacteristicKind;

/// Root of the object paths exported by this server.
pub const BASE_PATH: &str = "/org/bluez/healthsensor";

/// An ordered collection of characteristics under one UUID.
///
/// A characteristic's object path is `<service path>/char<N>`, where `N` is
/// its position in the service, so paths stay stable for as long as the
/// owning application is registered.
#[derive(Debug)]
pub struct Service {
    index: usize,
    uuid: Uuid,
    primary: bool,
    path: String,
    characteristics: Vec<Arc<Characteristic>>,
}

impl Service {
    /// Create an empty service.
    pub fn new(index: usize, uuid: Uuid, primary: bool) -> Self {
        Self {
            index,
            uuid,
            primary,
            path: format!("{}/service{}", BASE_PATH, index),
            characteristics: Vec::new(),
        }
    }

    /// The health sensor primary service with heart-rate and oxygen
    /// characteristics, in that order.
    pub fn health_sensor(index: usize, notify_period: Duration) -> Self {
        let mut service = Self::new(index, SENSOR_SERVICE_UUID, true);
        for kind in CharacteristicKind::ALL {
            service.add_characteristic(Characteristic::new(kind).with_notify_period(notify_period));
        }
        service
    }

    /// Append a characteristic and assign its object path.
    pub fn add_characteristic(&mut self, mut characteristic: Characteristic) -> Arc<Characteristic> {
        let path = format!("{}/char{}", self.path, self.characteristics.len());
        characteristic.set_path(path);

        let characteristic = Arc::new(characteristic);
        self.characteristics.push(characteristic.clone());
        characteristic
    }

    /// Characteristics in insertion order.
    pub fn characteristics(&self) -> &[Arc<Characteristic>] {
        &self.characteristics
    }

    /// The characteristic carrying a given kind of reading.
    pub fn characteristic(&self, kind: CharacteristicKind) -> Option<&Arc<Characteristic>> {
        self.characteristics.iter().find(|c| c.kind() == kind)
    }

    /// The characteristic exported at `path`.
    pub fn find_by_path(&self, path: &str) -> Option<&Arc<Characteristic>> {
        self.characteristics.iter().find(|c| c.path() == path)
    }

    /// Stop notifications on every characteristic.
    pub fn stop_notifications(&self) {
        for characteristic in &self.characteristics {
            characteristic.stop_notify();
        }
    }

    /// Position of this service in its application.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Service UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Check if this is a primary service.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Object path.
    pub fn path(&self) -> &str {
        &self.path
    }
}
