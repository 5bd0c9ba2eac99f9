//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! Contains all UUID constants exposed by the health sensor peripheral.

use uuid::Uuid;

// Health Sensor Service (Custom)
/// Health sensor primary service UUID.
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x31c8f278_7301_4dde_b3e3_ea763aa3fdb7);
/// Heart rate characteristic UUID (Read, Notify).
pub const HEART_RATE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xc1850dfb_ecee_4081_ad61_2442c5f5c341);
/// Oxygen saturation characteristic UUID (Read, Notify).
pub const OXYGEN_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x95f75eed_bb38_423c_b67b_e2d3c16e0c3e);

// Standard descriptors
/// Characteristic User Description descriptor (0x2901) on the Bluetooth base UUID.
pub const USER_DESCRIPTION_UUID: Uuid = Uuid::from_u128(0x0000_2901_0000_1000_8000_00805f9b34fb);

/// Check if a service UUID is the health sensor service.
pub fn is_sensor_service(uuid: &Uuid) -> bool {
    *uuid == SENSOR_SERVICE_UUID
}

/// Check if a characteristic UUID belongs to the health sensor service.
pub fn is_sensor_characteristic(uuid: &Uuid) -> bool {
    *uuid == HEART_RATE_CHARACTERISTIC_UUID || *uuid == OXYGEN_CHARACTERISTIC_UUID
}
