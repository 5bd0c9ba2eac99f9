// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # health-sensor-ble
//!
//! A BLE GATT peripheral that publishes heart rate and blood oxygen
//! readings from a pulse oximeter.
//!
//! The peripheral exposes one primary service with two Read/Notify
//! characteristics. Values are ASCII decimal strings (`b"72"`), and `-1`
//! means the sensor currently has no signal. Subscribed centrals get a
//! notification on every new reading and a periodic re-send every 5 s.
//!
//! ## Features
//!
//! - **GATT server**: characteristics, notify timers, services and a
//!   request event loop that can be stopped from any thread
//! - **Sensor bridge**: polls a [`SensorSource`] and pushes every reading,
//!   no-signal included, to BLE, the shared state file and telemetry
//! - **Independent failure domains**: no BLE adapter only degrades BLE,
//!   the sensor loop keeps running
//! - **Split-process mode**: [`SharedStateRelay`] feeds the
//!   characteristics from the file written by a sensor process
//! - **Backends**: BlueZ through `bluer` (feature `bluez`) or the
//!   in-memory [`LoopbackManager`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use health_sensor_ble::{BridgeConfig, LoopbackManager, Result, SensorBridge, SimulatedSensor};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let bridge = SensorBridge::new(BridgeConfig::default(), Box::new(SimulatedSensor::new()))?
//!         .with_ble_manager(Arc::new(LoopbackManager::new()));
//!
//!     bridge
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### Linux
//! The `bluez` feature requires BlueZ 5.50 or later and permission to
//! register GATT applications on the system bus (root, or a D-Bus policy
//! for the `bluetooth` group).
//!
//! ## Feature Flags
//!
//! - `bluez`: BlueZ backend ([`ble::BluezManager`])

// Public modules
pub mod ble;
pub mod bridge;
pub mod callback;
pub mod config;
pub mod data;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod sensor;
pub mod telemetry;

// Re-exports for convenience
pub use bridge::{BleStatus, BridgeEvent, BridgeState, BridgeStatus, SensorBridge};
pub use callback::CallbackHandle;
pub use config::{BridgeConfig, RelayConfig};
pub use error::{Error, Result};
pub use relay::{RelayOutcome, SharedStateRelay};

// Re-export commonly used types from submodules
pub use ble::{
    Advertisement, BleManager, Characteristic, GattApplication, LoopbackManager, QuitHandle,
    Service,
};
#[cfg(feature = "bluez")]
pub use ble::BluezManager;
pub use data::{Reading, SensorStatus, SharedStateFile, SharedStateRecord};
pub use protocol::{CharacteristicKind, CharacteristicValue, NO_SIGNAL};
pub use sensor::{RawSample, ReplaySensor, SensorSource, SimulatedSensor};
pub use telemetry::{NullSink, TelemetrySink};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<SensorBridge>();
        let _ = std::any::TypeId::of::<SharedStateRelay>();
        let _ = std::any::TypeId::of::<GattApplication>();
        let _ = std::any::TypeId::of::<Characteristic>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<Reading>();
        let _ = std::any::TypeId::of::<SharedStateRecord>();
    }

    #[test]
    fn test_wire_constants() {
        assert_eq!(NO_SIGNAL, -1);
        assert_eq!(
            CharacteristicKind::HeartRate.uuid().to_string(),
            "c1850dfb-ecee-4081-ad61-2442c5f5c341"
        );
    }
}
