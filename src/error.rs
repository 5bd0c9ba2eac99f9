//! Error types for the health-sensor-ble crate.

use thiserror::Error;

use crate::protocol::CharacteristicKind;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the BlueZ bindings.
    #[cfg(feature = "bluez")]
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),

    /// No usable Bluetooth adapter or BLE manager was found.
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Registering a GATT application or advertisement with the platform failed.
    #[error("Registration failed: {reason}")]
    Registration {
        /// Description of why the registration failed.
        reason: String,
    },

    /// The sensor did not respond to `begin()` or could not start collecting.
    #[error("Sensor initialization failed: {reason}")]
    SensorInit {
        /// Description of why the sensor could not be initialized.
        reason: String,
    },

    /// Reading from the sensor failed at the transport level.
    ///
    /// A "no signal" sample (-1) is not an error and never produces this.
    #[error("Sensor read failed: {reason}")]
    SensorRead {
        /// Description of the read failure.
        reason: String,
    },

    /// A characteristic update was outside the declared domain.
    #[error("{kind} value {value} out of range ({min}..={max})")]
    Validation {
        /// The characteristic the value was meant for.
        kind: CharacteristicKind,
        /// The rejected value.
        value: i64,
        /// Lowest accepted value.
        min: i16,
        /// Highest accepted value.
        max: i16,
    },

    /// Invalid bytes were received or read back.
    #[error("Invalid data: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// I/O error, typically on the shared state file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error on the shared state file.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested GATT operation is not permitted on the attribute.
    #[error("Operation not permitted: {operation}")]
    NotPermitted {
        /// Description of the rejected operation.
        operation: String,
    },

    /// No characteristic or descriptor lives at the given object path.
    #[error("Characteristic not found: {path}")]
    CharacteristicNotFound {
        /// The object path that was looked up.
        path: String,
    },

    /// The operation is not valid in the current lifecycle state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The attempted operation.
        operation: String,
        /// The state the component was in.
        state: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// A GATT request was not answered in time.
    #[error("GATT request timeout")]
    Timeout,

    /// The remote telemetry sink rejected a reading.
    #[error("Telemetry push failed: {reason}")]
    Telemetry {
        /// Description of the failure.
        reason: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error means BLE exposure is unavailable.
    ///
    /// These errors degrade the peripheral but never stop sensor acquisition.
    pub fn is_registration_failure(&self) -> bool {
        match self {
            Self::AdapterNotFound | Self::Registration { .. } => true,
            #[cfg(feature = "bluez")]
            Self::Bluetooth(_) => true,
            _ => false,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
