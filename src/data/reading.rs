//! Sensor reading data structures.
//!
//! Contains the reading produced by each sensor poll and the status
//! classification derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{CharacteristicKind, NO_SIGNAL};

/// One heart-rate/SpO2 sample from the sensor.
///
/// A value of -1 in either field means the sensor has no valid signal for
/// it (finger removed, still settling). Such readings are valid states and
/// are propagated like any other.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Heart rate in bpm, or -1.
    pub heart_rate: i32,

    /// Oxygen saturation in percent, or -1.
    pub spo2: i32,

    /// Sensor die temperature, when the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,

    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Create a reading timestamped now.
    pub fn new(heart_rate: i32, spo2: i32) -> Self {
        Self::at(heart_rate, spo2, Utc::now())
    }

    /// Create a reading with an explicit timestamp.
    pub fn at(heart_rate: i32, spo2: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            heart_rate,
            spo2,
            temperature_c: None,
            timestamp,
        }
    }

    /// A reading with no signal on either channel.
    pub fn no_signal() -> Self {
        Self::new(NO_SIGNAL.into(), NO_SIGNAL.into())
    }

    /// Attach a temperature.
    pub fn with_temperature(mut self, celsius: f32) -> Self {
        self.temperature_c = Some(celsius);
        self
    }

    /// The field carried by a characteristic of the given kind.
    pub fn field(&self, kind: CharacteristicKind) -> i32 {
        match kind {
            CharacteristicKind::HeartRate => self.heart_rate,
            CharacteristicKind::Oxygen => self.spo2,
        }
    }

    /// Replace the field carried by a characteristic of the given kind.
    pub fn with_field(mut self, kind: CharacteristicKind, value: i32) -> Self {
        match kind {
            CharacteristicKind::HeartRate => self.heart_rate = value,
            CharacteristicKind::Oxygen => self.spo2 = value,
        }
        self
    }

    /// Check if the heart rate channel has a signal.
    pub fn has_heart_rate(&self) -> bool {
        self.heart_rate != i32::from(NO_SIGNAL)
    }

    /// Check if the SpO2 channel has a signal.
    pub fn has_spo2(&self) -> bool {
        self.spo2 != i32::from(NO_SIGNAL)
    }

    /// Check if neither channel has a signal.
    pub fn is_no_signal(&self) -> bool {
        !self.has_heart_rate() && !self.has_spo2()
    }
}

/// Sensor health as reported by `check_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorStatus {
    /// The sensor never initialized, or has been shut down.
    NotInitialized,
    /// Initialized, but no reading has been taken yet.
    NoReadings,
    /// Connected but both channels report no signal.
    NoSignal,
    /// Heart rate channel reports no signal.
    HeartRateInvalid {
        /// Current SpO2 value.
        spo2: i32,
    },
    /// SpO2 channel reports no signal.
    OxygenInvalid {
        /// Current heart rate value.
        heart_rate: i32,
    },
    /// Both channels produce values.
    Working {
        /// Current heart rate value.
        heart_rate: i32,
        /// Current SpO2 value.
        spo2: i32,
    },
}

impl SensorStatus {
    /// Classify a reading.
    pub fn from_reading(reading: &Reading) -> Self {
        match (reading.has_heart_rate(), reading.has_spo2()) {
            (false, false) => Self::NoSignal,
            (false, true) => Self::HeartRateInvalid { spo2: reading.spo2 },
            (true, false) => Self::OxygenInvalid {
                heart_rate: reading.heart_rate,
            },
            (true, true) => Self::Working {
                heart_rate: reading.heart_rate,
                spo2: reading.spo2,
            },
        }
    }

    /// Check if the sensor is producing values on both channels.
    pub fn is_working(&self) -> bool {
        matches!(self, Self::Working { .. })
    }

    /// Check if the sensor was successfully initialized.
    pub fn is_initialized(&self) -> bool {
        !matches!(self, Self::NotInitialized)
    }
}

impl std::fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "Sensor not initialized"),
            Self::NoReadings => write!(f, "No readings available"),
            Self::NoSignal => write!(f, "Sensor connected but not reading data"),
            Self::HeartRateInvalid { .. } => write!(f, "Sensor connected but HR reading invalid"),
            Self::OxygenInvalid { .. } => write!(f, "Sensor connected but O2 reading invalid"),
            Self::Working { heart_rate, spo2 } => {
                write!(f, "Sensor working: HR={}, O2={}", heart_rate, spo2)
            }
        }
    }
}
