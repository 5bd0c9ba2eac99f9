//! Sensor sources.
//!
//! The bridge reads heart rate and SpO2 through the [`SensorSource`] trait.
//! A source follows the pulse-oximeter module's protocol: `begin` probes
//! for the device, `start_collect` puts it into measuring mode, `poll`
//! returns the latest computed values and `end_collect` stops measuring.

use async_trait::async_trait;

use crate::data::Reading;
use crate::error::Result;

pub mod replay;
pub mod simulated;

pub use replay::{ReplayExhausted, ReplayProbe, ReplaySensor, ReplayStep};
pub use simulated::SimulatedSensor;

/// One raw sample as reported by the sensor.
///
/// Either field may be -1 while the sensor has no valid signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawSample {
    /// Heart rate in bpm, or -1.
    pub heart_rate: i32,
    /// Oxygen saturation in percent, or -1.
    pub spo2: i32,
}

impl RawSample {
    /// Create a sample.
    pub fn new(heart_rate: i32, spo2: i32) -> Self {
        Self { heart_rate, spo2 }
    }

    /// A sample with no signal on either channel.
    pub fn no_signal() -> Self {
        Self::new(-1, -1)
    }

    /// Timestamp the sample now.
    pub fn into_reading(self) -> Reading {
        Reading::new(self.heart_rate, self.spo2)
    }
}

/// A heart rate and SpO2 sensor.
#[async_trait]
pub trait SensorSource: Send {
    /// Probe for the sensor. Returns `false` if it does not respond.
    async fn begin(&mut self) -> bool;

    /// Start measuring.
    async fn start_collect(&mut self) -> Result<()>;

    /// Stop measuring.
    async fn end_collect(&mut self) -> Result<()>;

    /// Fetch the latest values.
    ///
    /// Errors are transport failures. No signal is reported as -1 values,
    /// not as an error.
    async fn poll(&mut self) -> Result<RawSample>;

    /// Die temperature in degrees Celsius, if the sensor has one.
    async fn temperature_c(&mut self) -> Option<f32> {
        None
    }

    /// Name used in log messages.
    fn name(&self) -> &str {
        "sensor"
    }
}
