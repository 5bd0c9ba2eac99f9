//! Simulated pulse oximeter.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sensor::{RawSample, SensorSource};

/// Heart rate offsets cycled through on successive polls.
const HEART_RATE_WAVE: [i32; 8] = [0, 2, 3, 2, 0, -2, -3, -2];

/// A deterministic sensor for demos and tests.
///
/// Heart rate follows a small wave around its base value and SpO2 dips by
/// one point every third sample. Optionally every `n`th poll reports no
/// signal on both channels, the way a real sensor does when the finger
/// slips.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    present: bool,
    collecting: bool,
    samples: u64,
    base_heart_rate: i32,
    base_spo2: i32,
    no_signal_every: Option<u64>,
    temperature_c: f32,
}

impl SimulatedSensor {
    /// A sensor around 72 bpm and 98 %.
    pub fn new() -> Self {
        Self {
            present: true,
            collecting: false,
            samples: 0,
            base_heart_rate: 72,
            base_spo2: 98,
            no_signal_every: None,
            temperature_c: 31.5,
        }
    }

    /// A sensor that does not answer `begin`.
    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new()
        }
    }

    /// Set the base values.
    pub fn with_baseline(mut self, heart_rate: i32, spo2: i32) -> Self {
        self.base_heart_rate = heart_rate;
        self.base_spo2 = spo2;
        self
    }

    /// Report no signal on every `n`th poll. Zero disables the gap.
    pub fn with_no_signal_every(mut self, n: u64) -> Self {
        self.no_signal_every = (n > 0).then_some(n);
        self
    }

    /// Number of successful polls so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Check if the sensor is measuring.
    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    fn sample(&self, n: u64) -> RawSample {
        if let Some(every) = self.no_signal_every {
            if n % every == 0 {
                return RawSample::no_signal();
            }
        }

        let wave = HEART_RATE_WAVE[(n as usize) % HEART_RATE_WAVE.len()];
        let dip = i32::from(n % 3 == 0);

        RawSample {
            heart_rate: (self.base_heart_rate + wave).clamp(0, 250),
            spo2: (self.base_spo2 - dip).clamp(0, 100),
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorSource for SimulatedSensor {
    async fn begin(&mut self) -> bool {
        self.present
    }

    async fn start_collect(&mut self) -> Result<()> {
        if !self.present {
            return Err(Error::SensorInit {
                reason: "simulated sensor is absent".to_string(),
            });
        }
        self.collecting = true;
        debug!("Simulated sensor collecting");
        Ok(())
    }

    async fn end_collect(&mut self) -> Result<()> {
        self.collecting = false;
        Ok(())
    }

    async fn poll(&mut self) -> Result<RawSample> {
        if !self.collecting {
            return Err(Error::SensorRead {
                reason: "sensor is not collecting".to_string(),
            });
        }

        self.samples += 1;
        Ok(self.sample(self.samples))
    }

    async fn temperature_c(&mut self) -> Option<f32> {
        self.present.then_some(self.temperature_c)
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
