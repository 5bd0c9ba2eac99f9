//! Remote telemetry sink.
//!
//! Readings can be pushed to a remote store (a cloud database over Wi-Fi,
//! a LoRa uplink) in addition to BLE. The bridge only knows the
//! [`TelemetrySink`] seam. A push that fails or takes too long is logged
//! and never holds up the sensor loop.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

/// Destination for readings outside the BLE link.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver one heart rate and SpO2 pair. Either may be -1.
    async fn push(&self, heart_rate: i32, spo2: i32) -> Result<()>;
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl TelemetrySink for NullSink {
    async fn push(&self, _heart_rate: i32, _spo2: i32) -> Result<()> {
        Ok(())
    }
}

/// A sink that keeps every pushed pair in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    readings: Mutex<Vec<(i32, i32)>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(heart_rate, spo2)` pairs received so far.
    pub fn readings(&self) -> Vec<(i32, i32)> {
        self.readings.lock().clone()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn push(&self, heart_rate: i32, spo2: i32) -> Result<()> {
        self.readings.lock().push((heart_rate, spo2));
        Ok(())
    }
}
