//! Scripted sensor playback.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sensor::{RawSample, SensorSource};

/// One scripted poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStep {
    /// Return this sample.
    Sample(RawSample),
    /// Fail the poll with a read error.
    Fail,
}

/// What a replay sensor does once its script runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayExhausted {
    /// Keep returning the last sample.
    #[default]
    RepeatLast,
    /// Report no signal.
    NoSignal,
    /// Fail every poll.
    Fail,
}

/// Observes a [`ReplaySensor`] after it has been handed to a bridge.
#[derive(Debug, Clone, Default)]
pub struct ReplayProbe {
    began: Arc<AtomicBool>,
    collecting: Arc<AtomicBool>,
    polls: Arc<AtomicUsize>,
    end_collect_calls: Arc<AtomicUsize>,
}

impl ReplayProbe {
    /// Check if `begin` was called.
    pub fn began(&self) -> bool {
        self.began.load(Ordering::SeqCst)
    }

    /// Check if the sensor is measuring.
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    /// Number of polls, failed ones included.
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Number of `end_collect` calls.
    pub fn end_collect_calls(&self) -> usize {
        self.end_collect_calls.load(Ordering::SeqCst)
    }
}

/// A sensor that plays back a fixed script.
#[derive(Debug)]
pub struct ReplaySensor {
    script: VecDeque<ReplayStep>,
    last: Option<RawSample>,
    present: bool,
    exhausted: ReplayExhausted,
    temperature_c: Option<f32>,
    probe: ReplayProbe,
}

impl ReplaySensor {
    /// Play back `steps` in order.
    pub fn new(steps: impl IntoIterator<Item = ReplayStep>) -> Self {
        Self {
            script: steps.into_iter().collect(),
            last: None,
            present: true,
            exhausted: ReplayExhausted::default(),
            temperature_c: None,
            probe: ReplayProbe::default(),
        }
    }

    /// Play back samples given as `(heart_rate, spo2)` pairs.
    pub fn from_samples(samples: impl IntoIterator<Item = (i32, i32)>) -> Self {
        Self::new(
            samples
                .into_iter()
                .map(|(hr, spo2)| ReplayStep::Sample(RawSample::new(hr, spo2))),
        )
    }

    /// Make `begin` report that no sensor is attached.
    pub fn absent(mut self) -> Self {
        self.present = false;
        self
    }

    /// Set what happens after the last step.
    pub fn when_exhausted(mut self, exhausted: ReplayExhausted) -> Self {
        self.exhausted = exhausted;
        self
    }

    /// Report a die temperature.
    pub fn with_temperature(mut self, celsius: f32) -> Self {
        self.temperature_c = Some(celsius);
        self
    }

    /// A probe sharing this sensor's counters.
    pub fn probe(&self) -> ReplayProbe {
        self.probe.clone()
    }

    fn next_step(&mut self) -> ReplayStep {
        if let Some(step) = self.script.pop_front() {
            return step;
        }

        match (self.exhausted, self.last) {
            (ReplayExhausted::RepeatLast, Some(last)) => ReplayStep::Sample(last),
            (ReplayExhausted::Fail, _) => ReplayStep::Fail,
            _ => ReplayStep::Sample(RawSample::no_signal()),
        }
    }
}

#[async_trait]
impl SensorSource for ReplaySensor {
    async fn begin(&mut self) -> bool {
        self.probe.began.store(true, Ordering::SeqCst);
        self.present
    }

    async fn start_collect(&mut self) -> Result<()> {
        if !self.present {
            return Err(Error::SensorInit {
                reason: "no sensor attached".to_string(),
            });
        }
        self.probe.collecting.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn end_collect(&mut self) -> Result<()> {
        self.probe.collecting.store(false, Ordering::SeqCst);
        self.probe.end_collect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(&mut self) -> Result<RawSample> {
        self.probe.polls.fetch_add(1, Ordering::SeqCst);

        if !self.probe.is_collecting() {
            return Err(Error::SensorRead {
                reason: "sensor is not collecting".to_string(),
            });
        }

        match self.next_step() {
            ReplayStep::Sample(sample) => {
                self.last = Some(sample);
                Ok(sample)
            }
            ReplayStep::Fail => Err(Error::SensorRead {
                reason: "scripted I2C failure".to_string(),
            }),
        }
    }

    async fn temperature_c(&mut self) -> Option<f32> {
        self.temperature_c
    }

    fn name(&self) -> &str {
        "replay"
    }
}
