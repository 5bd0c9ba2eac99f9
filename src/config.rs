//! Runtime configuration and tuning constants.
//!
//! Timing parameters, paths and names live here so they can be tuned in
//! one place. [`BridgeConfig`] and [`RelayConfig`] start from these
//! defaults and can be adjusted with their `with_*` setters.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

// BLE

/// Local name broadcast in the advertisement.
pub const DEFAULT_DEVICE_NAME: &str = "HealthSensor";

/// Interval at which subscribed characteristics re-send their value.
pub const DEFAULT_NOTIFY_PERIOD: Duration = Duration::from_millis(5000);

/// How long a GATT request may wait for the application event loop.
pub const GATT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the queue between the platform and the event loop.
pub const GATT_REQUEST_QUEUE: usize = 64;

// Sensor

/// Sensor polling cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Consecutive failed polls after which the sensor is considered lost.
pub const MAX_CONSECUTIVE_SENSOR_ERRORS: u32 = 5;

// Shared state handoff

/// Well-known location of the shared state file.
pub const DEFAULT_SHARED_STATE_PATH: &str = "/tmp/sensor_data.json";

/// Age after which the relay reports the shared state as stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

// Telemetry

/// Upper bound on a single telemetry push.
pub const DEFAULT_TELEMETRY_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration for a [`SensorBridge`](crate::SensorBridge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Local name in the advertisement.
    pub device_name: String,
    /// Sensor polling cadence.
    pub poll_interval: Duration,
    /// Periodic notification interval.
    pub notify_period: Duration,
    /// Path of the shared state file.
    pub shared_state_path: PathBuf,
    /// Mirror every reading to the shared state file.
    pub mirror_shared_state: bool,
    /// Delete the shared state file on shutdown.
    pub owns_shared_state: bool,
    /// Upper bound on a single telemetry push.
    pub telemetry_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            notify_period: DEFAULT_NOTIFY_PERIOD,
            shared_state_path: PathBuf::from(DEFAULT_SHARED_STATE_PATH),
            mirror_shared_state: true,
            owns_shared_state: true,
            telemetry_timeout: DEFAULT_TELEMETRY_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised device name.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the sensor polling cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the periodic notification interval.
    pub fn with_notify_period(mut self, period: Duration) -> Self {
        self.notify_period = period;
        self
    }

    /// Mirror readings to the shared state file at `path`.
    pub fn with_shared_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_state_path = path.into();
        self.mirror_shared_state = true;
        self
    }

    /// Disable the shared state file mirror.
    pub fn without_shared_state(mut self) -> Self {
        self.mirror_shared_state = false;
        self
    }

    /// Whether the bridge deletes the shared state file on shutdown.
    pub fn with_owned_shared_state(mut self, owned: bool) -> Self {
        self.owns_shared_state = owned;
        self
    }

    /// Set the telemetry push timeout.
    pub fn with_telemetry_timeout(mut self, timeout: Duration) -> Self {
        self.telemetry_timeout = timeout;
        self
    }

    /// Check the configuration for unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.device_name.trim().is_empty() {
            return Err(invalid("device_name", &self.device_name));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", &self.poll_interval));
        }
        if self.notify_period.is_zero() {
            return Err(invalid("notify_period", &self.notify_period));
        }
        if self.telemetry_timeout.is_zero() {
            return Err(invalid("telemetry_timeout", &self.telemetry_timeout));
        }
        if self.mirror_shared_state && self.shared_state_path.as_os_str().is_empty() {
            return Err(invalid("shared_state_path", &""));
        }
        Ok(())
    }
}

/// Configuration for a [`SharedStateRelay`](crate::SharedStateRelay).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Path of the shared state file.
    pub shared_state_path: PathBuf,
    /// How often the file is polled.
    pub poll_interval: Duration,
    /// Age after which an unchanged record is reported stale.
    pub stale_after: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shared_state_path: PathBuf::from(DEFAULT_SHARED_STATE_PATH),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

impl RelayConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared state file path.
    pub fn with_shared_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_state_path = path.into();
        self
    }

    /// Set the polling cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Check the configuration for unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.shared_state_path.as_os_str().is_empty() {
            return Err(invalid("shared_state_path", &""));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", &self.poll_interval));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: &dyn std::fmt::Debug) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: format!("{:?}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.device_name, "HealthSensor");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.notify_period, Duration::from_secs(5));
        assert_eq!(
            config.shared_state_path,
            PathBuf::from("/tmp/sensor_data.json")
        );
        assert!(config.mirror_shared_state);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::new()
            .with_device_name("Wrist")
            .with_poll_interval(Duration::from_millis(500))
            .without_shared_state();
        assert_eq!(config.device_name, "Wrist");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert!(!config.mirror_shared_state);
    }

    #[test]
    fn test_validate_rejects_zero_and_empty() {
        let err = BridgeConfig::new()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { ref name, .. } if name == "poll_interval"));

        assert!(BridgeConfig::new().with_device_name(" ").validate().is_err());
        assert!(BridgeConfig::new()
            .with_notify_period(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RelayConfig::new()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
