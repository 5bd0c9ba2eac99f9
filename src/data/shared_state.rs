//! Shared state file handoff.
//!
//! When the sensor loop and the BLE server run as separate processes, the
//! only channel between them is a single JSON file at a well-known path:
//!
//! ```json
//! {"heart_rate": 72, "oxygen_level": 98, "timestamp": 1718000000.25}
//! ```
//!
//! The file is an eventually-consistent single-slot mailbox. The writer
//! replaces the whole file every cycle, there is no history and no locking,
//! and a reader has to treat a missing, partially written or stale file as
//! "no data yet" rather than an error.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::data::Reading;
use crate::error::Result;

/// Latest reading as written to the shared state file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SharedStateRecord {
    /// Heart rate in bpm, or -1.
    pub heart_rate: i32,
    /// Oxygen saturation in percent, or -1.
    pub oxygen_level: i32,
    /// Seconds since the Unix epoch, with sub-second precision.
    pub timestamp: f64,
}

impl SharedStateRecord {
    /// Build a record from a reading.
    pub fn from_reading(reading: &Reading) -> Self {
        Self {
            heart_rate: reading.heart_rate,
            oxygen_level: reading.spo2,
            timestamp: unix_seconds(reading.timestamp),
        }
    }

    /// Convert back into a reading.
    ///
    /// Timestamps that cannot be represented fall back to now.
    pub fn to_reading(&self) -> Reading {
        let timestamp = from_unix_seconds(self.timestamp).unwrap_or_else(Utc::now);
        Reading::at(self.heart_rate, self.oxygen_level, timestamp)
    }

    /// Time elapsed between the record's timestamp and `now`.
    ///
    /// Records from the future count as fresh. Ages too large for a
    /// `Duration` saturate at `Duration::MAX`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let age = unix_seconds(now) - self.timestamp;
        if age.is_nan() || age <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(age).unwrap_or(Duration::MAX)
    }
}

/// Seconds since the Unix epoch as a float.
pub(crate) fn unix_seconds(timestamp: DateTime<Utc>) -> f64 {
    timestamp.timestamp_millis() as f64 / 1000.0
}

fn from_unix_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((seconds * 1000.0).round() as i64)
        .single()
}

/// The shared state file at a fixed path.
#[derive(Debug, Clone)]
pub struct SharedStateFile {
    path: PathBuf,
}

impl SharedStateFile {
    /// Create a handle for the file at `path`. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the shared file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Overwrite the file with `record`.
    ///
    /// Writes a sibling staging file and renames it over the target, so a
    /// reader on the same file system sees either the old or the new record.
    pub async fn write(&self, record: &SharedStateRecord) -> Result<()> {
        let json = serde_json::to_vec(record)?;
        let staging = self.staging_path();

        tokio::fs::write(&staging, &json).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        trace!(
            "Wrote shared state to {}: HR {}, O2 {}",
            self.path.display(),
            record.heart_rate,
            record.oxygen_level
        );

        Ok(())
    }

    /// Read the file, distinguishing "absent" from "unreadable".
    ///
    /// Returns `Ok(None)` if the file does not exist yet, and an error if it
    /// exists but cannot be read or parsed.
    pub async fn try_read(&self) -> Result<Option<SharedStateRecord>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = serde_json::from_slice(&data)?;
        Ok(Some(record))
    }

    /// Read the latest record, treating every failure as "no data yet".
    pub async fn read_latest(&self) -> Option<SharedStateRecord> {
        match self.try_read().await {
            Ok(record) => record,
            Err(e) => {
                debug!(
                    "Shared state at {} not usable yet: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Delete the file. A missing file is not an error.
    pub async fn remove(&self) -> Result<()> {
        for path in [self.staging_path(), self.path.clone()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}
