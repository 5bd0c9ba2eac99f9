//! Shared state relay.
//!
//! When the sensor loop runs in another process, the BLE process has no
//! sensor of its own. [`SharedStateRelay`] polls the shared state file and
//! applies every new record to the characteristics. A missing or half
//! written file means "no data yet". A record that stops changing is
//! reported as stale but kept on the characteristics.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::ble::{Characteristic, GattApplication};
use crate::config::RelayConfig;
use crate::data::{SharedStateFile, SharedStateRecord};
use crate::error::{Error, Result};
use crate::protocol::CharacteristicKind;

/// Result of one relay poll.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// The file is missing or unreadable.
    NoData,
    /// Same record as last time, still fresh.
    Unchanged,
    /// A new record was applied.
    Applied(SharedStateRecord),
    /// Same record as last time, older than the staleness threshold.
    Stale {
        /// Age of the record.
        age: Duration,
    },
}

struct RelayCore {
    file: SharedStateFile,
    stale_after: Duration,
    heart_rate: Arc<Characteristic>,
    oxygen: Arc<Characteristic>,
    last_applied: RwLock<Option<SharedStateRecord>>,
    stale_reported: AtomicBool,
}

impl RelayCore {
    async fn poll_once(&self) -> RelayOutcome {
        let Some(record) = self.file.read_latest().await else {
            return RelayOutcome::NoData;
        };

        let previous = *self.last_applied.read();
        if let Some(previous) = previous {
            if previous.timestamp == record.timestamp {
                let age = record.age(Utc::now());
                if age > self.stale_after {
                    if !self.stale_reported.swap(true, Ordering::SeqCst) {
                        warn!("Shared state is stale ({:.1}s old)", age.as_secs_f64());
                    }
                    return RelayOutcome::Stale { age };
                }
                return RelayOutcome::Unchanged;
            }
        }

        self.stale_reported.store(false, Ordering::SeqCst);

        for (characteristic, value) in [
            (&self.heart_rate, record.heart_rate),
            (&self.oxygen, record.oxygen_level),
        ] {
            if let Err(e) = characteristic.update(value) {
                warn!("Keeping previous {} value: {}", characteristic.kind(), e);
            }
        }

        debug!(
            "Relayed shared state: HR {}, O2 {}",
            record.heart_rate, record.oxygen_level
        );
        *self.last_applied.write() = Some(record);

        RelayOutcome::Applied(record)
    }
}

/// Feeds the characteristics from the shared state file.
pub struct SharedStateRelay {
    config: RelayConfig,
    core: Arc<RelayCore>,
    is_running: Arc<AtomicBool>,
    stop: Arc<Notify>,
    handle: RwLock<Option<JoinHandle<()>>>,
}

impl SharedStateRelay {
    /// Create a relay for the characteristics of `app`.
    pub fn new(config: RelayConfig, app: &GattApplication) -> Result<Self> {
        config.validate()?;

        let lookup = |kind: CharacteristicKind| {
            app.characteristic(kind)
                .ok_or_else(|| Error::CharacteristicNotFound {
                    path: format!("{} characteristic in {}", kind, app.path()),
                })
        };
        let heart_rate = lookup(CharacteristicKind::HeartRate)?;
        let oxygen = lookup(CharacteristicKind::Oxygen)?;

        Ok(Self {
            core: Arc::new(RelayCore {
                file: SharedStateFile::new(config.shared_state_path.clone()),
                stale_after: config.stale_after,
                heart_rate,
                oxygen,
                last_applied: RwLock::new(None),
                stale_reported: AtomicBool::new(false),
            }),
            config,
            is_running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
            handle: RwLock::new(None),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Last record applied to the characteristics.
    pub fn last_applied(&self) -> Option<SharedStateRecord> {
        *self.core.last_applied.read()
    }

    /// Check if the polling loop is active.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Read the file once and apply it if it changed.
    pub async fn poll_once(&self) -> RelayOutcome {
        self.core.poll_once().await
    }

    /// Start polling in the background.
    pub fn start(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("Relay already running");
            return;
        }

        info!(
            "Relaying {} every {:?}",
            self.config.shared_state_path.display(),
            self.config.poll_interval
        );

        let core = self.core.clone();
        let stop = self.stop.clone();
        let is_running = self.is_running.clone();
        let period = self.config.poll_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while is_running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = interval.tick() => {
                        core.poll_once().await;
                    }
                }
            }

            debug!("Relay loop ended");
        });

        *self.handle.write() = Some(handle);
    }

    /// Stop polling and wait for the loop to end. Idempotent.
    ///
    /// The shared state file is left alone; it belongs to the writer.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.stop.notify_one();
        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!("Relay stopped");
    }
}

impl std::fmt::Debug for SharedStateRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStateRelay")
            .field("path", &self.config.shared_state_path)
            .field("running", &self.is_running())
            .field("last_applied", &self.last_applied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_NOTIFY_PERIOD;
    use crate::data::shared_state::unix_seconds;
    use std::path::PathBuf;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("health-relay-{}.json", uuid::Uuid::new_v4()))
    }

    fn relay_for(path: &PathBuf) -> (GattApplication, SharedStateRelay) {
        let app = GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD);
        let relay = SharedStateRelay::new(
            RelayConfig::new()
                .with_shared_state(path.clone())
                .with_poll_interval(Duration::from_millis(20)),
            &app,
        )
        .unwrap();
        (app, relay)
    }

    fn record(heart_rate: i32, oxygen_level: i32, timestamp: f64) -> SharedStateRecord {
        SharedStateRecord {
            heart_rate,
            oxygen_level,
            timestamp,
        }
    }

    #[test]
    fn test_requires_characteristics() {
        let app = GattApplication::new();
        let err = SharedStateRelay::new(RelayConfig::new(), &app).unwrap_err();
        assert!(matches!(err, Error::CharacteristicNotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_and_malformed_file_is_no_data() {
        let path = temp_path();
        let (app, relay) = relay_for(&path);

        assert_eq!(relay.poll_once().await, RelayOutcome::NoData);

        tokio::fs::write(&path, b"{\"heart_rate\": 72, \"oxy").await.unwrap();
        assert_eq!(relay.poll_once().await, RelayOutcome::NoData);

        let hr = app.characteristic(CharacteristicKind::HeartRate).unwrap();
        assert_eq!(hr.read().as_ref(), b"0");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_applies_new_records_once() {
        let path = temp_path();
        let (app, relay) = relay_for(&path);
        let file = SharedStateFile::new(path.clone());
        let now = unix_seconds(Utc::now());

        let first = record(72, 98, now);
        file.write(&first).await.unwrap();
        assert_eq!(relay.poll_once().await, RelayOutcome::Applied(first));
        assert_eq!(relay.poll_once().await, RelayOutcome::Unchanged);

        let sentinel = record(-1, -1, now + 2.0);
        file.write(&sentinel).await.unwrap();
        assert_eq!(relay.poll_once().await, RelayOutcome::Applied(sentinel));

        let hr = app.characteristic(CharacteristicKind::HeartRate).unwrap();
        let o2 = app.characteristic(CharacteristicKind::Oxygen).unwrap();
        assert_eq!(hr.read().as_ref(), b"-1");
        assert_eq!(o2.read().as_ref(), b"-1");
        assert_eq!(relay.last_applied(), Some(sentinel));

        file.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_reports_stale_record() {
        let path = temp_path();
        let (app, relay) = relay_for(&path);
        let file = SharedStateFile::new(path.clone());

        let old = record(64, 97, unix_seconds(Utc::now()) - 60.0);
        file.write(&old).await.unwrap();

        // A fresh relay applies whatever it finds first.
        assert_eq!(relay.poll_once().await, RelayOutcome::Applied(old));
        assert!(matches!(
            relay.poll_once().await,
            RelayOutcome::Stale { age } if age >= Duration::from_secs(59)
        ));

        // The stale value stays readable.
        let hr = app.characteristic(CharacteristicKind::HeartRate).unwrap();
        assert_eq!(hr.read().as_ref(), b"64");

        file.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_extreme_timestamp_reports_stale() {
        let path = temp_path();
        let (app, relay) = relay_for(&path);

        tokio::fs::write(
            &path,
            br#"{"heart_rate":72,"oxygen_level":98,"timestamp":-1e300}"#,
        )
        .await
        .unwrap();

        assert!(matches!(relay.poll_once().await, RelayOutcome::Applied(_)));
        assert_eq!(
            relay.poll_once().await,
            RelayOutcome::Stale { age: Duration::MAX }
        );

        let hr = app.characteristic(CharacteristicKind::HeartRate).unwrap();
        assert_eq!(hr.read().as_ref(), b"72");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_record_keeps_previous() {
        let path = temp_path();
        let (app, relay) = relay_for(&path);
        let file = SharedStateFile::new(path.clone());
        let now = unix_seconds(Utc::now());

        file.write(&record(70, 99, now)).await.unwrap();
        relay.poll_once().await;
        file.write(&record(70, 140, now + 1.0)).await.unwrap();
        relay.poll_once().await;

        let o2 = app.characteristic(CharacteristicKind::Oxygen).unwrap();
        assert_eq!(o2.read().as_ref(), b"99");

        file.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_loop() {
        let path = temp_path();
        let (app, relay) = relay_for(&path);
        let file = SharedStateFile::new(path.clone());

        relay.start();
        relay.start();
        assert!(relay.is_running());

        file.write(&record(81, 96, unix_seconds(Utc::now())))
            .await
            .unwrap();

        let hr = app.characteristic(CharacteristicKind::HeartRate).unwrap();
        let mut applied = false;
        for _ in 0..50 {
            if hr.read().as_ref() == b"81" {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(applied);

        relay.stop().await;
        relay.stop().await;
        assert!(!relay.is_running());

        // The relay never deletes the writer's file.
        assert!(file.try_read().await.unwrap().is_some());
        file.remove().await.unwrap();
    }
}
