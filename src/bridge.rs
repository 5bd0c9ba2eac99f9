//! Sensor-to-BLE bridge.
//!
//! [`SensorBridge`] owns everything the peripheral needs: the sensor, the
//! GATT application with its two characteristics, the advertisement, the
//! optional shared state file and telemetry sink. It drives them through
//!
//! ```text
//! Uninitialized -> Acquiring -> Running -> ShuttingDown -> Stopped
//!                      |
//!                      +-> Failed
//! ```
//!
//! Sensor acquisition and BLE exposure fail independently. A sensor that
//! does not start stops everything before BLE is touched, while a BLE
//! registration failure only marks BLE as degraded and the sensor loop
//! keeps running. After `MAX_CONSECUTIVE_SENSOR_ERRORS` failed polls in a
//! row the bridge shuts itself down.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::ble::{Advertisement, BleManager, Characteristic, GattApplication, SENSOR_SERVICE_UUID};
use crate::callback::CallbackHandle;
use crate::config::{BridgeConfig, MAX_CONSECUTIVE_SENSOR_ERRORS};
use crate::data::{Reading, SensorStatus, SharedStateFile, SharedStateRecord};
use crate::error::{Error, Result};
use crate::protocol::CharacteristicKind;
use crate::sensor::SensorSource;
use crate::telemetry::TelemetrySink;

/// Lifecycle state of a [`SensorBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BridgeState {
    /// Created, not started.
    #[default]
    Uninitialized,
    /// Bringing up the sensor.
    Acquiring,
    /// Polling the sensor and serving BLE.
    Running,
    /// Cleaning up.
    ShuttingDown,
    /// Shut down.
    Stopped,
    /// The sensor could not be started. Terminal.
    Failed,
}

impl BridgeState {
    /// Check if the poll loop is active.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if no further transitions will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Acquiring => write!(f, "Acquiring"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Whether the readings are reachable over BLE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BleStatus {
    /// BLE has not been set up yet.
    #[default]
    NotStarted,
    /// Application registered and advertising.
    Active,
    /// BLE is unavailable or partially unavailable. The sensor loop runs.
    Degraded {
        /// Why BLE is degraded.
        reason: String,
    },
    /// BLE was torn down.
    Stopped,
}

impl BleStatus {
    /// Check if BLE is fully up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if BLE is degraded.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

impl std::fmt::Display for BleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Active => write!(f, "active"),
            Self::Degraded { reason } => write!(f, "degraded ({})", reason),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of a bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatus {
    /// Lifecycle state.
    pub state: BridgeState,
    /// BLE exposure.
    pub ble: BleStatus,
    /// Advertised device name.
    pub device_name: String,
    /// Current heart rate characteristic value.
    pub heart_rate: i16,
    /// Current oxygen characteristic value.
    pub oxygen_level: i16,
    /// Most recent reading, if any.
    pub last_reading: Option<Reading>,
    /// Failed polls since the last good one.
    pub consecutive_errors: u32,
}

/// Events emitted by a bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The bridge reached `Running`.
    Started,
    /// A reading was pushed to the characteristics.
    ReadingApplied(Reading),
    /// BLE exposure is degraded.
    BleDegraded(String),
    /// A recoverable or fatal error occurred.
    Error(String),
    /// The bridge reached `Stopped`.
    Stopped,
}

/// State shared between the bridge, its poll task and its teardown.
struct BridgeCore {
    config: BridgeConfig,
    sensor: AsyncMutex<Box<dyn SensorSource>>,
    app: Arc<GattApplication>,
    advertisement: Advertisement,
    heart_rate: Arc<Characteristic>,
    oxygen: Arc<Characteristic>,
    shared_state: Option<SharedStateFile>,
    telemetry: RwLock<Option<Arc<dyn TelemetrySink>>>,
    state: RwLock<BridgeState>,
    ble_status: RwLock<BleStatus>,
    last_reading: RwLock<Option<Reading>>,
    consecutive_errors: AtomicU32,
    event_tx: broadcast::Sender<BridgeEvent>,
    poll_handle: RwLock<Option<JoinHandle<()>>>,
    ble_handle: RwLock<Option<JoinHandle<Result<()>>>>,
    is_polling: AtomicBool,
    stop: Notify,
    // Fired once when the sensor is declared lost.
    sensor_lost: Notify,
    // Set under the state lock by a shutdown that arrives while acquiring.
    shutdown_requested: AtomicBool,
    // Fired when `start` leaves `Acquiring`.
    start_settled: Notify,
    shutdown_lock: AsyncMutex<()>,
}

impl BridgeCore {
    fn emit(&self, event: BridgeEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn poll_once(&self) -> Result<Reading> {
        let (sample, temperature) = {
            let mut sensor = self.sensor.lock().await;
            match sensor.poll().await {
                Ok(sample) => (sample, sensor.temperature_c().await),
                Err(e) => {
                    let failures = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        "Reading {} failed ({} in a row): {}",
                        sensor.name(),
                        failures,
                        e
                    );
                    self.emit(BridgeEvent::Error(e.to_string()));
                    return Err(e);
                }
            }
        };

        self.consecutive_errors.store(0, Ordering::SeqCst);

        let mut reading = sample.into_reading();
        if let Some(celsius) = temperature {
            reading = reading.with_temperature(celsius);
        }

        Ok(self.apply_reading(reading).await)
    }

    async fn apply_reading(&self, reading: Reading) -> Reading {
        debug!(
            "Reading: HR {} bpm, O2 {}%",
            reading.heart_rate, reading.spo2
        );

        // Rejected fields keep the value the characteristic still serves.
        let mut applied = reading;
        for characteristic in [&self.heart_rate, &self.oxygen] {
            let kind = characteristic.kind();
            if let Err(e) = characteristic.update(reading.field(kind)) {
                warn!("Keeping previous {} value: {}", kind, e);
                let kept = i32::from(characteristic.value().value());
                applied = applied.with_field(kind, kept);
            }
        }

        *self.last_reading.write() = Some(applied);

        if let Some(file) = &self.shared_state {
            if let Err(e) = file.write(&SharedStateRecord::from_reading(&applied)).await {
                warn!(
                    "Failed to write shared state {}: {}",
                    file.path().display(),
                    e
                );
            }
        }

        let sink = self.telemetry.read().clone();
        if let Some(sink) = sink {
            let timeout = self.config.telemetry_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, sink.push(applied.heart_rate, applied.spo2)).await
                {
                    Ok(Ok(())) => trace!("Telemetry pushed"),
                    Ok(Err(e)) => warn!("Telemetry push failed: {}", e),
                    Err(_) => warn!("Telemetry push timed out after {:?}", timeout),
                }
            });
        }

        self.emit(BridgeEvent::ReadingApplied(applied));
        applied
    }

    fn spawn_poll_loop(self: &Arc<Self>) {
        let core = self.clone();
        let period = self.config.poll_interval;

        self.is_polling.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while core.is_polling.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = core.stop.notified() => break,
                    _ = interval.tick() => {
                        if core.poll_once().await.is_err()
                            && core.consecutive_errors.load(Ordering::SeqCst)
                                >= MAX_CONSECUTIVE_SENSOR_ERRORS
                        {
                            core.declare_sensor_lost();
                            break;
                        }
                    }
                }
            }

            core.is_polling.store(false, Ordering::SeqCst);
            debug!("Sensor poll loop ended");
        });

        *self.poll_handle.write() = Some(handle);
    }

    /// Move to `ShuttingDown` and tear down on a separate task, since the
    /// teardown joins the poll loop that calls this.
    fn declare_sensor_lost(self: &Arc<Self>) {
        error!(
            "Sensor lost after {} failed reads",
            MAX_CONSECUTIVE_SENSOR_ERRORS
        );
        self.emit(BridgeEvent::Error("sensor lost".to_string()));

        {
            let mut state = self.state.write();
            if *state == BridgeState::Running {
                *state = BridgeState::ShuttingDown;
            }
        }
        self.is_polling.store(false, Ordering::SeqCst);
        self.sensor_lost.notify_one();

        let core = self.clone();
        tokio::spawn(async move {
            if let Err(e) = core.shutdown().await {
                warn!("Shutdown after sensor loss incomplete: {}", e);
            }
        });
    }

    async fn shutdown(&self) -> Result<()> {
        let _guard = self.shutdown_lock.lock().await;

        loop {
            {
                let mut state = self.state.write();
                match *state {
                    BridgeState::Stopped | BridgeState::Failed => return Ok(()),
                    BridgeState::Uninitialized => {
                        *state = BridgeState::Stopped;
                        return Ok(());
                    }
                    BridgeState::Running | BridgeState::ShuttingDown => {
                        *state = BridgeState::ShuttingDown;
                        break;
                    }
                    BridgeState::Acquiring => {
                        self.shutdown_requested.store(true, Ordering::SeqCst);
                    }
                }
            }

            debug!("Shutdown waits for start to settle");
            self.start_settled.notified().await;
        }

        info!("Shutting down sensor bridge");
        let mut first_error = None;

        // Sensor
        self.is_polling.store(false, Ordering::SeqCst);
        self.stop.notify_one();
        let poll_handle = self.poll_handle.write().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                note_failure(&mut first_error, "stop poll loop", Err(Error::Internal(e.to_string())));
            }
        }

        let end = self.sensor.lock().await.end_collect().await;
        note_failure(&mut first_error, "end sensor collection", end);

        // BLE
        self.app.quit();
        let ble_handle = self.ble_handle.write().take();
        if let Some(handle) = ble_handle {
            let joined = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Internal(e.to_string())),
            };
            note_failure(&mut first_error, "join BLE event loop", joined);
        }

        let released = self.advertisement.unregister().await;
        note_failure(&mut first_error, "release advertisement", released);
        let released = self.app.unregister().await;
        note_failure(&mut first_error, "unregister application", released);
        *self.ble_status.write() = BleStatus::Stopped;

        // Shared state
        if let Some(file) = &self.shared_state {
            if self.config.owns_shared_state {
                let removed = file.remove().await;
                note_failure(&mut first_error, "remove shared state", removed);
            }
        }

        *self.state.write() = BridgeState::Stopped;
        self.emit(BridgeEvent::Stopped);
        info!("Sensor bridge stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Orchestrates the sensor loop and the BLE peripheral.
pub struct SensorBridge {
    core: Arc<BridgeCore>,
    ble_manager: Option<Arc<dyn BleManager>>,
    callback_counter: AtomicU64,
}

impl SensorBridge {
    /// Create a bridge for `sensor`.
    ///
    /// The characteristics exist from here on, whether or not BLE can be
    /// registered later.
    pub fn new(config: BridgeConfig, sensor: Box<dyn SensorSource>) -> Result<Self> {
        config.validate()?;

        let app = Arc::new(GattApplication::health_sensor(config.notify_period));
        let heart_rate = app
            .characteristic(CharacteristicKind::HeartRate)
            .ok_or_else(|| Error::Internal("heart rate characteristic missing".to_string()))?;
        let oxygen = app
            .characteristic(CharacteristicKind::Oxygen)
            .ok_or_else(|| Error::Internal("oxygen characteristic missing".to_string()))?;

        let advertisement =
            Advertisement::new(0, config.device_name.clone()).with_service_uuid(SENSOR_SERVICE_UUID);

        let shared_state = config
            .mirror_shared_state
            .then(|| SharedStateFile::new(config.shared_state_path.clone()));

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            core: Arc::new(BridgeCore {
                config,
                sensor: AsyncMutex::new(sensor),
                app,
                advertisement,
                heart_rate,
                oxygen,
                shared_state,
                telemetry: RwLock::new(None),
                state: RwLock::new(BridgeState::Uninitialized),
                ble_status: RwLock::new(BleStatus::NotStarted),
                last_reading: RwLock::new(None),
                consecutive_errors: AtomicU32::new(0),
                event_tx,
                poll_handle: RwLock::new(None),
                ble_handle: RwLock::new(None),
                is_polling: AtomicBool::new(false),
                stop: Notify::new(),
                sensor_lost: Notify::new(),
                shutdown_requested: AtomicBool::new(false),
                start_settled: Notify::new(),
                shutdown_lock: AsyncMutex::new(()),
            }),
            ble_manager: None,
            callback_counter: AtomicU64::new(0),
        })
    }

    /// Export the characteristics through `manager`.
    ///
    /// Without a manager the bridge runs with BLE degraded.
    pub fn with_ble_manager(mut self, manager: Arc<dyn BleManager>) -> Self {
        self.ble_manager = Some(manager);
        self
    }

    /// Push every reading to `sink` as well.
    pub fn with_telemetry(self, sink: Arc<dyn TelemetrySink>) -> Self {
        *self.core.telemetry.write() = Some(sink);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &BridgeConfig {
        &self.core.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        *self.core.state.read()
    }

    /// Current BLE exposure.
    pub fn ble_status(&self) -> BleStatus {
        self.core.ble_status.read().clone()
    }

    /// The GATT application.
    pub fn application(&self) -> &Arc<GattApplication> {
        &self.core.app
    }

    /// The advertisement.
    pub fn advertisement(&self) -> &Advertisement {
        &self.core.advertisement
    }

    /// The heart rate characteristic.
    pub fn heart_rate_characteristic(&self) -> &Arc<Characteristic> {
        &self.core.heart_rate
    }

    /// The oxygen characteristic.
    pub fn oxygen_characteristic(&self) -> &Arc<Characteristic> {
        &self.core.oxygen
    }

    /// The shared state file, if readings are mirrored.
    pub fn shared_state(&self) -> Option<&SharedStateFile> {
        self.core.shared_state.as_ref()
    }

    /// Most recent applied reading.
    ///
    /// Fields a characteristic rejected hold the value it kept instead.
    pub fn last_reading(&self) -> Option<Reading> {
        *self.core.last_reading.read()
    }

    /// Take a status snapshot.
    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            state: self.state(),
            ble: self.ble_status(),
            device_name: self.core.config.device_name.clone(),
            heart_rate: self.core.heart_rate.value().value(),
            oxygen_level: self.core.oxygen.value().value(),
            last_reading: self.last_reading(),
            consecutive_errors: self.core.consecutive_errors.load(Ordering::SeqCst),
        }
    }

    /// Classify the sensor from the latest applied reading.
    pub fn check_status(&self) -> SensorStatus {
        match self.state() {
            BridgeState::Running | BridgeState::ShuttingDown => match self.last_reading() {
                Some(reading) => SensorStatus::from_reading(&reading),
                None => SensorStatus::NoReadings,
            },
            _ => SensorStatus::NotInitialized,
        }
    }

    /// Subscribe to bridge events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.core.event_tx.subscribe()
    }

    /// Register a callback for bridge events.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        CallbackHandle::listen(callback_id, self.core.event_tx.subscribe(), callback)
    }

    /// Bring up the sensor, then BLE, then start polling.
    ///
    /// Fails with [`Error::SensorInit`] if the sensor does not start; the
    /// bridge is then `Failed` and BLE is never registered. BLE failures
    /// are not returned, see [`ble_status`](Self::ble_status).
    ///
    /// A [`shutdown`](Self::shutdown) issued meanwhile makes this return
    /// [`Error::InvalidState`] once the current step finishes; the shutdown
    /// then tears down whatever was brought up.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.core.state.write();
            if *state != BridgeState::Uninitialized {
                return Err(Error::InvalidState {
                    operation: "start".to_string(),
                    state: state.to_string(),
                });
            }
            *state = BridgeState::Acquiring;
        }

        info!("Starting sensor bridge \"{}\"", self.core.config.device_name);

        if let Err(e) = self.acquire_sensor().await {
            error!("Sensor initialization failed: {}", e);
            *self.core.state.write() = BridgeState::Failed;
            self.core.start_settled.notify_one();
            self.core.emit(BridgeEvent::Error(e.to_string()));
            return Err(e);
        }

        if self.core.shutdown_requested.load(Ordering::SeqCst) {
            return Err(self.abandon_start());
        }

        self.start_ble().await;

        {
            let mut state = self.core.state.write();
            if self.core.shutdown_requested.load(Ordering::SeqCst) {
                drop(state);
                return Err(self.abandon_start());
            }
            *state = BridgeState::Running;
        }
        self.core.spawn_poll_loop();
        self.core.start_settled.notify_one();

        info!(
            "Sensor bridge running (poll every {:?}, BLE {})",
            self.core.config.poll_interval,
            self.ble_status()
        );
        self.core.emit(BridgeEvent::Started);

        Ok(())
    }

    /// Hand a half-started bridge over to the waiting shutdown.
    fn abandon_start(&self) -> Error {
        info!("Start abandoned, shutdown requested");
        *self.core.state.write() = BridgeState::ShuttingDown;
        self.core.start_settled.notify_one();
        Error::InvalidState {
            operation: "start".to_string(),
            state: BridgeState::ShuttingDown.to_string(),
        }
    }

    async fn acquire_sensor(&self) -> Result<()> {
        let mut sensor = self.core.sensor.lock().await;

        if !sensor.begin().await {
            return Err(Error::SensorInit {
                reason: format!("{} did not respond", sensor.name()),
            });
        }

        sensor.start_collect().await.map_err(|e| match e {
            Error::SensorInit { .. } => e,
            other => Error::SensorInit {
                reason: other.to_string(),
            },
        })?;

        debug!("{} collecting", sensor.name());
        Ok(())
    }

    async fn start_ble(&self) {
        let Some(manager) = self.ble_manager.clone() else {
            self.degrade_ble("no BLE manager configured".to_string());
            return;
        };

        if let Err(e) = self.core.app.register(manager.clone()).await {
            self.degrade_ble(e.to_string());
            return;
        }

        let app = self.core.app.clone();
        *self.core.ble_handle.write() = Some(tokio::spawn(async move { app.run().await }));

        match self.core.advertisement.register(manager).await {
            Ok(()) => *self.core.ble_status.write() = BleStatus::Active,
            Err(e) => self.degrade_ble(format!("not discoverable: {}", e)),
        }
    }

    fn degrade_ble(&self, reason: String) {
        warn!("BLE degraded, sensor loop continues: {}", reason);
        *self.core.ble_status.write() = BleStatus::Degraded {
            reason: reason.clone(),
        };
        self.core.emit(BridgeEvent::BleDegraded(reason));
    }

    /// Poll the sensor once and apply the result.
    ///
    /// Only valid while running. Poll failures count toward the
    /// consecutive failure limit.
    pub async fn poll_once(&self) -> Result<Reading> {
        let state = self.state();
        if state != BridgeState::Running {
            return Err(Error::InvalidState {
                operation: "poll sensor".to_string(),
                state: state.to_string(),
            });
        }
        self.core.poll_once().await
    }

    /// Push a reading to both characteristics, the shared state file and
    /// the telemetry sink.
    ///
    /// Sentinel values are applied like any other. A field a characteristic
    /// rejects is replaced by the value it kept before the reading is
    /// recorded, mirrored or pushed. File and telemetry errors are logged
    /// and do not stop the others. Returns the reading as applied.
    pub async fn apply_reading(&self, reading: Reading) -> Reading {
        self.core.apply_reading(reading).await
    }

    /// Shut down. Idempotent.
    ///
    /// Stops the poll loop and sensor collection, quits the BLE event loop
    /// and waits for it, withdraws the advertisement and application, then
    /// deletes the shared state file if this bridge owns it. Every step
    /// runs even if an earlier one failed; the first error is returned.
    ///
    /// While [`start`](Self::start) is still acquiring, this waits for it to
    /// settle and then tears down what it brought up. A lost sensor runs
    /// the same teardown on its own.
    pub async fn shutdown(&self) -> Result<()> {
        self.core.shutdown().await
    }

    /// Start, run until `signal` completes or the sensor is lost, then
    /// shut down.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        let sensor_lost = tokio::select! {
            _ = signal => {
                info!("Termination requested");
                false
            }
            _ = self.core.sensor_lost.notified() => true,
        };

        let result = self.shutdown().await;

        if sensor_lost {
            return Err(Error::SensorRead {
                reason: format!(
                    "{} consecutive sensor read failures",
                    MAX_CONSECUTIVE_SENSOR_ERRORS
                ),
            });
        }
        result
    }
}

fn note_failure(first_error: &mut Option<Error>, step: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("Shutdown step \"{}\" failed: {}", step, e);
        first_error.get_or_insert(e);
    }
}

impl std::fmt::Debug for SensorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorBridge")
            .field("device_name", &self.core.config.device_name)
            .field("state", &self.state())
            .field("ble", &self.ble_status())
            .finish()
    }
}
