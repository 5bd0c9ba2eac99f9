//! End-to-end scenarios for the sensor bridge and the GATT event loop.

use health_sensor_ble::ble::{ApplicationState, NotificationSource};
use health_sensor_ble::config::DEFAULT_NOTIFY_PERIOD;
use health_sensor_ble::relay::RelayOutcome;
use health_sensor_ble::{
    BridgeConfig, BridgeEvent, BridgeState, Error, GattApplication, LoopbackManager, RelayConfig,
    ReplaySensor, SensorBridge, SensorStatus, SharedStateFile, SharedStateRelay,
};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn temp_state_path() -> PathBuf {
    std::env::temp_dir().join(format!("health-scenario-{}.json", uuid::Uuid::new_v4()))
}

/// A config whose background poll fires once at start and then waits an
/// hour, so tests drive further polls explicitly.
fn manual_config() -> BridgeConfig {
    BridgeConfig::new().with_poll_interval(Duration::from_secs(3600))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn sensor_that_never_begins_keeps_ble_down() {
    let manager = Arc::new(LoopbackManager::new());
    let sensor = ReplaySensor::from_samples([(72, 98)]).absent();
    let probe = sensor.probe();

    let bridge = SensorBridge::new(manual_config().without_shared_state(), Box::new(sensor))
        .unwrap()
        .with_ble_manager(manager.clone());
    let mut events = bridge.subscribe_events();

    let err = bridge.start().await.unwrap_err();

    assert!(matches!(err, Error::SensorInit { .. }));
    assert!(probe.began());
    assert!(!probe.is_collecting());
    assert_eq!(bridge.state(), BridgeState::Failed);
    assert_eq!(bridge.check_status(), SensorStatus::NotInitialized);
    assert_eq!(manager.application_count(), 0);
    assert!(!manager.is_advertising());

    while let Ok(event) = events.try_recv() {
        assert_ne!(event, BridgeEvent::Started);
    }

    tokio_test::assert_ok!(bridge.shutdown().await);
}

#[tokio::test]
async fn valid_reading_reaches_characteristics_and_shared_file() {
    let path = temp_state_path();
    let manager = Arc::new(LoopbackManager::new());
    let sensor = ReplaySensor::from_samples([(72, 98)]);

    let bridge = SensorBridge::new(manual_config().with_shared_state(&path), Box::new(sensor))
        .unwrap()
        .with_ble_manager(manager.clone());

    bridge.start().await.unwrap();
    bridge.poll_once().await.unwrap();

    // Through the same request path a central uses.
    let requests = manager.requests().unwrap();
    let hr = requests
        .read(bridge.heart_rate_characteristic().path())
        .await
        .unwrap();
    let o2 = requests
        .read(bridge.oxygen_characteristic().path())
        .await
        .unwrap();
    assert_eq!(hr.as_ref(), b"72");
    assert_eq!(o2.as_ref(), b"98");

    let json: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    assert_eq!(json["heart_rate"], 72);
    assert_eq!(json["oxygen_level"], 98);
    assert!(json["timestamp"].as_f64().unwrap() > 1_600_000_000.0);

    assert_eq!(
        bridge.check_status(),
        SensorStatus::Working {
            heart_rate: 72,
            spo2: 98
        }
    );

    bridge.shutdown().await.unwrap();

    // The bridge owns the file by default and removes it on shutdown.
    assert!(!path.exists());
}

#[tokio::test]
async fn no_signal_is_propagated_to_subscribers() {
    let path = temp_state_path();
    let manager = Arc::new(LoopbackManager::new());
    let sensor = ReplaySensor::from_samples([(70, 97), (-1, -1)]);

    let bridge = SensorBridge::new(manual_config().with_shared_state(&path), Box::new(sensor))
        .unwrap()
        .with_ble_manager(manager.clone());

    bridge.start().await.unwrap();
    settle().await;
    assert_eq!(bridge.heart_rate_characteristic().read().as_ref(), b"70");

    let hr = bridge.heart_rate_characteristic().clone();
    let mut notifications = hr.subscribe_notifications();
    manager
        .requests()
        .unwrap()
        .start_notify(hr.path())
        .await
        .unwrap();

    let subscribed = notifications.recv().await.unwrap();
    assert_eq!(subscribed.source, NotificationSource::Subscribed);
    assert_eq!(subscribed.data.as_ref(), b"70");

    let reading = bridge.poll_once().await.unwrap();
    assert!(reading.is_no_signal());

    let update = notifications.recv().await.unwrap();
    assert_eq!(update.source, NotificationSource::Updated);
    assert_eq!(update.data.as_ref(), b"-1");
    assert_eq!(bridge.oxygen_characteristic().read().as_ref(), b"-1");

    let record = SharedStateFile::new(&path).try_read().await.unwrap().unwrap();
    assert_eq!((record.heart_rate, record.oxygen_level), (-1, -1));
    assert_eq!(bridge.check_status(), SensorStatus::NoSignal);

    bridge.shutdown().await.unwrap();
}

#[tokio::test]
async fn quit_returns_run_promptly() {
    let app = Arc::new(GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD));
    app.register(Arc::new(LoopbackManager::new())).await.unwrap();

    let runner = app.clone();
    let event_loop = tokio::spawn(async move { runner.run().await });
    settle().await;
    assert_eq!(app.state(), ApplicationState::Running);

    let quit = app.quit_handle();
    let started = Instant::now();
    std::thread::spawn(move || quit.quit()).join().unwrap();

    tokio::time::timeout(Duration::from_secs(1), event_loop)
        .await
        .expect("run() did not return after quit()")
        .unwrap()
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(app.state(), ApplicationState::Stopped);

    // Later quits are no-ops.
    app.quit();
    app.quit_handle().quit();
    assert_eq!(app.state(), ApplicationState::Stopped);
}

#[tokio::test]
async fn split_processes_hand_off_through_shared_file() {
    let path = temp_state_path();

    // Sensor side: no BLE at all.
    let sensor = ReplaySensor::from_samples([(66, 99)]);
    let bridge = SensorBridge::new(manual_config().with_shared_state(&path), Box::new(sensor))
        .unwrap()
        .with_ble_manager(Arc::new(LoopbackManager::unavailable()));
    bridge.start().await.unwrap();
    assert!(bridge.ble_status().is_degraded());

    // BLE side: its own application fed by the relay.
    let app = GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD);
    let relay = SharedStateRelay::new(RelayConfig::new().with_shared_state(&path), &app).unwrap();

    bridge.poll_once().await.unwrap();
    assert!(matches!(relay.poll_once().await, RelayOutcome::Applied(_)));
    assert_eq!(
        app.characteristic(health_sensor_ble::CharacteristicKind::HeartRate)
            .unwrap()
            .read()
            .as_ref(),
        b"66"
    );

    bridge.shutdown().await.unwrap();
    assert_eq!(relay.poll_once().await, RelayOutcome::NoData);
}
