//! BLE relay example
//!
//! The BLE half of a split deployment: another process runs the sensor
//! loop and writes the shared state file, this one only serves BLE.
//! - Registers the GATT application and advertisement through BlueZ
//! - Polls the shared state file and applies each new record
//! - Treats a missing or half-written file as "no data yet"
//!
//! Run with: cargo run --features bluez --example ble_relay
//!
//! Options:
//!   --state /tmp/x.json   shared state file path
//!   --name Wrist          advertised device name

use health_sensor_ble::ble::{BluezManager, SENSOR_SERVICE_UUID};
use health_sensor_ble::config::{DEFAULT_DEVICE_NAME, DEFAULT_NOTIFY_PERIOD};
use health_sensor_ble::{
    Advertisement, BleManager, Error, GattApplication, RelayConfig, Result, SharedStateRelay,
};
use std::sync::Arc;

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,health_sensor_ble=info".into()),
        )
        .init();

    println!("Health Sensor BLE Relay");
    println!("=======================\n");

    let args: Vec<String> = std::env::args().collect();

    let mut config = RelayConfig::new();
    if let Some(path) = arg_value(&args, "--state") {
        config = config.with_shared_state(path);
    }
    let name = arg_value(&args, "--name").unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());

    let manager: Arc<dyn BleManager> = Arc::new(BluezManager::new().await?);

    let app = Arc::new(GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD));
    let relay = SharedStateRelay::new(config, &app)?;

    // Without an adapter there is nothing to relay to.
    app.register(manager.clone()).await?;

    let advertisement = Advertisement::new(0, name.clone()).with_service_uuid(SENSOR_SERVICE_UUID);
    if let Err(e) = advertisement.register(manager.clone()).await {
        println!("Not discoverable: {}", e);
    }

    let runner = app.clone();
    let event_loop = tokio::spawn(async move { runner.run().await });

    relay.start();

    println!("Relaying {} as \"{}\"", relay.config().shared_state_path.display(), name);
    println!("Press Ctrl+C to stop\n");

    let _ = tokio::signal::ctrl_c().await;

    println!("\nShutting down...");
    relay.stop().await;
    app.quit();

    let result = match event_loop.await {
        Ok(result) => result,
        Err(e) => Err(Error::Internal(e.to_string())),
    };

    advertisement.unregister().await?;
    app.unregister().await?;

    if let Some(record) = relay.last_applied() {
        println!(
            "Last relayed: HR {}, O2 {}",
            record.heart_rate, record.oxygen_level
        );
    }

    result
}
