//! Sensor bridge example
//!
//! Runs the peripheral on a real adapter through BlueZ:
//! - Polls the sensor every 2 seconds
//! - Publishes heart rate and SpO2 over GATT and advertises the service
//! - Mirrors every reading to the shared state file for a separate
//!   BLE process (see the `ble_relay` example)
//!
//! Without an I2C driver this example uses the simulated sensor.
//!
//! Run with: cargo run --features bluez --example sensor_bridge
//!
//! Options:
//!   --adapter hci1        use a specific adapter
//!   --name Wrist          advertised device name
//!   --state /tmp/x.json   shared state file path

use health_sensor_ble::ble::BluezManager;
use health_sensor_ble::{BridgeConfig, BridgeEvent, Result, SensorBridge, SimulatedSensor};
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

    println!("Health Sensor BLE Peripheral");
    println!("============================\n");

    let args: Vec<String> = std::env::args().collect();

    let mut config = BridgeConfig::new();
    if let Some(name) = arg_value(&args, "--name") {
        config = config.with_device_name(name);
    }
    if let Some(path) = arg_value(&args, "--state") {
        config = config.with_shared_state(path);
    }

    let mut manager = BluezManager::new().await?;
    if let Some(adapter) = arg_value(&args, "--adapter") {
        manager = manager.with_adapter(adapter);
    }

    let bridge = SensorBridge::new(config, Box::new(SimulatedSensor::new()))?
        .with_ble_manager(Arc::new(manager));

    let _events = bridge.on_event(|event| match event {
        BridgeEvent::Started => println!("Sensor bridge started"),
        BridgeEvent::ReadingApplied(reading) => {
            println!("HR: {:>4}   O2: {:>4}", reading.heart_rate, reading.spo2)
        }
        BridgeEvent::BleDegraded(reason) => {
            println!("BLE unavailable, readings go to the shared state file only: {}", reason)
        }
        BridgeEvent::Error(message) => println!("Error: {}", message),
        BridgeEvent::Stopped => println!("Sensor bridge stopped"),
    });

    println!("Press Ctrl+C to stop\n");

    bridge
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
