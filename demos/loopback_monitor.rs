//! Loopback monitor example
//!
//! Runs the full peripheral without a Bluetooth radio:
//! - A simulated pulse oximeter feeds the sensor bridge
//! - The GATT application is registered on the in-memory loopback manager
//! - A local "central" subscribes to both characteristics through the
//!   same request path BlueZ would use and prints every notification
//!
//! Run with: cargo run --example loopback_monitor
//!
//! Stop after a fixed time:
//!   cargo run --example loopback_monitor -- --seconds 20

use health_sensor_ble::ble::NotificationSource;
use health_sensor_ble::{
    BridgeConfig, BridgeEvent, Error, LoopbackManager, Result, SensorBridge, SimulatedSensor,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,health_sensor_ble=info".into()),
        )
        .init();

    println!("Loopback Health Sensor");
    println!("======================\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let seconds = args
        .iter()
        .position(|arg| arg == "--seconds")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<u64>().ok());

    let shared_state = std::env::temp_dir().join("health_sensor_loopback.json");
    let config = BridgeConfig::new()
        .with_device_name("HealthSensor-Loopback")
        .with_shared_state(&shared_state);

    let manager = Arc::new(LoopbackManager::new());
    let sensor = SimulatedSensor::new().with_no_signal_every(7);

    let bridge = SensorBridge::new(config, Box::new(sensor))?.with_ble_manager(manager.clone());

    let _events = bridge.on_event(|event| match event {
        BridgeEvent::BleDegraded(reason) => println!("BLE degraded: {}", reason),
        BridgeEvent::Error(message) => println!("Error: {}", message),
        _ => {}
    });

    bridge.start().await?;

    println!("Advertising as \"{}\"", bridge.config().device_name);
    println!("Shared state: {}", shared_state.display());
    println!("Press Ctrl+C to stop\n");

    // Subscribe like a central would.
    let requests = manager
        .requests()
        .ok_or_else(|| Error::Internal("GATT application not registered".to_string()))?;
    for characteristic in [bridge.heart_rate_characteristic(), bridge.oxygen_characteristic()] {
        let mut rx = characteristic.subscribe_notifications();
        let kind = characteristic.kind();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let source = match event.source {
                    NotificationSource::Subscribed => "subscribe",
                    NotificationSource::Updated => "update",
                    NotificationSource::Timer => "timer",
                };
                println!(
                    "  [{:>9}] {:<18} {}",
                    source,
                    kind.to_string(),
                    String::from_utf8_lossy(&event.data)
                );
            }
        });
        requests.start_notify(characteristic.path()).await?;
    }

    let descriptor_path = format!("{}/desc0", bridge.heart_rate_characteristic().path());
    let description = requests.read(&descriptor_path).await?;
    println!("Descriptor: {}\n", String::from_utf8_lossy(&description));

    let status_bridge = &bridge;
    let stop = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };

    tokio::select! {
        _ = stop => {}
        _ = async {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            interval.tick().await;
            loop {
                interval.tick().await;
                println!("Status: {}", status_bridge.check_status());
            }
        } => {}
    }

    println!("\nShutting down...");
    bridge.shutdown().await?;

    let status = bridge.status();
    println!(
        "Final values: HR {}, O2 {} ({})",
        status.heart_rate, status.oxygen_level, status.state
    );

    Ok(())
}
