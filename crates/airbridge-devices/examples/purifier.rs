use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;
use tracing::info;

use airbridge_devices::transports::LoopbackTransport;
use airbridge_devices::{DeviceIdentity, DeviceSession, ReconnectPolicy, Reconnector};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    airbridge_core::logging::init_with_filter("info,airbridge_devices=debug")?;

    // A loopback transport stands in for the appliance's broker
    let transport = Arc::new(LoopbackTransport::new());
    let identity = DeviceIdentity::new(
        "NK6-EU-MHA0000A",
        "438",
        Some("192.168.1.20".to_string()),
        "local-credential",
    )
    .with_name("Living Room Purifier");
    let session = Arc::new(DeviceSession::new(identity, transport.clone())?);

    // Log every state change
    session.subscribe(|state| {
        info!(
            connected = state.connected,
            power = ?state.power,
            fan_speed = ?state.fan_speed,
            pm25 = ?state.pm25,
            "State changed"
        );
    });

    session.connect().await?;
    let _supervisor = Reconnector::spawn(&session, ReconnectPolicy::default());

    // Play the device's side of the conversation
    let status = session.topics().status.clone();
    transport.inject_json(
        &status,
        &json!({
            "msg": "CURRENT-STATE",
            "product-state": {"fpwr": "OFF", "fnsp": "AUTO", "fmod": "AUTO", "oson": "OFF"}
        }),
    );
    sleep(Duration::from_millis(100)).await;

    session.set_power(true).await?;
    session.set_fan_speed(4).await?;
    session.set_oscillation_angles(45, 315).await?;

    for message in transport.published() {
        info!("Published to {}: {}", message.topic, message.payload);
    }

    transport.inject_json(
        &status,
        &json!({
            "msg": "ENVIRONMENTAL-CURRENT-SENSOR-DATA",
            "data": {"tact": "2951", "hact": "0041", "p25r": "0004", "p10r": "0006"}
        }),
    );
    sleep(Duration::from_millis(100)).await;

    // Simulate a dropped connection; the supervisor brings it back
    transport.drop_connection("simulated network loss");
    sleep(Duration::from_secs(2)).await;
    info!("Connected after drop: {}", session.is_connected());

    session.disconnect().await?;
    Ok(())
}
