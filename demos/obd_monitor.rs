//! OBD-II monitor example
//!
//! Demonstrates a full session against a BLE ELM327 adapter:
//! - Connecting and running the initialization script
//! - Polling engine RPM and vehicle speed
//! - Reconnecting when the link drops
//!
//! Run with: cargo run --example obd_monitor -- <address>
//!
//! To poll faster:
//!   cargo run --example obd_monitor -- <address> --interval 250

use elm327_rust_ble::{kph_to_mph, BleTransport, Error, Pid, Result, Session, SessionConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,elm327_rust_ble=info")
        .init();

    println!("OBD-II Monitor");
    println!("==============\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let address = args.get(1).cloned().ok_or_else(|| Error::InvalidParameter {
        name: "address".to_string(),
        value: "missing".to_string(),
    })?;
    let interval = args
        .iter()
        .position(|arg| arg == "--interval")
        .and_then(|i| args.get(i + 1))
        .and_then(|ms| ms.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(500));

    println!("Connecting to adapter {}...\n", address);

    let config = SessionConfig::new(address).with_poll_interval(interval);
    let session = Arc::new(Session::new(config, Arc::new(BleTransport::new())));

    let _printer = session.on_telemetry_updated(|value| match value.pid {
        Pid::SPEED => println!(
            "  Speed: {:>5.0} {} ({:.0} mph)",
            value.value,
            value.unit,
            kph_to_mph(value.value)
        ),
        _ => println!("  PID {}: {:>7.1} {}", value.pid, value.value, value.unit),
    });

    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run().await })
    };

    println!("Polling. Press Ctrl+C to stop.\n");
    let _ = tokio::signal::ctrl_c().await;

    session.shutdown();
    let result = runner
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    let stats = session.stats();
    println!(
        "\n{} polls, {} ok, {} timed out, {} undecodable, {} refused",
        stats.polls, stats.successes, stats.timeouts, stats.decode_failures, stats.rejected
    );

    result
}
