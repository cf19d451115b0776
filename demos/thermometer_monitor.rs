//! Basic example: Follow a JATEMP thermometer and print its readings
//!
//! Run with: cargo run --example thermometer_monitor

use jatemp_ble::{DriverConfig, DriverUpdate, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jatemp_ble=info".parse().unwrap()),
        )
        .init();

    println!("Looking for a JATEMP thermometer...");
    println!("Press Ctrl+C to exit.\n");

    let config = DriverConfig::default().with_discovery_timeout(Duration::from_secs(20));
    let driver = jatemp_ble::connect_with_config(config).await?;
    let mut updates = driver.subscribe();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(DriverUpdate::Status(status)) => println!("[status] {}", status),
                Ok(DriverUpdate::Reading(reading)) => println!(
                    "[{}] {}",
                    reading.received_at.format("%H:%M:%S"),
                    reading.raw_text
                ),
                Ok(DriverUpdate::State(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    println!("(missed {} updates)", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted!");
                break;
            }
        }
    }

    if let Some(reading) = driver.current_reading() {
        println!("Last reading: {}", reading.raw_text);
    }

    driver.shutdown().await?;
    println!("Done!");

    Ok(())
}
