//! Demonstration of consent-driven background collection.
//!
//! This example shows how to:
//! 1. Build a collector with simulated probes and a fixed battery
//! 2. Register consent and watch workers sample
//! 3. Drain the battery and see intervals stretch
//! 4. Revoke consent, export and clear a user's data
//!
//! Run with: cargo run --example collect_demo

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use consent_collector::{
    config::Config, AesGcmCipher, CollectorService, ConsentExpiry, FixedBattery, Payload,
    PRIVACY_DECLARATION,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Consent Collector - Collection Demo");
    println!("===================================");
    println!();
    println!("{PRIVACY_DECLARATION}");

    // Short intervals so the demo shows activity within seconds
    let mut config = Config::default();
    for signal in config.signals.values_mut() {
        signal.interval = Duration::from_millis(500);
    }
    config.scheduler.poll_floor = Duration::from_millis(100);
    config.scheduler.poll_ceiling = Duration::from_millis(500);

    let battery = Arc::new(FixedBattery::new(90));
    let service = CollectorService::builder(config)
        .with_battery(battery.clone())
        .with_cipher(Arc::new(AesGcmCipher::random()))
        .with_collaborator(Arc::new(|user: &str, signal: &str, payload: &Payload| {
            if signal == "vitals" {
                println!("  [crisis] {user} vitals: {}", serde_json::Value::Object(payload.clone()));
            }
        }))
        .build();

    service.start()?;

    let requested: Vec<String> = ["pulse", "sleep", "vitals", "location"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let outcome = service.register_consent("alice", &requested, ConsentExpiry::Default)?;
    println!("Registered alice for: {}", outcome.registered.join(", "));
    if let Some(warning) = outcome.warning() {
        println!("Warning: {warning}");
    }

    let overrides = BTreeMap::from([("pulse".to_string(), 5)]);
    let applied = service.set_interval_override("alice", &overrides);
    println!("Overrides in effect: {:?}", applied.current);
    println!();

    tokio::time::sleep(Duration::from_secs(2)).await;
    print_status(&service);

    println!("Battery drops to 8%...");
    battery.set(8);
    tokio::time::sleep(Duration::from_secs(2)).await;
    print_status(&service);

    println!("Revoking vitals...");
    service.revoke_consent("alice", Some(&["vitals".to_string()]));
    tokio::time::sleep(Duration::from_secs(1)).await;
    print_status(&service);

    if let Some(samples) = service.read_recent("alice", "sleep", 3)? {
        println!("Latest sleep samples:");
        for sample in samples {
            println!(
                "  {} {}",
                sample.timestamp.format("%H:%M:%S%.3f"),
                serde_json::Value::Object(sample.payload)
            );
        }
        println!();
    }

    if let Some(export) = service.export("alice", None)? {
        println!("Exported {:?}", export.counts);
    }
    let cleared = service.clear("alice", None);
    println!("Cleared: {cleared:?}");
    println!();

    service.stop().await;

    if let Some(log) = service.transparency() {
        println!("{}", log.summary());
    }

    Ok(())
}

fn print_status(service: &CollectorService) {
    let status = service.status("alice");
    println!(
        "Status: collecting={} types=[{}] battery={}% ({:?}) state={}",
        status.is_collecting,
        status.collecting_types.join(", "),
        status.battery_level,
        status.battery_mode,
        status.user_state
    );
    for (signal, count) in &status.counts {
        println!("  {signal}: {count} cached");
    }
    println!();
}
