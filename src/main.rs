//! Consent Collector CLI
//!
//! Runs the background collector for a set of users with simulated probes.

use anyhow::Context;
use clap::{Parser, Subcommand};
use consent_collector::{
    config::Config, transparency::create_shared_log_with_persistence, AesGcmCipher,
    CollectorService, ConsentExpiry, FileUpstream, FixedBattery, SystemBattery,
    PRIVACY_DECLARATION, VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "consent-collector")]
#[command(version = VERSION)]
#[command(about = "Consent-driven adaptive background telemetry collector", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register consent for users and collect until Ctrl+C
    Run {
        /// Comma-separated user ids
        #[arg(long, value_delimiter = ',', required = true)]
        users: Vec<String>,

        /// Comma-separated signal types to authorize
        #[arg(long, value_delimiter = ',', default_value = "pulse,sleep")]
        types: Vec<String>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Pretend the battery is at this level instead of reading it
        #[arg(long)]
        battery: Option<u8>,

        /// Seconds between status lines
        #[arg(long, default_value = "5")]
        report_every: u64,
    },

    /// Show persisted collection statistics
    Status,

    /// Display privacy declaration
    Privacy,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            users,
            types,
            duration,
            battery,
            report_every,
        } => cmd_run(users, types, duration, battery, report_every).await,
        Commands::Status => cmd_status(),
        Commands::Privacy => {
            println!("{PRIVACY_DECLARATION}");
            Ok(())
        }
        Commands::Config => cmd_config(),
    }
}

async fn cmd_run(
    users: Vec<String>,
    types: Vec<String>,
    duration: Option<u64>,
    battery: Option<u8>,
    report_every: u64,
) -> anyhow::Result<()> {
    println!("Consent Collector v{VERSION}");
    println!();

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Using default configuration");
        Config::default()
    });
    if let Err(e) = config.ensure_directories() {
        tracing::warn!(error = %e, "Could not create directories");
    }

    let cipher = match &config.security.encryption_seed {
        Some(seed) => AesGcmCipher::from_seed(seed),
        None => AesGcmCipher::random(),
    };
    let transparency =
        create_shared_log_with_persistence(config.data_path.join("transparency.json"));
    let export_path = config.export_path.clone();

    let mut builder = CollectorService::builder(config)
        .with_cipher(Arc::new(cipher))
        .with_transparency(transparency.clone())
        .with_upstream(Arc::new(FileUpstream::new(&export_path)));
    builder = match battery {
        Some(level) => builder.with_battery(Arc::new(FixedBattery::new(level))),
        None => builder.with_battery(Arc::new(SystemBattery::new())),
    };
    let service = builder.build();

    if !service.is_enabled() {
        anyhow::bail!("Background collection is disabled in {:?}", Config::config_path());
    }

    for user in &users {
        let outcome = service
            .register_consent(user, &types, ConsentExpiry::Default)
            .with_context(|| format!("Could not register consent for {user}"))?;
        if let Some(warning) = outcome.warning() {
            println!("  {user}: {warning}");
        }
        println!("  {user}: collecting {}", outcome.registered.join(", "));
    }

    service.start()?;
    println!();
    println!("Collecting... Press Ctrl+C to stop.");
    println!();

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(Duration::from_secs(report_every.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Shutting down...");
                break;
            }
            _ = &mut deadline => break,
            _ = ticker.tick() => {
                for user in &users {
                    let status = service.status(user);
                    let cached: usize = status.counts.values().sum();
                    println!(
                        "[{}] {user}: collecting={} types=[{}] cached={} battery={}% ({:?}) state={}",
                        chrono::Local::now().format("%H:%M:%S"),
                        status.is_collecting,
                        status.collecting_types.join(","),
                        cached,
                        status.battery_level,
                        status.battery_mode,
                        status.user_state,
                    );
                }
            }
        }
    }

    service.stop().await;

    if let Err(e) = transparency.save() {
        tracing::warn!(error = %e, "Could not save transparency stats");
    }

    println!();
    println!("Sync batches written to {}", export_path.display());
    println!();
    println!("{}", transparency.summary());
    Ok(())
}

fn cmd_status() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Consent Collector Status");
    println!("========================");
    println!();
    println!("Configuration:");
    println!(
        "  Background collection: {}",
        if config.enabled { "enabled" } else { "disabled" }
    );
    for (name, signal) in &config.signals {
        println!(
            "  {name}: {} every {}s",
            if signal.enabled { "enabled" } else { "disabled" },
            signal.interval.as_secs()
        );
    }
    println!();

    let stats_path = config.data_path.join("transparency.json");
    if stats_path.exists() {
        let content = std::fs::read_to_string(&stats_path)
            .with_context(|| format!("Could not read {}", stats_path.display()))?;
        let stats: serde_json::Value = serde_json::from_str(&content)?;
        println!("Cumulative Statistics:");
        for key in [
            "samples_collected",
            "samples_evicted",
            "probe_failures",
            "alerts_forwarded",
            "batches_synced",
            "samples_synced",
        ] {
            if let Some(value) = stats.get(key) {
                println!("  {}: {value}", key.replace('_', " "));
            }
        }
        if let Some(by_signal) = stats.get("samples_by_signal").and_then(|v| v.as_object()) {
            for (signal, count) in by_signal {
                println!("    {signal}: {count}");
            }
        }
    } else {
        println!("No previous session data found.");
    }
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
