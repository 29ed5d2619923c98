//! `trailbeacon` - CLI for the location reporting pipeline
//!
//! Runs the pipeline in the foreground and manages the device settings it
//! reads: identity, emergency contact and the delivery queue.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use trailbeacon::cli::{Cli, Command, ConfigCommand, ContactCommand, QueueCommand};
use trailbeacon::pipeline::sms_channel;
use trailbeacon::storage::KEY_DEVICE_ID;
use trailbeacon::{
    init_logging, Config, DeviceIdentity, DurableQueue, EmergencyContact, FallbackNotifier,
    Pipeline, PipelineEvent, Storage,
};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    // Path and validate must work even when the active config is broken.
    if let Command::Config(ConfigCommand::Path) = &cli.command {
        println!("{}", Config::default_config_path().display());
        return Ok(());
    }
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        return handle_validate(file.clone().or_else(|| cli.config.clone()));
    }

    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Run => runtime()?.block_on(run_pipeline(&config)),
        Command::Status(status_cmd) => handle_status(&config, status_cmd.json),
        Command::Queue(QueueCommand::List { json }) => handle_queue_list(&config, json),
        Command::Device => handle_device(&config),
        Command::Contact(contact_cmd) => handle_contact(&config, contact_cmd),
        Command::Alert => runtime()?.block_on(handle_alert(&config)),
        Command::Config(config_cmd) => handle_config(&config, &config_cmd),
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start async runtime")
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<Storage>> {
    let path = config.database_path();
    let storage = Storage::open(&path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    Ok(Arc::new(storage))
}

async fn run_pipeline(config: &Config) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let handle = Pipeline::from_config(config, storage)?.start();
    let mut events = handle.subscribe();

    println!("trailbeacon running. Press Ctrl-C to stop.");
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(PipelineEvent::FallbackFailed { error }) => {
                    eprintln!("Emergency message could not be sent: {error}");
                }
                Ok(PipelineEvent::FallbackNotified { .. }) => {
                    eprintln!("Location reports are failing; emergency contact has been notified.");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event listener fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    handle.stop().await;
    Ok(())
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let stats = storage.stats()?;
    let last_success = storage.last_success_at()?;
    let queue = DurableQueue::new(Arc::clone(&storage), config.queue.capacity);
    let last_known = queue.last_known_sample()?;
    let device_id = storage.get_meta(KEY_DEVICE_ID)?;
    let contact = EmergencyContact::load(&storage)?;

    if json {
        let status = serde_json::json!({
            "deviceId": device_id,
            "databasePath": config.database_path(),
            "queueDepth": stats.queue_depth,
            "queueCapacity": queue.capacity(),
            "oldestQueued": stats.oldest_entry,
            "newestQueued": stats.newest_entry,
            "databaseSizeBytes": stats.db_size_bytes,
            "lastSuccessAt": last_success,
            "lastKnownSample": last_known,
            "contactConfigured": contact.is_some(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("trailbeacon status");
        println!("------------------");
        println!(
            "Device:        {}",
            device_id.as_deref().unwrap_or("(not yet generated)")
        );
        println!(
            "Database:      {} ({} bytes)",
            config.database_path().display(),
            stats.db_size_bytes
        );
        println!("Queue:         {} / {}", stats.queue_depth, queue.capacity());
        if let Some(oldest) = stats.oldest_entry {
            println!("Oldest queued: {}", oldest.to_rfc3339());
        }
        if let Some(newest) = stats.newest_entry {
            println!("Newest queued: {}", newest.to_rfc3339());
        }
        match last_success {
            Some(at) => println!("Last success:  {}", at.to_rfc3339()),
            None => println!("Last success:  never"),
        }
        match last_known {
            Some(s) => println!(
                "Last location: {}, {} ({})",
                s.latitude,
                s.longitude,
                s.timestamp_iso()
            ),
            None => println!("Last location: none"),
        }
        println!(
            "Contact:       {}",
            if contact.is_some() { "configured" } else { "not configured" }
        );
    }
    Ok(())
}

fn handle_queue_list(config: &Config, json: bool) -> anyhow::Result<()> {
    let queue = DurableQueue::new(open_storage(config)?, config.queue.capacity);
    let entries = queue.drain_all()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    println!(
        "{:>8}  {:<24}  {:>11}  {:>12}  {:>8}",
        "SEQ", "CAPTURED", "LATITUDE", "LONGITUDE", "ATTEMPTS"
    );
    for entry in &entries {
        println!(
            "{:>8}  {:<24}  {:>11.6}  {:>12.6}  {:>8}",
            entry.sequence_id,
            entry.sample.timestamp_iso(),
            entry.sample.latitude,
            entry.sample.longitude,
            entry.attempts
        );
    }
    Ok(())
}

fn handle_device(config: &Config) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let identity = DeviceIdentity::load_or_create(&storage)?;
    println!("{}", identity.device_id);
    Ok(())
}

fn handle_contact(config: &Config, cmd: ContactCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    match cmd {
        ContactCommand::Set { name, phone } => {
            let contact = EmergencyContact::new(name, phone)?;
            contact.save(&storage)?;
            println!(
                "Emergency contact set: {} ({})",
                contact.name, contact.phone_number
            );
        }
        ContactCommand::Show => match EmergencyContact::load(&storage)? {
            Some(contact) => println!("{} ({})", contact.name, contact.phone_number),
            None => println!("No emergency contact configured."),
        },
        ContactCommand::Clear => {
            if EmergencyContact::clear(&storage)? {
                println!("Emergency contact removed.");
            } else {
                println!("No emergency contact configured.");
            }
        }
    }
    Ok(())
}

async fn handle_alert(config: &Config) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let notifier = FallbackNotifier::new(storage, sms_channel(config)?);
    let sample = notifier.alert_last_known().await?;
    println!(
        "Emergency message sent with location {}, {}.",
        sample.latitude, sample.longitude
    );
    Ok(())
}

fn handle_validate(path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => println!("Configuration is valid."),
        Err(e) => println!("Configuration error: {e}"),
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Sampling]");
                println!("  Interval (s):       {}", config.sampling.interval_secs);
                println!(
                    "  Fix timeout (s):    {}",
                    config.sampling.acquisition_timeout_secs
                );
                println!("  Source:             {:?}", config.sampling.source);
                println!();
                println!("[Queue]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Capacity:           {}", config.queue.capacity);
                println!();
                println!("[Collector]");
                println!("  URL:                {}", config.collector.url);
                println!("  Send timeout (s):   {}", config.collector.send_timeout_secs);
                println!();
                println!("[Retry]");
                println!("  Base delay (s):     {}", config.retry.base_delay_secs);
                println!("  Max delay (s):      {}", config.retry.max_delay_secs);
                println!("  Failure threshold:  {}", config.retry.failure_threshold);
                println!();
                println!("[Fallback]");
                println!(
                    "  SMS gateway:        {}",
                    config
                        .fallback
                        .sms_gateway_url
                        .as_deref()
                        .unwrap_or("(none, SMS unavailable)")
                );
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => handle_validate(file.clone())?,
    }
    Ok(())
}
