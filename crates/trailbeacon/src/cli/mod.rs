//! Command-line interface for trailbeacon.
//!
//! This module provides the CLI structure for the `trailbeacon` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, ContactCommand, QueueCommand, StatusCommand};

/// trailbeacon - Report this device's location, reliably
///
/// Samples the device position on a fixed cadence, queues it durably and
/// delivers it to a remote collector with backoff. Texts an emergency contact
/// when delivery keeps failing.
#[derive(Debug, Parser)]
#[command(name = "trailbeacon")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the reporting pipeline in the foreground until interrupted
    Run,

    /// Show queue and delivery status
    Status(StatusCommand),

    /// Inspect the delivery queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Show this device's identity
    Device,

    /// Manage the emergency contact
    #[command(subcommand)]
    Contact(ContactCommand),

    /// Text the emergency contact with the last known location now
    Alert,

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
