//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Queue inspection commands.
#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// List queued samples, oldest first
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Emergency contact commands.
#[derive(Debug, Subcommand)]
pub enum ContactCommand {
    /// Set the emergency contact
    Set {
        /// Contact name
        name: String,
        /// Phone number the alert is texted to
        phone: String,
    },

    /// Show the emergency contact
    Show,

    /// Remove the emergency contact
    Clear,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
