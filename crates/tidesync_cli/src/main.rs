//! TideSync CLI
//!
//! Command-line tools for looking inside a TideSync store.
//!
//! # Commands
//!
//! - `inspect` - Show object counts, replication bookkeeping and the device id
//! - `keys` - List the keys of one object type
//! - `identity` - Show or rotate the device signing identity

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TideSync command-line store tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the storage directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Setup name (selects `<setup>.db` inside the storage directory)
    #[arg(global = true, short, long, default_value = tidesync_core::DEFAULT_SETUP)]
    setup: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show object counts and replication state
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List the keys stored under an object type
    Keys {
        /// Object type name
        #[arg(short = 't', long = "type")]
        type_name: String,

        /// Only keys matching this glob pattern
        #[arg(long)]
        pattern: Option<String>,
    },

    /// Show the device signing identity
    Identity {
        /// Encrypted key file
        #[arg(short, long)]
        key_file: PathBuf,

        /// Passphrase protecting the key file
        #[arg(long)]
        passphrase: String,

        /// Replace the signing key with a fresh one
        #[arg(long)]
        rotate: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Storage path required for inspect")?;
            commands::inspect::run(&path, &cli.setup, &format)?;
        }
        Commands::Keys { type_name, pattern } => {
            let path = cli.path.ok_or("Storage path required for keys")?;
            commands::keys::run(&path, &cli.setup, &type_name, pattern.as_deref())?;
        }
        Commands::Identity {
            key_file,
            passphrase,
            rotate,
            format,
        } => {
            commands::identity::run(
                &key_file,
                &passphrase,
                &cli.setup,
                cli.path.as_deref(),
                rotate,
                &format,
            )?;
        }
        Commands::Version => {
            println!("TideSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("TideSync Core v{}", tidesync_core::VERSION);
        }
    }

    Ok(())
}
