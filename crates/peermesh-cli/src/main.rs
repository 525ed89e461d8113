//! Peermesh command-line shell.
//!
//! A thin operational surface over the core: identity management and a
//! multi-node in-process demo of discovery, messaging, and groups.
//! Identity is generated automatically on first run.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// Peermesh - serverless, end-to-end encrypted peer messaging
#[derive(Parser)]
#[command(name = "peermesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.peermesh")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new identity (happens automatically on first run)
    Init {
        /// Force overwrite existing identity
        #[arg(short, long)]
        force: bool,
    },

    /// Show current identity information
    Identity,

    /// List saved contacts
    Contacts,

    /// List saved groups
    Groups,

    /// Run an in-process multi-node demo of the overlay
    Demo {
        /// Number of peers to simulate
        #[arg(short, long, default_value = "3")]
        peers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = shellexpand_home(&cli.data_dir);

    match cli.command {
        Commands::Init { force } => commands::init(&data_dir, force),
        Commands::Identity => commands::identity(&data_dir),
        Commands::Contacts => commands::contacts(&data_dir),
        Commands::Groups => commands::groups(&data_dir),
        Commands::Demo { peers } => commands::demo(peers).await,
    }
}

fn shellexpand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}/{rest}"),
        _ => path.to_string(),
    }
}
