mod commands;
mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::CliConfig;
use roompot_core::RoomError;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "roompot")]
#[command(about = "Roompot - staked game rooms with escrowed prize pools")]
#[command(version)]
struct Cli {
    /// Data directory for the room database
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine config file (defaults to <data-dir>/roompot.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wallet deposits, balances and history
    #[command(subcommand)]
    Wallet(commands::WalletCommands),

    /// Room lifecycle commands
    #[command(subcommand)]
    Room(commands::RoomCommands),

    /// Start due rooms and settle expired ones
    Scan {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },

    /// Rooms whose ledger and store diverged
    #[command(subcommand)]
    Reconcile(commands::ReconcileCommands),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "roompot={},roompot_core={}",
            log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("roompot")
    });
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;

    let config = CliConfig::load(data_dir, cli.config)?;
    let manager = config.build_manager().await?;

    let result = match cli.command {
        Commands::Wallet(cmd) => commands::handle_wallet_command(cmd, &manager).await,
        Commands::Room(cmd) => commands::handle_room_command(cmd, &manager).await,
        Commands::Scan { once } => commands::handle_scan(once, manager.clone()).await,
        Commands::Reconcile(cmd) => commands::handle_reconcile_command(cmd, &manager).await,
    };

    if let Err(e) = result {
        match e {
            RoomError::RoomNotFound { room_id } => {
                eprintln!("Error: Room '{}' not found", room_id);
                eprintln!("Use 'roompot room list' to see available rooms");
            }
            RoomError::InsufficientFunds { need, available } => {
                eprintln!("Error: Insufficient funds");
                eprintln!("Need: {} units, Available: {} units", need, available);
            }
            RoomError::PartialInconsistency(msg) => {
                eprintln!("Error: Ledger and store disagree: {}", msg);
                eprintln!("Use 'roompot reconcile list' to inspect flagged rooms");
            }
            _ => {
                eprintln!("Error: {}", e);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
