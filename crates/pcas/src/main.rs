//! PCAS - Personal Central AI System
//!
//! Main entry point for the `pcas` CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{Context, emit, replay, search, serve, subscribe};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// PCAS, the local-first event bus and decision-making engine
#[derive(Parser)]
#[command(name = "pcas")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Server URL for client subcommands
    #[arg(long, global = true, env = "PCAS_SERVER_URL")]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the PCAS server
    Serve(serve::ServeArgs),

    /// Emit an event to the bus and wait for its response
    Emit(emit::EmitArgs),

    /// Stream events from the bus
    Subscribe(subscribe::SubscribeArgs),

    /// Semantic search across stored events
    Search(search::SearchArgs),

    /// Re-publish a historical event from the database
    Replay(replay::ReplayArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "pcas=debug,pcas_bus=debug,pcas_server=debug,pcas_storage=debug,pcas_providers=debug,info"
    } else {
        "pcas=info,pcas_bus=info,pcas_server=info,pcas_storage=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let ctx = Context {
        server_url: cli
            .server
            .unwrap_or_else(|| "http://127.0.0.1:50051".to_string()),
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Serve(args) => serve::run(args).await,
        Commands::Emit(args) => emit::run(args, &ctx).await,
        Commands::Subscribe(args) => subscribe::run(args, &ctx).await,
        Commands::Search(args) => search::run(args, &ctx).await,
        Commands::Replay(args) => replay::run(args, &ctx).await,
    }
}
