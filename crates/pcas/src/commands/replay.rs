//! Replay command - re-publish a historical event from the database.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Args;

use pcas_storage::GraphStore;

use super::Context;

/// Arguments for the replay command.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Identifier of the event to replay
    pub event_id: String,

    /// Path to the SQLite database
    #[arg(long, default_value = "pcas.db")]
    pub db_path: PathBuf,
}

/// Run the replay command.
///
/// Reads the event straight from the database (not through the server) and
/// re-publishes it, which is useful for testing and for tracing causality
/// chains.
pub async fn run(args: ReplayArgs, ctx: &Context) -> Result<()> {
    let store = GraphStore::open(&args.db_path)
        .with_context(|| format!("failed to open database at {}", args.db_path.display()))?;
    let event = store
        .get_event(&args.event_id)
        .with_context(|| format!("event {} not found", args.event_id))?;

    println!(
        "Replaying event {} (type={}, source={})",
        event.id, event.event_type, event.source
    );

    let response = reqwest::Client::new()
        .post(format!("{}/v1/events", ctx.server_url))
        .json(&event)
        .send()
        .await
        .context("failed to reach the server")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("replay failed: {status}: {body}");
    }

    println!("Event replayed successfully");
    Ok(())
}
