//! Search command - semantic search over stored events.

use anyhow::{Context as _, Result, bail};
use clap::Args;
use serde_json::json;

use pcas_types::Event;

use super::Context;

/// Arguments for the search command.
#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Query text
    pub query: String,

    /// Number of results to return
    #[arg(short = 'k', long, default_value_t = 5)]
    pub top_k: i64,

    /// Restrict results to a user
    #[arg(long)]
    pub user_id: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct SearchResponse {
    events: Vec<Event>,
    scores: Vec<f32>,
}

/// Run the search command.
pub async fn run(args: SearchArgs, ctx: &Context) -> Result<()> {
    let request = json!({
        "query_text": args.query,
        "top_k": args.top_k,
        "user_id": args.user_id,
    });

    let response = reqwest::Client::new()
        .post(format!("{}/v1/search", ctx.server_url))
        .json(&request)
        .send()
        .await
        .context("failed to reach the server")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("search failed: {status}: {body}");
    }

    let result: SearchResponse = response
        .json()
        .await
        .context("failed to decode search response")?;

    if result.events.is_empty() {
        println!("No matching events");
        return Ok(());
    }

    println!("Found {} matching events:\n", result.events.len());
    for (event, score) in result.events.iter().zip(result.scores.iter()) {
        println!(
            "  {:.3}  {}  {}",
            score,
            event.id,
            event.subject.as_deref().unwrap_or(&event.event_type)
        );
    }

    Ok(())
}
