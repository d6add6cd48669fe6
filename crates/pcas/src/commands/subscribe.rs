//! Subscribe command - stream events from the bus to stdout.

use anyhow::{Context as _, Result};
use clap::Args;
use futures::StreamExt;

use pcas_types::Event;

use super::Context;

/// Arguments for the subscribe command.
#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Client identifier (default: a generated one)
    #[arg(long)]
    pub client_id: Option<String>,
}

/// Run the subscribe command.
pub async fn run(args: SubscribeArgs, ctx: &Context) -> Result<()> {
    let client_id = args
        .client_id
        .unwrap_or_else(|| format!("pcasctl-{}", &uuid::Uuid::new_v4().to_string()[..8]));

    let url = format!("{}/v1/subscribe?client_id={}", ctx.server_url, client_id);
    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .context("failed to reach the server")?
        .error_for_status()
        .context("subscribe request rejected")?;

    println!("Subscribed as {client_id}, waiting for events (ctrl-c to stop)...");

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("subscription stream failed")?;
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            match serde_json::from_slice::<Event>(&line[..line.len() - 1]) {
                Ok(event) => {
                    println!(
                        "[{}] {} (id={}, correlation={})",
                        event
                            .time
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string()),
                        event.event_type,
                        event.id,
                        event.correlation_id.as_deref().unwrap_or("-"),
                    );
                    if let Some(map) = event.data.as_structured() {
                        println!("  {}", serde_json::to_string(map)?);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Skipping malformed event line");
                }
            }
        }
    }

    println!("Stream closed by server");
    Ok(())
}
