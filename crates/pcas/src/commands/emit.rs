//! Emit command - publish an event and wait for its correlated response.

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use futures::StreamExt;
use tracing::debug;

use pcas_types::{Event, EventData};

use super::Context;

/// Arguments for the emit command.
#[derive(Args, Debug)]
pub struct EmitArgs {
    /// Event type, e.g. pcas.echo.v1
    #[arg(short = 't', long = "type")]
    pub event_type: String,

    /// Event source
    #[arg(long, default_value = "pcasctl")]
    pub source: String,

    /// Event subject
    #[arg(long)]
    pub subject: Option<String>,

    /// Structured payload as a JSON object
    #[arg(short = 'd', long)]
    pub data: Option<String>,

    /// Trace identifier to propagate
    #[arg(long)]
    pub trace_id: Option<String>,

    /// User identifier
    #[arg(long)]
    pub user_id: Option<String>,

    /// Session identifier
    #[arg(long)]
    pub session_id: Option<String>,

    /// Seconds to wait for the correlated response (0 = don't wait)
    #[arg(long, default_value_t = 10)]
    pub wait: u64,
}

/// Run the emit command.
pub async fn run(args: EmitArgs, ctx: &Context) -> Result<()> {
    let mut event = Event::new(&args.event_type, &args.source);
    if let Some(subject) = args.subject {
        event = event.with_subject(subject);
    }
    if let Some(trace_id) = args.trace_id {
        event = event.with_trace_id(trace_id);
    }
    if let Some(user_id) = args.user_id {
        event = event.with_user_id(user_id);
    }
    if let Some(session_id) = args.session_id {
        event = event.with_session_id(session_id);
    }
    if let Some(data) = args.data {
        let value: serde_json::Value =
            serde_json::from_str(&data).context("--data must be valid JSON")?;
        event = event.with_data(EventData::structured(value));
    }

    let client = reqwest::Client::new();

    // Subscribe before publishing so the response cannot be missed.
    let subscription = if args.wait > 0 {
        let client_id = format!("pcasctl-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let url = format!(
            "{}/v1/subscribe?client_id={}",
            ctx.server_url, client_id
        );
        let response = client
            .get(&url)
            .send()
            .await
            .context("failed to subscribe for the response")?
            .error_for_status()
            .context("subscribe request rejected")?;
        Some(response.bytes_stream())
    } else {
        None
    };

    let publish = client
        .post(format!("{}/v1/events", ctx.server_url))
        .json(&event)
        .send()
        .await
        .context("failed to reach the server")?;
    if !publish.status().is_success() {
        let status = publish.status();
        let body = publish.text().await.unwrap_or_default();
        bail!("publish failed: {status}: {body}");
    }
    println!("Event published: id={}", event.id);

    let Some(mut stream) = subscription else {
        return Ok(());
    };

    let wait = Duration::from_secs(args.wait);
    let event_id = event.id.clone();
    let response = tokio::time::timeout(wait, async move {
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!(error = %err, "Subscription stream error");
                    return None;
                }
            };
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let Ok(received) = serde_json::from_slice::<Event>(&line[..line.len() - 1])
                else {
                    continue;
                };
                if received.correlation_id.as_deref() == Some(event_id.as_str()) {
                    return Some(received);
                }
            }
        }
        None
    })
    .await;

    match response {
        Ok(Some(response)) => {
            println!("Response received:");
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Ok(None) => println!("Subscription ended without a response"),
        Err(_) => println!("No response within {}s", args.wait),
    }

    Ok(())
}
