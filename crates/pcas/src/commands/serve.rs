//! Serve command - starts the PCAS server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::{info, warn};

use pcas_bus::{BusConfig, EventBus};
use pcas_policy::{Engine, Policy};
use pcas_providers::{
    MockProvider, MockStreamProvider, OllamaProvider, OpenAiConfig, OpenAiEmbedder,
    OpenAiProvider, ProviderHandle, ProviderKind, ProviderRegistry, SharedEmbedder,
};
use pcas_server::{Server, ServerConfig};
use pcas_storage::EventStore;

/// Arguments for the serve command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Host to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the server to
    #[arg(short, long, default_value_t = 50051)]
    pub port: u16,

    /// Path to the SQLite database
    #[arg(long, default_value = "pcas.db")]
    pub db_path: PathBuf,

    /// Path to the policy file
    #[arg(long, default_value = "policy.yaml")]
    pub policy: PathBuf,
}

/// Run the serve command.
pub async fn run(args: ServeArgs) -> Result<()> {
    let engine = Engine::load(&args.policy)
        .with_context(|| format!("failed to load policy from {}", args.policy.display()))?;
    info!(
        providers = engine.policy().providers.len(),
        rules = engine.policy().rules.len(),
        "Policy loaded"
    );

    let registry = build_registry(engine.policy())?;
    let storage = Arc::new(
        EventStore::open(&args.db_path)
            .with_context(|| format!("failed to open database at {}", args.db_path.display()))?,
    );

    let embedder: Option<SharedEmbedder> = match OpenAiEmbedder::from_env() {
        Ok(embedder) => Some(Arc::new(embedder)),
        Err(err) => {
            warn!(
                error = %err,
                "No embedding backend; vector search and RAG are disabled"
            );
            None
        }
    };

    let config = BusConfig::from_env();
    if config.rag_enabled {
        info!("RAG enrichment enabled");
    }

    let bus = Arc::new(EventBus::new(
        storage,
        Arc::new(engine),
        Arc::new(registry),
        embedder,
        config,
    ));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.host, args.port))?;
    let server = Server::new(bus, ServerConfig::new().with_bind_address(addr));

    server.run().await.context("server exited with error")?;
    Ok(())
}

/// Construct provider handles from the policy's provider declarations.
fn build_registry(policy: &Policy) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    for config in &policy.providers {
        let name = config.name.clone();
        match config.provider_type.as_str() {
            "mock" => {
                registry.register(
                    &name,
                    ProviderHandle::unary(ProviderKind::Mock, Arc::new(MockProvider::new(&name))),
                );
            }
            "mock-stream" => {
                registry.register(
                    &name,
                    ProviderHandle::unary(ProviderKind::Mock, Arc::new(MockProvider::new(&name)))
                        .with_streaming(Arc::new(MockStreamProvider::new(&name))),
                );
            }
            "ollama" => {
                let base_url = config
                    .options
                    .get("base_url")
                    .and_then(|v| v.as_str())
                    .unwrap_or("http://localhost:11434")
                    .to_string();
                let provider = OllamaProvider::new(&name, base_url)
                    .with_context(|| format!("failed to build ollama provider {name}"))?;
                registry.register(
                    &name,
                    ProviderHandle::unary(ProviderKind::Local, Arc::new(provider)),
                );
            }
            "openai" => match OpenAiConfig::from_env() {
                Ok(mut openai_config) => {
                    if let Some(model) = config.options.get("model").and_then(|v| v.as_str()) {
                        openai_config = openai_config.with_model(model);
                    }
                    if let Some(url) = config.options.get("base_url").and_then(|v| v.as_str()) {
                        openai_config = openai_config.with_base_url(url);
                    }
                    let provider = OpenAiProvider::new(&name, openai_config)
                        .with_context(|| format!("failed to build openai provider {name}"))?;
                    registry.register(
                        &name,
                        ProviderHandle::unary(ProviderKind::Llm, Arc::new(provider)),
                    );
                }
                Err(err) => {
                    warn!(
                        provider = %name,
                        error = %err,
                        "Skipping OpenAI provider (no API key)"
                    );
                }
            },
            other => {
                warn!(provider = %name, provider_type = %other, "Unknown provider type, skipping");
            }
        }
    }

    info!(count = registry.len(), "Providers registered");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_registry_from_policy() {
        let policy = Policy::from_yaml(
            r#"
providers:
  - name: mock-provider
    type: mock
  - name: echo-stream
    type: mock-stream
  - name: local-llama
    type: ollama
    base_url: http://localhost:11434
  - name: something-new
    type: quantum
"#,
        )
        .unwrap();

        let registry = build_registry(&policy).unwrap();
        assert!(registry.get("mock-provider").is_some());
        assert!(registry.get("echo-stream").unwrap().streaming().is_some());
        assert!(registry.get("local-llama").is_some());
        // Unknown types are skipped, not fatal.
        assert!(registry.get("something-new").is_none());
    }
}
