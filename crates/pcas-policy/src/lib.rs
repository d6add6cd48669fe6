//! Declarative routing policy for the PCAS event bus.
//!
//! A policy document lists the providers the server should construct and the
//! rules mapping event types to them. Rules are evaluated top to bottom and
//! the first match wins; no match means "no routing configured", which the
//! bus treats as an acknowledged drop, not an error.
//!
//! ```yaml
//! version: v1
//! providers:
//!   - name: mock-provider
//!     type: mock
//!   - name: openai-gpt4
//!     type: openai
//! rules:
//!   - name: echo
//!     if:
//!       event_type: pcas.echo.v1
//!     then:
//!       provider: mock-provider
//!   - name: notes
//!     if:
//!       any_of:
//!         - event_type: user.note.v1
//!         - event_type: user.memory.v1
//!     then:
//!       provider: openai-gpt4
//!       prompt_template: summarise
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use pcas_types::Event;

/// Result type alias using the policy error type.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Error type for policy loading.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy file could not be read.
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    /// The policy file is not valid YAML.
    #[error("failed to parse policy file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Document Types
// ─────────────────────────────────────────────────────────────────────────────

/// A provider declaration: name, type, and type-specific options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name rules refer to.
    pub name: String,
    /// Provider type: `mock`, `mock-stream`, `ollama`, `openai`.
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Type-specific configuration, passed through to the constructor.
    #[serde(flatten)]
    pub options: HashMap<String, serde_yaml::Value>,
}

/// Condition part of a rule: a single event type or any of a list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Condition {
    /// Matches exactly this event type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Matches when any listed condition matches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<Condition>,
}

impl Condition {
    fn matches(&self, event_type: &str) -> bool {
        if let Some(ref t) = self.event_type {
            if t == event_type {
                return true;
            }
        }
        self.any_of.iter().any(|c| c.matches(event_type))
    }
}

/// Action part of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Provider to route matching events to.
    pub provider: String,
    /// Optional prompt template name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
}

/// A single routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Human-readable rule name, used in logs only.
    #[serde(default)]
    pub name: String,
    /// Condition to match.
    #[serde(rename = "if")]
    pub condition: Condition,
    /// Action to take on match.
    #[serde(rename = "then")]
    pub action: Action,
}

/// The whole policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Document version tag.
    #[serde(default)]
    pub version: String,
    /// Providers the server should construct.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Routing rules, evaluated in order.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Policy {
    /// Parse a policy from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a policy from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Routing decision produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Selected provider name.
    pub provider: String,
    /// Optional prompt template carried by the matching rule.
    pub prompt_template: Option<String>,
}

/// The policy evaluation engine.
///
/// Resolution is total and deterministic: rules are walked top to bottom,
/// the first match wins, and `None` means no rule matched. The engine never
/// rewrites the event itself.
pub struct Engine {
    policy: Policy,
}

impl Engine {
    /// Create an engine over a parsed policy.
    ///
    /// Rule actions naming providers absent from the `providers` section are
    /// reported as warnings; they are not fatal because the registry may be
    /// populated from elsewhere.
    pub fn new(policy: Policy) -> Self {
        let declared: HashSet<&str> = policy.providers.iter().map(|p| p.name.as_str()).collect();
        for rule in &policy.rules {
            if !declared.contains(rule.action.provider.as_str()) {
                warn!(
                    rule = %rule.name,
                    provider = %rule.action.provider,
                    "Rule references a provider not declared in the policy"
                );
            }
        }
        Self { policy }
    }

    /// Load a policy file and build an engine from it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Policy::load(path)?))
    }

    /// The underlying policy document.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Select a provider for a full event.
    pub fn select_provider(&self, event: &Event) -> Option<Route> {
        self.select_provider_for_stream(&event.event_type)
    }

    /// Streaming variant: select by event type alone, used during stream
    /// negotiation before any full event exists.
    pub fn select_provider_for_stream(&self, event_type: &str) -> Option<Route> {
        self.policy
            .rules
            .iter()
            .find(|rule| rule.condition.matches(event_type))
            .map(|rule| Route {
                provider: rule.action.provider.clone(),
                prompt_template: rule.action.prompt_template.clone(),
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
