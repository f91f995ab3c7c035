use constellation_common::{AgentKind, AgentProfile, AgentSlot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::loader::ConfigLoader;

/// In-band token an agent emits to close the conversation.
pub const DEFAULT_END_MARKER: &str = "[END_CONVERSATION]";

/// Top-level configuration, usually read from `~/.constellation/config.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub memory: MemoryConfig,
    pub relay: RelayConfig,
}

/// Shared provider credentials and endpoints used when an agent does not
/// bring its own key.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: Option<String>,
    pub xai_base_url: String,
    pub max_tokens: u32,
    /// Sampling temperature; the provider default applies when unset.
    pub temperature: Option<f64>,
    pub retry: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            anthropic_base_url: None,
            openrouter_api_key: None,
            openrouter_base_url: None,
            xai_base_url: "https://api.x.ai/v1".to_string(),
            max_tokens: 8192,
            temperature: None,
            retry: RetryConfig::default(),
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("anthropic_api_key", &mask(&self.anthropic_api_key))
            .field("anthropic_base_url", &self.anthropic_base_url)
            .field("openrouter_api_key", &mask(&self.openrouter_api_key))
            .field("openrouter_base_url", &self.openrouter_base_url)
            .field("xai_base_url", &self.xai_base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Backoff settings for rate-limited provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub database_path: Option<PathBuf>,
    pub memory_limit: usize,
    pub include_archive: bool,
    pub compact: bool,
    pub diary_budget_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: None,
            memory_limit: 15,
            include_archive: true,
            compact: true,
            diary_budget_chars: 2_000,
        }
    }
}

impl MemoryConfig {
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| ConfigLoader::default_config_dir().join("memory.db"))
    }
}

/// One relay participant: its persisted profile plus an optional private key.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub profile: AgentProfile,
    /// Never serialized, so persisted configs cannot leak it.
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
}

impl AgentConfig {
    pub fn new(kind: AgentKind, name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            profile: AgentProfile::new(kind, name, model),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_static_context(mut self, context: impl Into<String>) -> Self {
        self.profile.static_context = context.into();
        self
    }

    pub fn with_personality(mut self, prompt: impl Into<String>) -> Self {
        self.profile.personality_prompt = prompt.into();
        self
    }

    pub fn kind(&self) -> AgentKind {
        self.profile.kind
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn model(&self) -> &str {
        &self.profile.model
    }

    /// The caller-supplied key, ignoring blank values.
    pub fn credential(&self) -> Option<&str> {
        self.credential
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("profile", &self.profile)
            .field("credential", &mask(&self.credential))
            .finish()
    }
}

/// Relay construction input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub agent1: AgentConfig,
    pub agent2: AgentConfig,
    /// Pause between turns.
    pub delay_seconds: u64,
    pub use_persistent_memory: bool,
    /// Send agents with their own key straight to the vendor API instead of
    /// the shared router.
    pub use_alternate_credential_routing: bool,
    /// Hydration topic; when unset, the kickoff message is used.
    pub topic: Option<String>,
    pub end_marker: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            agent1: AgentConfig::new(AgentKind::Claude, "Claude", "claude-opus-4-1"),
            agent2: AgentConfig::new(AgentKind::Grok, "Grok", "x-ai/grok-4.1-fast"),
            delay_seconds: 5,
            use_persistent_memory: false,
            use_alternate_credential_routing: true,
            topic: None,
            end_marker: DEFAULT_END_MARKER.to_string(),
        }
    }
}

impl RelayConfig {
    pub fn agent(&self, slot: AgentSlot) -> &AgentConfig {
        match slot {
            AgentSlot::Agent1 => &self.agent1,
            AgentSlot::Agent2 => &self.agent2,
        }
    }

    pub fn agent_mut(&mut self, slot: AgentSlot) -> &mut AgentConfig {
        match slot {
            AgentSlot::Agent1 => &mut self.agent1,
            AgentSlot::Agent2 => &mut self.agent2,
        }
    }

    pub fn without_credentials(&self) -> Self {
        let mut config = self.clone();
        config.agent1.credential = None;
        config.agent2.credential = None;
        config
    }

    /// JSON form stored alongside saved conversations.
    pub fn persisted_json(&self) -> serde_json::Value {
        serde_json::to_value(self.without_credentials()).unwrap_or(serde_json::Value::Null)
    }
}

fn mask(value: &Option<String>) -> &'static str {
    match value {
        Some(_) => "<set>",
        None => "<unset>",
    }
}
