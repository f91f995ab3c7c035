use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of agent backends a relay participant can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Grok,
    Pascal,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Claude, AgentKind::Grok, AgentKind::Pascal];

    /// Display label used in persona prompts.
    pub fn label(self) -> &'static str {
        match self {
            AgentKind::Claude => "Claude",
            AgentKind::Grok => "Grok",
            AgentKind::Pascal => "Pascal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(AgentKind::Claude),
            "grok" => Some(AgentKind::Grok),
            "pascal" => Some(AgentKind::Pascal),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Credential-free description of a relay participant.
///
/// This is the shape that is checkpointed and persisted; credentials live only
/// on the runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub static_context: String,
    #[serde(default)]
    pub personality_prompt: String,
}

impl AgentProfile {
    pub fn new(kind: AgentKind, name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            model: model.into(),
            static_context: String::new(),
            personality_prompt: String::new(),
        }
    }
}
