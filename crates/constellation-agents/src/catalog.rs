use constellation_common::AgentKind;

/// A selectable model: display label and the id sent to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOption {
    pub label: &'static str,
    pub model: &'static str,
}

const fn option(label: &'static str, model: &'static str) -> ModelOption {
    ModelOption { label, model }
}

pub const CLAUDE_MODELS: &[ModelOption] = &[
    option("Claude Opus 4.5", "claude-opus-4-5"),
    option("Claude Opus 4.1", "claude-opus-4-1"),
    option("Claude Opus 4", "claude-opus-4-0"),
    option("Claude Sonnet 4.5", "claude-sonnet-4-5"),
    option("Claude Haiku 4.5", "claude-haiku-4-5"),
];

/// Grok models as routed through OpenRouter.
pub const GROK_MODELS: &[ModelOption] = &[
    option("Grok 4.1", "x-ai/grok-4.1"),
    option("Grok 4.1 Fast", "x-ai/grok-4.1-fast"),
    option("Grok 4.1 Fast (Reasoning)", "x-ai/grok-4.1-fast-reasoning"),
    option("Grok 4 Fast", "x-ai/grok-4-fast"),
    option("Grok 4", "x-ai/grok-4"),
    option("Grok 3", "x-ai/grok-3"),
    option("Grok 3 Mini", "x-ai/grok-3-mini"),
];

/// Grok models as named by the xAI API itself.
pub const XAI_GROK_MODELS: &[ModelOption] = &[
    option("Grok 4", "grok-4"),
    option("Grok 4 (Latest)", "grok-4-latest"),
    option("Grok 4.1 Fast", "grok-4-1-fast"),
    option("Grok 3", "grok-3"),
    option("Grok 3 (Latest)", "grok-3-latest"),
    option("Grok 3 Mini", "grok-3-mini"),
    option("Grok 2", "grok-2"),
    option("Grok 2 Mini", "grok-2-mini"),
];

pub const PASCAL_MODELS: &[ModelOption] = &[
    option("Pascal (Opus 4.5)", "claude-opus-4-5"),
    option("Pascal (Opus 4.1)", "claude-opus-4-1"),
    option("Pascal (Sonnet 4.5)", "claude-sonnet-4-5"),
];

pub fn models_for(kind: AgentKind) -> &'static [ModelOption] {
    match kind {
        AgentKind::Claude => CLAUDE_MODELS,
        AgentKind::Grok => GROK_MODELS,
        AgentKind::Pascal => PASCAL_MODELS,
    }
}

/// Models available when the agent talks to its vendor directly.
pub fn direct_models_for(kind: AgentKind) -> Option<&'static [ModelOption]> {
    match kind {
        AgentKind::Grok => Some(XAI_GROK_MODELS),
        AgentKind::Claude | AgentKind::Pascal => None,
    }
}

pub fn default_model(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Claude | AgentKind::Pascal => "claude-opus-4-1",
        AgentKind::Grok => "x-ai/grok-4.1-fast",
    }
}

/// Accept either a catalog label (case-insensitive) or a raw model id.
/// Unknown ids pass through so newer models work without a catalog update.
pub fn resolve_model(kind: AgentKind, input: &str) -> String {
    let input = input.trim();
    models_for(kind)
        .iter()
        .chain(direct_models_for(kind).unwrap_or_default())
        .find(|option| option.label.eq_ignore_ascii_case(input))
        .map(|option| option.model.to_string())
        .unwrap_or_else(|| input.to_string())
}
