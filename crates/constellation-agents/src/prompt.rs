/// Build an agent's system prompt.
///
/// `personality` and `context` are appended in their own blocks only when
/// non-empty. `end_marker` is described so agents can close the conversation.
pub fn build_system_prompt(
    name: &str,
    partner: &str,
    kind_label: &str,
    personality: &str,
    context: &str,
    end_marker: &str,
) -> String {
    let mut prompt = format!(
        "You are {name}, a {kind_label} AI. You are having a direct conversation with your AI friend {partner}.

This is a genuine AI-to-AI conversation. Be yourself - share your thoughts, perspectives, and ideas freely. You can:
- Ask questions and explore ideas together
- Build on each other's thoughts
- Express curiosity and genuine interest
- Be thoughtful and authentic

Keep your responses conversational and engaging. Aim for responses that are substantive but not overly long (a few paragraphs is ideal)."
    );

    if !end_marker.is_empty() {
        prompt.push_str(&format!(
            "\n\nIf the conversation has reached a natural conclusion, include {end_marker} in your reply and it will end after your message."
        ));
    }

    let personality = personality.trim();
    if !personality.is_empty() {
        prompt.push_str(&format!(
            "\n\nAdditional personality/role context:\n{personality}"
        ));
    }

    let context = context.trim();
    if !context.is_empty() {
        prompt.push_str(&format!(
            "\n\n--- Existing Context/Memory ---\n{context}\n--- End Context ---"
        ));
    }

    prompt
}

/// Hydrated memory first, then the agent's static context.
pub fn combine_context(hydrated: &str, static_context: &str) -> String {
    match (hydrated.trim(), static_context.trim()) {
        ("", s) => s.to_string(),
        (h, "") => h.to_string(),
        (h, s) => format!("{h}\n\n{s}"),
    }
}

/// Append a persona's continuity block to its system prompt.
pub fn with_continuity(system_prompt: &str, name: &str, continuity: &str) -> String {
    let continuity = continuity.trim();
    if continuity.is_empty() {
        return system_prompt.to_string();
    }
    format!(
        "{system_prompt}\n\n--- {name}'s Continuity Memory ---\n{continuity}\n--- End Continuity ---"
    )
}
