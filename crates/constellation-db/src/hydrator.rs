use std::collections::HashSet;

use tracing::{debug, warn};

use crate::archive::ArchiveHit;
use crate::diary::{ContextDocument, continuity_document_id};
use crate::memory_store::{Memory, MemoryStore};

const IMPORTANT_RECALL_LIMIT: usize = 5;
const IMPORTANT_THRESHOLD: f64 = 0.7;
const STAR_THRESHOLD: f64 = 0.8;
const ARCHIVE_HIT_LIMIT: usize = 3;
const ARCHIVE_HIT_CHARS: usize = 500;

/// Appended to a diary document cut short by the compact budget.
pub const DIGESTED_SUFFIX: &str = "… [digested to memory]";

#[derive(Debug, Clone, PartialEq)]
pub struct HydrateOptions {
    pub memory_limit: usize,
    pub include_archive: bool,
    pub compact: bool,
    /// Character budget for the diary section in compact mode.
    pub diary_budget: usize,
}

impl Default for HydrateOptions {
    fn default() -> Self {
        Self {
            memory_limit: 15,
            include_archive: true,
            compact: true,
            diary_budget: 2_000,
        }
    }
}

/// Assembles the memory preamble injected into an agent's system prompt.
///
/// Every section is best effort: a failing store read is logged and the
/// section is left out, so hydration itself never fails.
pub struct ContextHydrator<'a> {
    store: &'a MemoryStore,
    options: HydrateOptions,
}

impl<'a> ContextHydrator<'a> {
    pub fn new(store: &'a MemoryStore, options: HydrateOptions) -> Self {
        Self { store, options }
    }

    /// Diary, memories and archive hits for `agent`, in that order. Returns
    /// an empty string when there is nothing to inject.
    pub fn hydrate(&self, agent: &str, topic: Option<&str>) -> String {
        let topic = topic.map(str::trim).filter(|t| !t.is_empty());

        let sections: Vec<String> = [
            self.diary_section(agent),
            self.memory_section(agent, topic),
            self.archive_section(topic),
        ]
        .into_iter()
        .flatten()
        .collect();

        debug!(agent, sections = sections.len(), "hydrated context");
        sections.join("\n\n")
    }

    /// Continuity notes and important memories for a persistent persona.
    pub fn continuity(&self, agent: &str) -> String {
        let mut parts = Vec::new();

        match self.store.active_document(&continuity_document_id(agent)) {
            Ok(Some(document)) => {
                parts.push(format!("=== {agent}'s Continuity ===\n{}", document.content.trim()));
            }
            Ok(None) => {}
            Err(e) => warn!("failed to load continuity document for {agent}: {e}"),
        }

        match self
            .store
            .recall_important(IMPORTANT_RECALL_LIMIT, IMPORTANT_THRESHOLD)
        {
            Ok(memories) => {
                let lines: Vec<String> = memories
                    .iter()
                    .filter(|m| m.speaker.eq_ignore_ascii_case(agent))
                    .map(|m| format!("[{}] {}", m.created_at.format("%Y-%m-%d"), m.content))
                    .collect();
                if !lines.is_empty() {
                    parts.push(format!(
                        "=== {agent}'s Important Memories ===\n{}",
                        lines.join("\n")
                    ));
                }
            }
            Err(e) => warn!("failed to recall important memories for {agent}: {e}"),
        }

        parts.join("\n\n")
    }

    fn diary_section(&self, agent: &str) -> Option<String> {
        let documents = match self.store.documents_for_agent(agent) {
            Ok(documents) => documents,
            Err(e) => {
                warn!("context diary unavailable for {agent}: {e}");
                return None;
            }
        };
        render_diary(&documents, self.options.compact, self.options.diary_budget)
    }

    fn memory_section(&self, agent: &str, topic: Option<&str>) -> Option<String> {
        let limit = self.options.memory_limit;
        let mut memories: Vec<Memory> = Vec::new();
        let mut seen = HashSet::new();
        let mut absorb = |batch: Vec<Memory>, memories: &mut Vec<Memory>| {
            for memory in batch {
                if seen.insert(memory.id) {
                    memories.push(memory);
                }
            }
        };

        if let Some(topic) = topic {
            match self.store.search_memories(topic, limit / 2) {
                Ok(batch) => absorb(batch, &mut memories),
                Err(e) => warn!("topic memory search failed: {e}"),
            }
        }

        match self
            .store
            .recall_important(IMPORTANT_RECALL_LIMIT, IMPORTANT_THRESHOLD)
        {
            Ok(batch) => absorb(batch, &mut memories),
            Err(e) => warn!("important memory recall failed: {e}"),
        }

        let remaining = limit.saturating_sub(memories.len());
        if remaining > 0 {
            match self.store.recall_recent(remaining, Some(agent), None) {
                Ok(batch) => absorb(batch, &mut memories),
                Err(e) => warn!("recent memory recall failed for {agent}: {e}"),
            }
        }

        memories.truncate(limit);
        if memories.is_empty() {
            return None;
        }

        let mut lines = vec!["=== Relevant Memories ===".to_string()];
        lines.extend(memories.iter().map(format_memory));
        Some(lines.join("\n"))
    }

    fn archive_section(&self, topic: Option<&str>) -> Option<String> {
        if !self.options.include_archive {
            return None;
        }
        let topic = topic?;

        let hits = match self.store.search_archive(topic, ARCHIVE_HIT_LIMIT) {
            Ok(hits) => hits,
            Err(e) => {
                warn!("archive search failed: {e}");
                return None;
            }
        };
        if hits.is_empty() {
            return None;
        }

        let mut lines = vec!["=== Reference Archive ===".to_string()];
        lines.extend(hits.iter().map(format_archive_hit));
        Some(lines.join("\n"))
    }
}

pub(crate) fn format_memory(memory: &Memory) -> String {
    let star = if memory.importance >= STAR_THRESHOLD {
        "⭐"
    } else {
        ""
    };
    format!(
        "[{}] {} ({}){star}: {}",
        memory.created_at.format("%Y-%m-%d %H:%M"),
        memory.speaker,
        memory.memory_type.as_str(),
        memory.content
    )
}

fn format_archive_hit(hit: &ArchiveHit) -> String {
    let source = hit.title.as_deref().unwrap_or(&hit.conversation_id);
    let content = if hit.content.chars().count() > ARCHIVE_HIT_CHARS {
        let head: String = hit.content.chars().take(ARCHIVE_HIT_CHARS).collect();
        format!("{head}...")
    } else {
        hit.content.clone()
    };
    format!("[{source}] {}: {content}", hit.speaker)
}

/// Render diary documents under one heading each. In compact mode the total
/// document text is held to `budget` characters: the document that crosses
/// the budget is cut at a word boundary and later ones are counted as omitted.
/// A document whose heading does not fit is omitted rather than cut.
fn render_diary(documents: &[ContextDocument], compact: bool, budget: usize) -> Option<String> {
    if documents.is_empty() {
        return None;
    }

    let mut blocks = Vec::new();
    let mut used = 0;
    let mut omitted = 0;

    for document in documents {
        let heading = format!("## {}\n", document.title);
        let content = document.content.trim();
        if !compact {
            blocks.push(format!("{heading}{content}"));
            continue;
        }

        let len = heading.chars().count() + content.chars().count();
        if used + len <= budget {
            used += len;
            blocks.push(format!("{heading}{content}"));
            continue;
        }

        // A cut document keeps its whole heading and at least one word.
        let remaining = budget.saturating_sub(used);
        let truncated = remaining
            .checked_sub(heading.chars().count())
            .map(|room| truncate_at_word(content, room))
            .unwrap_or_default();
        if truncated.is_empty() {
            omitted += 1;
        } else {
            blocks.push(format!("{heading}{truncated}{DIGESTED_SUFFIX}"));
        }
        used = budget;
    }

    if blocks.is_empty() && omitted == 0 {
        return None;
    }

    let mut section = format!("=== Context Diary ===\n{}", blocks.join("\n\n"));
    if omitted > 0 {
        let noun = if omitted == 1 { "document" } else { "documents" };
        section.push_str(&format!(
            "\n\n({omitted} more {noun} omitted, digested to memory)"
        ));
    }
    Some(section)
}

/// Longest prefix of `text` within `max_chars` that ends on a word boundary.
fn truncate_at_word(text: &str, max_chars: usize) -> &str {
    let cut = match text.char_indices().nth(max_chars) {
        Some((idx, _)) => idx,
        None => return text,
    };
    let prefix = &text[..cut];
    let boundary_follows = text[cut..].starts_with(char::is_whitespace);
    if boundary_follows {
        return prefix.trim_end();
    }
    match prefix.rfind(char::is_whitespace) {
        Some(space) => prefix[..space].trim_end(),
        None => prefix,
    }
}
