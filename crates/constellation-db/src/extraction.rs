use constellation_common::{Result, TranscriptEntry};
use serde_json::json;
use tracing::{debug, warn};

use crate::memory_store::{MemoryStore, MemoryType, NewMemory};
use crate::profiles::ProfileUpdate;

const IMPORTANT_KEYWORDS: [&str; 5] = ["important", "remember", "key", "critical", "essential"];
const PROJECT_KEYWORDS: [&str; 4] = ["phoenix", "project", "goal", "plan"];
const POSITIVE_KEYWORDS: [&str; 5] = ["love", "wonderful", "amazing", "excited", "happy"];
const NEGATIVE_KEYWORDS: [&str; 4] = ["concerned", "worried", "difficult", "challenging"];

/// Longest message body kept in an extracted memory, in characters.
pub const MAX_MEMORY_CHARS: usize = 2_000;

/// 0.8 for explicit importance cues, 0.7 for project talk, 0.5 otherwise.
pub fn score_importance(content: &str) -> f64 {
    let lower = content.to_lowercase();
    if contains_any(&lower, &IMPORTANT_KEYWORDS) {
        0.8
    } else if contains_any(&lower, &PROJECT_KEYWORDS) {
        0.7
    } else {
        0.5
    }
}

/// Positive cues win over negative ones when both appear.
pub fn score_valence(content: &str) -> f64 {
    let lower = content.to_lowercase();
    if contains_any(&lower, &POSITIVE_KEYWORDS) {
        0.8
    } else if contains_any(&lower, &NEGATIVE_KEYWORDS) {
        -0.3
    } else {
        0.0
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn matched_keywords(content: &str) -> Vec<String> {
    let lower = content.to_lowercase();
    IMPORTANT_KEYWORDS
        .iter()
        .chain(PROJECT_KEYWORDS.iter())
        .chain(POSITIVE_KEYWORDS.iter())
        .chain(NEGATIVE_KEYWORDS.iter())
        .filter(|keyword| lower.contains(*keyword))
        .map(|keyword| keyword.to_string())
        .collect()
}

fn truncate_chars(content: &str, max_chars: usize) -> &str {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

impl MemoryStore {
    /// Turn each transcript message into one episodic memory and touch the
    /// participants' profiles. Returns the number of memories written. The
    /// memories are written in one transaction, so a failure leaves none.
    pub fn extract_and_store(
        &self,
        conversation_id: &str,
        entries: &[TranscriptEntry],
        participants: &[String],
    ) -> Result<usize> {
        let memories: Vec<NewMemory> = entries
            .iter()
            .map(|entry| {
                let content = truncate_chars(&entry.content, MAX_MEMORY_CHARS);
                NewMemory::new(&entry.speaker, content, MemoryType::Episodic)
                    .with_importance(score_importance(content))
                    .with_valence(score_valence(content))
                    .in_conversation(conversation_id)
                    .with_context(json!({
                        "timestamp": entry.timestamp.to_rfc3339(),
                        "source": "transcript",
                    }))
                    .with_keywords(matched_keywords(content))
            })
            .collect();
        let stored = self.record_memories(&memories)?;

        for participant in participants {
            if let Err(e) = self.update_ai_profile(participant, &ProfileUpdate::default()) {
                warn!("failed to update profile for {participant}: {e}");
            }
        }

        debug!(conversation_id, stored, "extracted transcript memories");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(speaker: &str, content: &str) -> TranscriptEntry {
        TranscriptEntry {
            timestamp: Utc::now(),
            speaker: speaker.to_string(),
            content: content.to_string(),
            slot: None,
        }
    }

    #[test]
    fn importance_prefers_explicit_cues() {
        assert_eq!(score_importance("This is IMPORTANT to remember"), 0.8);
        assert_eq!(score_importance("our project plan"), 0.7);
        assert_eq!(score_importance("the key to the project"), 0.8);
        assert_eq!(score_importance("hello there"), 0.5);
    }

    #[test]
    fn valence_checks_positive_first() {
        assert_eq!(score_valence("I love this"), 0.8);
        assert_eq!(score_valence("I'm worried"), -0.3);
        assert_eq!(score_valence("excited but concerned"), 0.8);
        assert_eq!(score_valence("neutral"), 0.0);
    }

    #[test]
    fn extraction_writes_one_memory_per_message() {
        let store = MemoryStore::in_memory().unwrap();
        let long = "x".repeat(MAX_MEMORY_CHARS + 100);
        let entries = vec![
            entry("System", "Conversation started with: hi"),
            entry("Grok", "Remember the phoenix plan"),
            entry("Claude", &long),
        ];

        let stored = store
            .extract_and_store("relay_abc", &entries, &["Claude".into(), "Grok".into()])
            .unwrap();
        assert_eq!(stored, 3);

        let memories = store.memories_for_conversation("relay_abc").unwrap();
        assert_eq!(memories.len(), 3);
        assert!(memories.iter().all(|m| m.memory_type == MemoryType::Episodic));
        assert_eq!(memories[1].importance, 0.8);
        assert!(memories[1].keywords.contains(&"remember".to_string()));
        assert_eq!(memories[2].content.chars().count(), MAX_MEMORY_CHARS);

        assert!(store.get_ai_profile("Grok").unwrap().is_some());
    }

    #[test]
    fn failed_extraction_writes_nothing_and_can_be_retried() {
        let store = MemoryStore::in_memory().unwrap();
        store
            .with_conn("install trigger", |conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_boom BEFORE INSERT ON memories
                     WHEN NEW.content = 'boom'
                     BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )
            })
            .unwrap();
        let entries = vec![
            entry("Grok", "first"),
            entry("Claude", "boom"),
            entry("Grok", "third"),
        ];

        let err = store
            .extract_and_store("relay_abc", &entries, &[])
            .unwrap_err();
        assert!(matches!(err, constellation_common::Error::StoreUnavailable(_)));
        assert!(store.memories_for_conversation("relay_abc").unwrap().is_empty());

        store
            .with_conn("drop trigger", |conn| {
                conn.execute_batch("DROP TRIGGER reject_boom;")
            })
            .unwrap();
        assert_eq!(store.extract_and_store("relay_abc", &entries, &[]).unwrap(), 3);
        let contents: Vec<String> = store
            .memories_for_conversation("relay_abc")
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["first", "boom", "third"]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
