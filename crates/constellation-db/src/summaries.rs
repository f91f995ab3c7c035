use constellation_common::{Result, TranscriptEntry};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::extraction::score_importance;
use crate::memory_store::{MemoryStore, from_json_list, now_timestamp, to_json_list};

const MAX_KEY_POINTS: usize = 5;
const KEY_POINT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub summary: String,
    pub participants: Vec<String>,
    pub topic: Option<String>,
    pub key_points: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationSummary {
    /// Build a plain summary from a finished transcript: who spoke, how much,
    /// and the messages that scored as important.
    pub fn from_transcript(
        conversation_id: &str,
        transcript: &[TranscriptEntry],
        participants: &[String],
        topic: Option<&str>,
    ) -> Self {
        let agent_turns = transcript.iter().filter(|e| !e.is_system()).count();
        let summary = format!(
            "{} exchanged {agent_turns} messages{}.",
            participants.join(" and "),
            topic.map(|t| format!(" about {t}")).unwrap_or_default()
        );

        let key_points = transcript
            .iter()
            .filter(|e| !e.is_system() && score_importance(&e.content) >= 0.7)
            .take(MAX_KEY_POINTS)
            .map(|e| {
                let point: String = e.content.chars().take(KEY_POINT_CHARS).collect();
                format!("{}: {point}", e.speaker)
            })
            .collect();

        let now = now_timestamp();
        Self {
            conversation_id: conversation_id.to_string(),
            summary,
            participants: participants.to_vec(),
            topic: topic.map(str::to_string),
            key_points,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

impl MemoryStore {
    /// Insert or replace the summary for a conversation.
    pub fn save_conversation_summary(&self, summary: &ConversationSummary) -> Result<()> {
        let participants = to_json_list(&summary.participants);
        let key_points = to_json_list(&summary.key_points);
        let now = now_timestamp();

        self.with_conn("save conversation summary", |conn| {
            conn.execute(
                "INSERT INTO conversation_summaries
                    (conversation_id, summary, participants, topic, key_points, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    summary = excluded.summary,
                    participants = excluded.participants,
                    topic = excluded.topic,
                    key_points = excluded.key_points,
                    updated_at = excluded.updated_at",
                params![
                    summary.conversation_id,
                    summary.summary,
                    participants,
                    summary.topic,
                    key_points,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recently updated summaries first.
    pub fn get_conversation_summaries(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        self.with_conn("list conversation summaries", |conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, summary, participants, topic, key_points,
                        created_at, updated_at
                 FROM conversation_summaries
                 ORDER BY updated_at DESC, id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(ConversationSummary {
                    conversation_id: row.get(0)?,
                    summary: row.get(1)?,
                    participants: from_json_list(row.get(2)?),
                    topic: row.get(3)?,
                    key_points: from_json_list(row.get(4)?),
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?;
            rows.collect()
        })
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
    fn summary_counts_agent_turns_and_collects_key_points() {
        let transcript = vec![
            entry("System", "Conversation started with: remember this"),
            entry("Grok", "It is critical we ship"),
            entry("Claude", "sure"),
        ];
        let summary = ConversationSummary::from_transcript(
            "relay_1",
            &transcript,
            &["Claude".into(), "Grok".into()],
            Some("launch"),
        );
        assert_eq!(summary.summary, "Claude and Grok exchanged 2 messages about launch.");
        assert_eq!(summary.key_points, vec!["Grok: It is critical we ship"]);
    }

    #[test]
    fn saving_twice_keeps_one_row() {
        let store = MemoryStore::in_memory().unwrap();
        let mut summary =
            ConversationSummary::from_transcript("relay_1", &[], &["Claude".into()], None);
        store.save_conversation_summary(&summary).unwrap();
        summary.summary = "updated".into();
        store.save_conversation_summary(&summary).unwrap();

        let saved = store.get_conversation_summaries(10).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].summary, "updated");
    }
}
