use constellation_common::{Result, TranscriptEntry, render_transcript};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::memory_store::{MemoryStore, from_json_list, like_pattern, now_timestamp, to_json_list};

/// A conversation kept verbatim in the reference archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceConversation {
    pub conversation_id: String,
    pub title: Option<String>,
    pub participants: Vec<String>,
    pub full_transcript: String,
    pub message_count: i64,
    pub word_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMessage {
    pub id: i64,
    pub conversation_id: String,
    pub message_index: i64,
    pub speaker: String,
    pub content: String,
    pub timestamp: String,
}

/// One archived message matching a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveHit {
    pub conversation_id: String,
    pub title: Option<String>,
    pub message_index: i64,
    pub speaker: String,
    pub content: String,
    pub timestamp: String,
    /// bm25 score when full-text search produced the hit; lower is better.
    pub rank: Option<f64>,
}

/// Quote each whitespace-separated term and OR them together so user input
/// never reaches the FTS5 query parser as syntax.
pub(crate) fn fts_match_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn hit_from_row(row: &Row<'_>, ranked: bool) -> rusqlite::Result<ArchiveHit> {
    Ok(ArchiveHit {
        conversation_id: row.get(0)?,
        title: row.get(1)?,
        message_index: row.get(2)?,
        speaker: row.get(3)?,
        content: row.get(4)?,
        timestamp: row.get(5)?,
        rank: if ranked { row.get(6)? } else { None },
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ReferenceConversation> {
    Ok(ReferenceConversation {
        conversation_id: row.get(0)?,
        title: row.get(1)?,
        participants: from_json_list(row.get(2)?),
        full_transcript: row.get(3)?,
        message_count: row.get(4)?,
        word_count: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl MemoryStore {
    /// Store the complete transcript under `conversation_id`, replacing any
    /// earlier copy. The whole write is one transaction.
    pub fn archive_conversation(
        &self,
        conversation_id: &str,
        transcript: &[TranscriptEntry],
        participants: &[String],
        title: Option<&str>,
    ) -> Result<()> {
        let full_transcript = render_transcript(transcript);
        let word_count = transcript
            .iter()
            .map(|entry| entry.content.split_whitespace().count())
            .sum::<usize>() as i64;
        let participants = to_json_list(participants);
        let now = now_timestamp();
        let fts = self.fts_enabled();

        self.with_conn("archive conversation", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO reference_conversations
                    (conversation_id, title, participants, full_transcript, message_count,
                     word_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    title = excluded.title,
                    participants = excluded.participants,
                    full_transcript = excluded.full_transcript,
                    message_count = excluded.message_count,
                    word_count = excluded.word_count,
                    updated_at = excluded.updated_at",
                params![
                    conversation_id,
                    title,
                    participants,
                    full_transcript,
                    transcript.len() as i64,
                    word_count,
                    now,
                ],
            )?;

            if fts {
                tx.execute(
                    "DELETE FROM reference_messages_fts WHERE conversation_id = ?1",
                    params![conversation_id],
                )?;
            }
            tx.execute(
                "DELETE FROM reference_messages WHERE conversation_id = ?1",
                params![conversation_id],
            )?;

            for (index, entry) in transcript.iter().enumerate() {
                tx.execute(
                    "INSERT INTO reference_messages
                        (conversation_id, message_index, speaker, content, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        conversation_id,
                        index as i64,
                        entry.speaker,
                        entry.content,
                        entry.timestamp.to_rfc3339(),
                    ],
                )?;
                if fts {
                    let message_id = tx.last_insert_rowid();
                    tx.execute(
                        "INSERT INTO reference_messages_fts (content, conversation_id, message_id)
                         VALUES (?1, ?2, ?3)",
                        params![entry.content, conversation_id, message_id],
                    )?;
                }
            }

            tx.commit()
        })?;

        debug!(conversation_id, messages = transcript.len(), "archived conversation");
        Ok(())
    }

    /// Full-text search over archived messages, best match first. Falls back
    /// to substring matching when the index is missing or the query fails.
    pub fn search_archive(&self, query: &str, limit: usize) -> Result<Vec<ArchiveHit>> {
        if self.fts_enabled() {
            match self.search_archive_fts(query, limit) {
                Ok(hits) => return Ok(hits),
                Err(e) => warn!("archive full-text search failed, using substring match: {e}"),
            }
        }
        self.search_archive_substring(query, limit)
    }

    fn search_archive_fts(&self, query: &str, limit: usize) -> Result<Vec<ArchiveHit>> {
        let Some(fts_query) = fts_match_query(query) else {
            return Ok(Vec::new());
        };

        self.with_conn("search archive", |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.conversation_id, c.title, m.message_index, m.speaker, m.content,
                        m.timestamp, bm25(reference_messages_fts) AS rank
                 FROM reference_messages_fts f
                 JOIN reference_messages m ON m.id = CAST(f.message_id AS INTEGER)
                 JOIN reference_conversations c ON c.conversation_id = m.conversation_id
                 WHERE reference_messages_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![fts_query, limit as i64], |row| {
                hit_from_row(row, true)
            })?;
            rows.collect()
        })
    }

    pub(crate) fn search_archive_substring(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ArchiveHit>> {
        let pattern = like_pattern(query.trim());
        self.with_conn("search archive", |conn| {
            let mut stmt = conn.prepare(
                "SELECT m.conversation_id, c.title, m.message_index, m.speaker, m.content,
                        m.timestamp
                 FROM reference_messages m
                 JOIN reference_conversations c ON c.conversation_id = m.conversation_id
                 WHERE m.content LIKE ?1 ESCAPE '\\'
                 ORDER BY c.updated_at DESC, m.message_index ASC
                 LIMIT ?2",
            )?;
            let rows =
                stmt.query_map(params![pattern, limit as i64], |row| hit_from_row(row, false))?;
            rows.collect()
        })
    }

    /// Archived conversations, most recently updated first.
    pub fn list_archived_conversations(&self, limit: usize) -> Result<Vec<ReferenceConversation>> {
        self.with_conn("list archived conversations", |conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, title, participants, full_transcript, message_count,
                        word_count, created_at, updated_at
                 FROM reference_conversations
                 ORDER BY updated_at DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], conversation_from_row)?;
            rows.collect()
        })
    }

    pub fn get_archived_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ReferenceConversation>> {
        self.with_conn("load archived conversation", |conn| {
            conn.query_row(
                "SELECT conversation_id, title, participants, full_transcript, message_count,
                        word_count, created_at, updated_at
                 FROM reference_conversations WHERE conversation_id = ?1",
                params![conversation_id],
                conversation_from_row,
            )
            .optional()
        })
    }

    pub fn get_archived_messages(&self, conversation_id: &str) -> Result<Vec<ReferenceMessage>> {
        self.with_conn("load archived messages", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, message_index, speaker, content, timestamp
                 FROM reference_messages
                 WHERE conversation_id = ?1
                 ORDER BY message_index ASC",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                Ok(ReferenceMessage {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    message_index: row.get(2)?,
                    speaker: row.get(3)?,
                    content: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }
}
