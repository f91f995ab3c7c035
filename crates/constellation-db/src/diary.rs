use chrono::{DateTime, Utc};
use constellation_common::{Error, Result};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::archive::fts_match_query;
use crate::memory_store::{
    MemoryStore, MemoryType, NewMemory, like_pattern, now_timestamp, parse_timestamp,
};

/// Documents owned by this name are visible to every agent.
pub const SHARED_OWNER: &str = "shared";

/// Chunks shorter than this are not worth a memory.
pub const MIN_DIGEST_CHUNK_CHARS: usize = 50;

pub const DEFAULT_DIGEST_CHUNK_CHARS: usize = 500;

const DIGEST_IMPORTANCE: f64 = 0.85;

const DOCUMENT_COLUMNS: &str =
    "id, document_id, owner, title, content, version, is_active, created_at, updated_at";

/// One version of a diary document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub id: i64,
    pub document_id: String,
    pub owner: String,
    pub title: String,
    pub content: String,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextDocument {
    pub fn is_shared(&self) -> bool {
        self.owner.eq_ignore_ascii_case(SHARED_OWNER)
    }
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<ContextDocument> {
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(ContextDocument {
        id: row.get(0)?,
        document_id: row.get(1)?,
        owner: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        version: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

/// Diary document holding an agent's long-running continuity notes.
pub fn continuity_document_id(agent: &str) -> String {
    format!("{}_continuity", agent.trim().to_lowercase())
}

fn new_document_id() -> String {
    format!("doc_{}", uuid::Uuid::new_v4().simple())
}

/// Split `content` on blank lines and pack whole paragraphs into chunks of at
/// most `chunk_size` characters. A paragraph longer than `chunk_size` becomes
/// its own chunk rather than being cut.
pub fn chunk_paragraphs(content: &str, chunk_size: usize) -> Vec<String> {
    let normalized = content.replace("\r\n", "\n");
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        let joined_len = if current.is_empty() {
            paragraph.chars().count()
        } else {
            current.chars().count() + 2 + paragraph.chars().count()
        };

        if joined_len <= chunk_size || current.is_empty() {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
        } else {
            chunks.push(std::mem::take(&mut current));
            current.push_str(paragraph);
        }

        if current.chars().count() > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

impl MemoryStore {
    /// Save a new version of a document and return its row id.
    ///
    /// Without a `document_id` a fresh document is created. Otherwise the
    /// current active version is deactivated and the new one becomes active
    /// with the next version number.
    pub fn store_context_document(
        &self,
        title: &str,
        content: &str,
        owner: &str,
        document_id: Option<&str>,
    ) -> Result<i64> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(Error::InvalidState("document owner must not be empty".into()));
        }
        let document_id = document_id
            .map(str::to_string)
            .unwrap_or_else(new_document_id);
        let now = now_timestamp();
        let fts = self.fts_enabled();

        let (row_id, version) = self.with_conn("store context document", |conn| {
            let tx = conn.transaction()?;
            let latest: Option<i64> = tx.query_row(
                "SELECT MAX(version) FROM context_documents WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )?;
            let version = latest.unwrap_or(0) + 1;

            tx.execute(
                "UPDATE context_documents SET is_active = 0, updated_at = ?2
                 WHERE document_id = ?1 AND is_active = 1",
                params![document_id, now],
            )?;
            tx.execute(
                "INSERT INTO context_documents
                    (document_id, owner, title, content, version, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                params![document_id, owner, title, content, version, now],
            )?;
            let row_id = tx.last_insert_rowid();

            if fts {
                tx.execute(
                    "INSERT INTO context_documents_fts (title, content, row_id) VALUES (?1, ?2, ?3)",
                    params![title, content, row_id],
                )?;
            }
            tx.commit()?;
            Ok((row_id, version))
        })?;

        info!(document_id = %document_id, version, owner, "stored context document");
        Ok(row_id)
    }

    /// Active documents, optionally restricted to one owner (case-insensitive).
    pub fn get_active_documents(&self, owner: Option<&str>) -> Result<Vec<ContextDocument>> {
        self.with_conn("list context documents", |conn| match owner {
            Some(owner) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM context_documents
                     WHERE is_active = 1 AND lower(owner) = lower(?1)
                     ORDER BY updated_at DESC, id DESC"
                ))?;
                let rows = stmt.query_map(params![owner.trim()], document_from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM context_documents
                     WHERE is_active = 1
                     ORDER BY updated_at DESC, id DESC"
                ))?;
                let rows = stmt.query_map([], document_from_row)?;
                rows.collect()
            }
        })
    }

    /// Shared documents first, then the ones `agent` owns.
    pub fn documents_for_agent(&self, agent: &str) -> Result<Vec<ContextDocument>> {
        let mut documents = self.get_active_documents(Some(SHARED_OWNER))?;
        if !agent.trim().eq_ignore_ascii_case(SHARED_OWNER) {
            documents.extend(self.get_active_documents(Some(agent))?);
        }
        Ok(documents)
    }

    /// A specific document version by row id.
    pub fn get_document(&self, row_id: i64) -> Result<Option<ContextDocument>> {
        self.with_conn("load context document", |conn| {
            conn.query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM context_documents WHERE id = ?1"),
                params![row_id],
                document_from_row,
            )
            .optional()
        })
    }

    pub fn active_document(&self, document_id: &str) -> Result<Option<ContextDocument>> {
        self.with_conn("load context document", |conn| {
            conn.query_row(
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM context_documents
                     WHERE document_id = ?1 AND is_active = 1"
                ),
                params![document_id],
                document_from_row,
            )
            .optional()
        })
    }

    /// Every version of a document, oldest first.
    pub fn document_history(&self, document_id: &str) -> Result<Vec<ContextDocument>> {
        self.with_conn("load document history", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM context_documents
                 WHERE document_id = ?1
                 ORDER BY version ASC"
            ))?;
            let rows = stmt.query_map(params![document_id], document_from_row)?;
            rows.collect()
        })
    }

    /// Search active documents by title and content.
    pub fn search_documents(&self, query: &str, limit: usize) -> Result<Vec<ContextDocument>> {
        if self.fts_enabled()
            && let Some(fts_query) = fts_match_query(query)
        {
            let result = self.with_conn("search context documents", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT d.id, d.document_id, d.owner, d.title, d.content, d.version,
                            d.is_active, d.created_at, d.updated_at
                     FROM context_documents_fts f
                     JOIN context_documents d ON d.id = CAST(f.row_id AS INTEGER)
                     WHERE context_documents_fts MATCH ?1 AND d.is_active = 1
                     ORDER BY bm25(context_documents_fts)
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![fts_query, limit as i64], document_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            });
            match result {
                Ok(documents) => return Ok(documents),
                Err(e) => warn!("document full-text search failed, using substring match: {e}"),
            }
        }

        let pattern = like_pattern(query.trim());
        self.with_conn("search context documents", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM context_documents
                 WHERE is_active = 1
                   AND (title LIKE ?1 ESCAPE '\\' OR content LIKE ?1 ESCAPE '\\')
                 ORDER BY updated_at DESC, id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![pattern, limit as i64], document_from_row)?;
            rows.collect()
        })
    }

    /// Turn the active version of a document into semantic memories, one per
    /// paragraph chunk. Returns how many memories were written.
    pub fn digest_document_to_memories(
        &self,
        document_id: &str,
        chunk_size: usize,
    ) -> Result<usize> {
        if chunk_size == 0 {
            return Err(Error::InvalidState("chunk size must be positive".into()));
        }
        let document = self
            .active_document(document_id)?
            .ok_or_else(|| Error::NotFound(format!("no active document '{document_id}'")))?;

        let memories: Vec<NewMemory> = chunk_paragraphs(&document.content, chunk_size)
            .into_iter()
            .filter(|chunk| chunk.chars().count() >= MIN_DIGEST_CHUNK_CHARS)
            .map(|chunk| {
                NewMemory::new(&document.owner, chunk, MemoryType::Semantic)
                    .with_importance(DIGEST_IMPORTANCE)
                    .with_context(json!({
                        "source": "context_document",
                        "document_id": document.document_id,
                        "title": document.title,
                        "version": document.version,
                    }))
            })
            .collect();
        let written = self.record_memories(&memories)?;

        debug!(document_id, written, "digested document into memories");
        Ok(written)
    }
}
