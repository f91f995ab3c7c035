use chrono::{DateTime, SecondsFormat, Utc};
use constellation_common::{Error, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::migrations::{MEMORY_FTS_V1, MEMORY_SCHEMA_V1, schema_version};

pub(crate) const MEMORY_COLUMNS: &str = "id, memory_type, speaker, content, importance, \
     emotional_valence, context, conversation_id, created_at, keywords";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Something that happened in a conversation.
    Episodic,
    /// A fact or piece of knowledge.
    Semantic,
    /// Something about the relationship between agents.
    Relational,
}

impl MemoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Relational => "relational",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "episodic" => Some(MemoryType::Episodic),
            "semantic" => Some(MemoryType::Semantic),
            "relational" => Some(MemoryType::Relational),
            _ => None,
        }
    }
}

/// A persisted long-term memory row. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub memory_type: MemoryType,
    pub speaker: String,
    pub content: String,
    pub importance: f64,
    pub emotional_valence: f64,
    pub context: Option<serde_json::Value>,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub keywords: Vec<String>,
}

/// Insert shape for new memories before persistence assigns ID/timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub speaker: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub importance: f64,
    pub emotional_valence: f64,
    pub context: Option<serde_json::Value>,
    pub conversation_id: Option<String>,
    pub keywords: Vec<String>,
}

impl NewMemory {
    pub fn new(
        speaker: impl Into<String>,
        content: impl Into<String>,
        memory_type: MemoryType,
    ) -> Self {
        Self {
            speaker: speaker.into(),
            content: content.into(),
            memory_type,
            importance: 0.5,
            emotional_valence: 0.0,
            context: None,
            conversation_id: None,
            keywords: Vec::new(),
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_valence(mut self, valence: f64) -> Self {
        self.emotional_valence = valence.clamp(-1.0, 1.0);
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_memories: i64,
    pub unique_speakers: i64,
    pub conversations: i64,
    pub avg_importance: Option<f64>,
    pub by_type: BTreeMap<String, i64>,
}

#[derive(Debug, Clone)]
enum StoreLocation {
    File(PathBuf),
    InMemory,
}

/// Backing store for the long-term, archive and diary memory tiers.
///
/// The SQLite connection is opened on first use and owned by the store; each
/// operation holds it only for its own duration. Any failure to open or query
/// surfaces as [`Error::StoreUnavailable`].
pub struct MemoryStore {
    location: StoreLocation,
    conn: Mutex<Option<Connection>>,
    fts_enabled: AtomicBool,
}

impl MemoryStore {
    /// Open (and migrate) the database at `db_path` immediately.
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Self::lazy(db_path);
        store.connect()?;
        Ok(store)
    }

    /// Prepare a store for `db_path` without touching the filesystem yet.
    pub fn lazy(db_path: &Path) -> Self {
        Self {
            location: StoreLocation::File(db_path.to_path_buf()),
            conn: Mutex::new(None),
            fts_enabled: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            location: StoreLocation::InMemory,
            conn: Mutex::new(None),
            fts_enabled: AtomicBool::new(false),
        };
        store.connect()?;
        Ok(store)
    }

    /// Establish the connection now rather than on first use.
    pub fn connect(&self) -> Result<()> {
        self.with_conn("connect", |_| Ok(()))
    }

    /// Whether the full-text indexes were created for this database.
    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled.load(Ordering::Relaxed)
    }

    /// Run `op` against the connection, opening it first if needed.
    pub(crate) fn with_conn<T>(
        &self,
        operation: &str,
        op: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| {
            Error::StoreUnavailable(format!("{operation}: connection lock poisoned"))
        })?;

        if guard.is_none() {
            *guard = Some(self.establish()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(Error::StoreUnavailable(format!(
                "{operation}: no connection available"
            )));
        };

        op(conn).map_err(|e| Error::StoreUnavailable(format!("{operation} failed: {e}")))
    }

    fn establish(&self) -> Result<Connection> {
        let conn = match &self.location {
            StoreLocation::File(path) => {
                info!("opening memory store at {}", path.display());
                let conn = Connection::open(path).map_err(|e| {
                    Error::StoreUnavailable(format!("failed to open memory database: {e}"))
                })?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")
                    .map_err(|e| Error::StoreUnavailable(format!("failed to set pragmas: {e}")))?;
                conn
            }
            StoreLocation::InMemory => Connection::open_in_memory().map_err(|e| {
                Error::StoreUnavailable(format!("failed to open in-memory database: {e}"))
            })?,
        };

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::StoreUnavailable(format!("failed to set pragmas: {e}")))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::StoreUnavailable(format!("failed to set busy timeout: {e}")))?;

        self.run_migrations(&conn)?;
        Ok(conn)
    }

    fn run_migrations(&self, conn: &Connection) -> Result<()> {
        MEMORY_SCHEMA_V1.apply(conn).map_err(|e| {
            Error::StoreUnavailable(format!("migration '{}' failed: {e}", MEMORY_SCHEMA_V1.name))
        })?;

        match MEMORY_FTS_V1.apply(conn) {
            Ok(()) => self.fts_enabled.store(true, Ordering::Relaxed),
            Err(e) => {
                warn!(
                    "full-text search unavailable ({e}); archive and diary search will use substring matching"
                );
                self.fts_enabled.store(false, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Highest schema migration applied to this database.
    pub fn schema_version(&self) -> Result<u32> {
        self.with_conn("read schema version", |conn| schema_version(conn))
    }

    /// Insert a memory and return its id.
    pub fn record_memory(&self, memory: &NewMemory) -> Result<i64> {
        self.with_conn("record memory", |conn| insert_memory(conn, memory))
    }

    /// Insert several memories atomically: either every row is written or
    /// none is.
    pub fn record_memories(&self, memories: &[NewMemory]) -> Result<usize> {
        self.with_conn("record memories", |conn| {
            let tx = conn.transaction()?;
            for memory in memories {
                insert_memory(&tx, memory)?;
            }
            tx.commit()?;
            Ok(memories.len())
        })
    }

    /// Most recent memories first, optionally filtered by speaker and type.
    pub fn recall_recent(
        &self,
        limit: usize,
        speaker: Option<&str>,
        memory_type: Option<MemoryType>,
    ) -> Result<Vec<Memory>> {
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE 1=1");
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(speaker) = speaker {
            values.push(SqlValue::Text(speaker.to_string()));
            sql.push_str(&format!(" AND speaker = ?{}", values.len()));
        }
        if let Some(memory_type) = memory_type {
            values.push(SqlValue::Text(memory_type.as_str().to_string()));
            sql.push_str(&format!(" AND memory_type = ?{}", values.len()));
        }
        values.push(SqlValue::Integer(limit as i64));
        sql.push_str(&format!(
            " ORDER BY created_at DESC, id DESC LIMIT ?{}",
            values.len()
        ));

        self.query_memories("recall recent memories", &sql, values)
    }

    /// Memories at or above `min_importance`, most important first.
    pub fn recall_important(&self, limit: usize, min_importance: f64) -> Result<Vec<Memory>> {
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE importance >= ?1
             ORDER BY importance DESC, created_at DESC, id DESC
             LIMIT ?2"
        );
        self.query_memories(
            "recall important memories",
            &sql,
            vec![SqlValue::Real(min_importance), SqlValue::Integer(limit as i64)],
        )
    }

    /// Case-insensitive substring search over memory content.
    pub fn search_memories(&self, term: &str, limit: usize) -> Result<Vec<Memory>> {
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE content LIKE ?1 ESCAPE '\\'
             ORDER BY importance DESC, created_at DESC, id DESC
             LIMIT ?2"
        );
        self.query_memories(
            "search memories",
            &sql,
            vec![SqlValue::Text(like_pattern(term)), SqlValue::Integer(limit as i64)],
        )
    }

    /// All memories recorded for a conversation, in insertion order.
    pub fn memories_for_conversation(&self, conversation_id: &str) -> Result<Vec<Memory>> {
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE conversation_id = ?1 ORDER BY id ASC"
        );
        self.query_memories(
            "load conversation memories",
            &sql,
            vec![SqlValue::Text(conversation_id.to_string())],
        )
    }

    fn query_memories(
        &self,
        operation: &str,
        sql: &str,
        values: Vec<SqlValue>,
    ) -> Result<Vec<Memory>> {
        self.with_conn(operation, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params_from_iter(values), memory_from_row)?;
            rows.collect()
        })
    }

    pub fn memory_stats(&self) -> Result<MemoryStats> {
        self.with_conn("memory stats", |conn| {
            let mut stats = conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT speaker), COUNT(DISTINCT conversation_id),
                        AVG(importance)
                 FROM memories",
                [],
                |row| {
                    Ok(MemoryStats {
                        total_memories: row.get(0)?,
                        unique_speakers: row.get(1)?,
                        conversations: row.get(2)?,
                        avg_importance: row.get(3)?,
                        by_type: BTreeMap::new(),
                    })
                },
            )?;

            let mut stmt =
                conn.prepare("SELECT memory_type, COUNT(*) FROM memories GROUP BY memory_type")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (memory_type, count) = row?;
                stats.by_type.insert(memory_type, count);
            }
            Ok(stats)
        })
    }

    /// Delete every memory and conversation summary. Diary documents and the
    /// reference archive are left alone.
    pub fn clear_all_memories(&self) -> Result<()> {
        self.with_conn("clear memories", |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM memories", [])?;
            tx.execute("DELETE FROM conversation_summaries", [])?;
            tx.commit()
        })?;
        debug!("cleared all memories and summaries");
        Ok(())
    }
}

fn insert_memory(conn: &Connection, memory: &NewMemory) -> rusqlite::Result<i64> {
    let context = memory.context.as_ref().map(|c| c.to_string());
    conn.execute(
        "INSERT INTO memories
            (memory_type, speaker, content, importance, emotional_valence,
             context, conversation_id, created_at, keywords)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            memory.memory_type.as_str(),
            memory.speaker,
            memory.content,
            memory.importance,
            memory.emotional_valence,
            context,
            memory.conversation_id,
            now_timestamp(),
            to_json_list(&memory.keywords),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let memory_type_raw: String = row.get(1)?;
    let context_raw: Option<String> = row.get(6)?;
    let created_at_raw: String = row.get(8)?;
    let keywords_raw: String = row.get(9)?;

    Ok(Memory {
        id: row.get(0)?,
        memory_type: MemoryType::parse(&memory_type_raw).unwrap_or_else(|| {
            warn!("unknown memory type '{memory_type_raw}', treating as episodic");
            MemoryType::Episodic
        }),
        speaker: row.get(2)?,
        content: row.get(3)?,
        importance: row.get(4)?,
        emotional_valence: row.get(5)?,
        context: context_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        conversation_id: row.get(7)?,
        created_at: parse_timestamp(&created_at_raw),
        keywords: serde_json::from_str(&keywords_raw).unwrap_or_default(),
    })
}

/// Fixed-width UTC timestamp so lexical order matches chronological order.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("failed to parse timestamp '{value}': {e}, falling back to now");
            Utc::now()
        })
}

/// `%term%` with LIKE wildcards in `term` escaped (use with `ESCAPE '\'`).
pub(crate) fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

pub(crate) fn to_json_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn from_json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}
