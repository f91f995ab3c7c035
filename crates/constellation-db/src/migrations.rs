use rusqlite::Connection;

/// A versioned batch of schema statements.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    /// Run the statements and raise `PRAGMA user_version` to this version.
    /// The recorded version never goes down.
    pub fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(self.sql)?;
        let current = schema_version(conn)?;
        if self.version > current {
            conn.pragma_update(None, "user_version", self.version)?;
        }
        Ok(())
    }
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Core tables for the long-term, archive and diary tiers.
pub const MEMORY_SCHEMA_V1: Migration = Migration {
    version: 1,
    name: "memory_tiers",
    sql: "
        CREATE TABLE IF NOT EXISTS memories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_type TEXT NOT NULL,
            speaker TEXT NOT NULL,
            content TEXT NOT NULL,
            importance REAL NOT NULL DEFAULT 0.5,
            emotional_valence REAL NOT NULL DEFAULT 0.0,
            context TEXT,
            conversation_id TEXT,
            created_at TEXT NOT NULL,
            keywords TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_memories_speaker ON memories(speaker);
        CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);
        CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance DESC);
        CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC);

        CREATE TABLE IF NOT EXISTS reference_conversations (
            conversation_id TEXT PRIMARY KEY,
            title TEXT,
            participants TEXT NOT NULL DEFAULT '[]',
            full_transcript TEXT NOT NULL,
            message_count INTEGER NOT NULL,
            word_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS reference_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL
                REFERENCES reference_conversations(conversation_id) ON DELETE CASCADE,
            message_index INTEGER NOT NULL,
            speaker TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            UNIQUE (conversation_id, message_index)
        );

        CREATE INDEX IF NOT EXISTS idx_reference_messages_conversation
            ON reference_messages(conversation_id, message_index);

        CREATE TABLE IF NOT EXISTS context_documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            owner TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            version INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (document_id, version)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_context_documents_one_active
            ON context_documents(document_id) WHERE is_active = 1;
        CREATE INDEX IF NOT EXISTS idx_context_documents_owner
            ON context_documents(owner, is_active);

        CREATE TABLE IF NOT EXISTS conversation_summaries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL UNIQUE,
            summary TEXT NOT NULL,
            participants TEXT NOT NULL DEFAULT '[]',
            topic TEXT,
            key_points TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ai_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ai_name TEXT NOT NULL UNIQUE,
            personality TEXT,
            core_values TEXT,
            interests TEXT,
            relationship_notes TEXT,
            last_interaction TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    ",
};

/// Full-text indexes. Applied separately so a SQLite build without FTS5
/// still gets a working store that falls back to substring search.
pub const MEMORY_FTS_V1: Migration = Migration {
    version: 2,
    name: "full_text_indexes",
    sql: "
        CREATE VIRTUAL TABLE IF NOT EXISTS reference_messages_fts USING fts5(
            content,
            conversation_id UNINDEXED,
            message_id UNINDEXED
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS context_documents_fts USING fts5(
            title,
            content,
            row_id UNINDEXED
        );
    ",
};

/// Saved relay checkpoints.
pub const CONVERSATION_SCHEMA_V1: Migration = Migration {
    version: 1,
    name: "saved_conversations",
    sql: "
        CREATE TABLE IF NOT EXISTS saved_conversations (
            name TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            state TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    ",
};
