use chrono::{DateTime, Utc};
use constellation_common::{Error, RelayState, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tracing::{info, warn};

use crate::memory_store::{now_timestamp, parse_timestamp};
use crate::migrations::CONVERSATION_SCHEMA_V1;

/// A named relay checkpoint as saved by the controlling collaborator.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub state: RelayState,
    /// Relay construction input with every credential removed.
    pub config: serde_json::Value,
}

/// Listing row for saved conversations.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedConversation {
    pub name: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent storage for saved relay conversations.
pub struct ConversationStore {
    conn: Connection,
}

impl ConversationStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening conversation store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::StoreUnavailable(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::StoreUnavailable(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            Error::StoreUnavailable(format!("failed to open in-memory database: {e}"))
        })?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        CONVERSATION_SCHEMA_V1.apply(&self.conn).map_err(|e| {
            Error::StoreUnavailable(format!(
                "migration '{}' failed: {e}",
                CONVERSATION_SCHEMA_V1.name
            ))
        })
    }

    /// Save under `record.name`, replacing any existing save with that name.
    pub fn save(&self, record: &ConversationRecord) -> Result<()> {
        let state = serde_json::to_string(&record.state)?;
        let mut config = record.config.clone();
        if scrub_credentials(&mut config) {
            warn!("removed credential fields from saved config '{}'", record.name);
        }
        let created_at = record
            .created_at
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        self.conn
            .execute(
                "INSERT INTO saved_conversations
                    (name, conversation_id, state, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(name) DO UPDATE SET
                   conversation_id = excluded.conversation_id,
                   state = excluded.state,
                   config = excluded.config,
                   created_at = excluded.created_at,
                   updated_at = excluded.updated_at",
                params![
                    record.name,
                    record.state.conversation_id,
                    state,
                    config.to_string(),
                    created_at,
                    now_timestamp(),
                ],
            )
            .map_err(|e| Error::StoreUnavailable(format!("failed to save conversation: {e}")))?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Option<ConversationRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, state, config, created_at FROM saved_conversations WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::StoreUnavailable(format!("failed to load conversation: {e}")))?;

        let Some((name, state, config, created_at)) = row else {
            return Ok(None);
        };

        Ok(Some(ConversationRecord {
            name,
            created_at: parse_timestamp(&created_at),
            state: serde_json::from_str(&state)?,
            config: serde_json::from_str(&config).unwrap_or_else(|e| {
                warn!("failed to parse saved config: {e}");
                serde_json::Value::Null
            }),
        }))
    }

    /// Saved conversations, newest first.
    pub fn list(&self) -> Result<Vec<SavedConversation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, conversation_id, created_at, updated_at
                 FROM saved_conversations
                 ORDER BY created_at DESC, name ASC",
            )
            .map_err(|e| Error::StoreUnavailable(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                let created_at: String = row.get(2)?;
                let updated_at: String = row.get(3)?;
                Ok(SavedConversation {
                    name: row.get(0)?,
                    conversation_id: row.get(1)?,
                    created_at: parse_timestamp(&created_at),
                    updated_at: parse_timestamp(&updated_at),
                })
            })
            .map_err(|e| Error::StoreUnavailable(format!("failed to list conversations: {e}")))?;

        let mut saved = Vec::new();
        for row in rows {
            saved.push(
                row.map_err(|e| Error::StoreUnavailable(format!("failed to read row: {e}")))?,
            );
        }
        Ok(saved)
    }

    /// Returns true if a save with that name existed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM saved_conversations WHERE name = ?1",
                params![name],
            )
            .map_err(|e| Error::StoreUnavailable(format!("failed to delete conversation: {e}")))?;
        Ok(count > 0)
    }
}

fn is_credential_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key == "credential" || key == "api_key" || key.ends_with("_api_key")
}

/// Drop credential-like keys at any depth. Returns true if anything was removed.
fn scrub_credentials(value: &mut serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => {
            let before = map.len();
            map.retain(|key, _| !is_credential_key(key));
            let mut removed = map.len() != before;
            for child in map.values_mut() {
                removed |= scrub_credentials(child);
            }
            removed
        }
        serde_json::Value::Array(items) => {
            let mut removed = false;
            for item in items {
                removed |= scrub_credentials(item);
            }
            removed
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use constellation_common::{AgentKind, AgentProfile, AgentSlot, Conversation};

    fn state(conversation_id: &str) -> RelayState {
        let mut conversation = Conversation::seeded("hello");
        conversation.record_system("Conversation started with: hello");
        conversation
            .record_turn(AgentSlot::Agent2, "Grok", "hi Claude")
            .unwrap();
        RelayState {
            conversation_id: conversation_id.to_string(),
            agents: [
                AgentProfile::new(AgentKind::Claude, "Claude", "claude-opus-4-1"),
                AgentProfile::new(AgentKind::Grok, "Grok", "x-ai/grok-4.1-fast"),
            ],
            system_prompts: ["p1".into(), "p2".into()],
            kickoff: Some("hello".into()),
            histories: [
                conversation.history(AgentSlot::Agent1),
                conversation.history(AgentSlot::Agent2),
            ],
            transcript: conversation.transcript().to_vec(),
            next_speaker: conversation.next_speaker(),
            naturally_ended: false,
            extracted_entries: 0,
        }
    }

    fn record(name: &str, conversation_id: &str) -> ConversationRecord {
        ConversationRecord {
            name: name.to_string(),
            created_at: Utc::now(),
            state: state(conversation_id),
            config: serde_json::json!({"delay_seconds": 5}),
        }
    }

    #[test]
    fn save_and_load_round_trips_state() {
        let store = ConversationStore::in_memory().unwrap();
        store.save(&record("evening chat", "relay_1")).unwrap();

        let loaded = store.load("evening chat").unwrap().unwrap();
        assert_eq!(loaded.state.conversation_id, "relay_1");
        assert_eq!(loaded.state.transcript.len(), 2);
        assert_eq!(loaded.state.next_speaker, AgentSlot::Agent1);
        assert!(loaded.state.conversation().is_ok());
        assert_eq!(loaded.config["delay_seconds"], 5);
    }

    #[test]
    fn saving_same_name_replaces() {
        let store = ConversationStore::in_memory().unwrap();
        store.save(&record("chat", "relay_1")).unwrap();
        store.save(&record("chat", "relay_2")).unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].conversation_id, "relay_2");
    }

    #[test]
    fn credentials_never_reach_disk() {
        let store = ConversationStore::in_memory().unwrap();
        let mut rec = record("chat", "relay_1");
        rec.config = serde_json::json!({
            "agent1": {"name": "Claude", "credential": "sk-ant-secret"},
            "gateway": {"anthropic_api_key": "sk-ant-other"},
        });
        store.save(&rec).unwrap();

        let raw: String = store
            .conn
            .query_row("SELECT config FROM saved_conversations", [], |row| row.get(0))
            .unwrap();
        assert!(!raw.contains("secret"));
        assert!(!raw.contains("sk-ant-other"));
        assert!(raw.contains("Claude"));
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() {
        let store = ConversationStore::in_memory().unwrap();
        store.save(&record("chat", "relay_1")).unwrap();
        assert!(store.delete("chat").unwrap());
        assert!(!store.delete("chat").unwrap());
        assert!(store.load("chat").unwrap().is_none());
    }
}
