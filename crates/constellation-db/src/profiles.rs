use chrono::{DateTime, Utc};
use constellation_common::Result;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::memory_store::{
    MemoryStore, from_json_list, now_timestamp, parse_timestamp, to_json_list,
};

/// What the store knows about one agent across conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiProfile {
    pub ai_name: String,
    pub personality: Option<String>,
    pub core_values: Vec<String>,
    pub interests: Vec<String>,
    pub relationship_notes: Option<String>,
    pub last_interaction: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub personality: Option<String>,
    pub core_values: Option<Vec<String>>,
    pub interests: Option<Vec<String>>,
    pub relationship_notes: Option<String>,
}

impl MemoryStore {
    /// Create or update a profile and stamp its last interaction time.
    pub fn update_ai_profile(&self, ai_name: &str, update: &ProfileUpdate) -> Result<()> {
        let now = now_timestamp();
        let core_values = update.core_values.as_deref().map(to_json_list);
        let interests = update.interests.as_deref().map(to_json_list);

        self.with_conn("update ai profile", |conn| {
            conn.execute(
                "INSERT INTO ai_profiles
                    (ai_name, personality, core_values, interests, relationship_notes,
                     last_interaction, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)
                 ON CONFLICT(ai_name) DO UPDATE SET
                    personality = COALESCE(excluded.personality, ai_profiles.personality),
                    core_values = COALESCE(excluded.core_values, ai_profiles.core_values),
                    interests = COALESCE(excluded.interests, ai_profiles.interests),
                    relationship_notes =
                        COALESCE(excluded.relationship_notes, ai_profiles.relationship_notes),
                    last_interaction = excluded.last_interaction,
                    updated_at = excluded.updated_at",
                params![
                    ai_name,
                    update.personality,
                    core_values,
                    interests,
                    update.relationship_notes,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_ai_profile(&self, ai_name: &str) -> Result<Option<AiProfile>> {
        self.with_conn("load ai profile", |conn| {
            conn.query_row(
                "SELECT ai_name, personality, core_values, interests, relationship_notes,
                        last_interaction, created_at, updated_at
                 FROM ai_profiles WHERE ai_name = ?1",
                params![ai_name],
                |row| {
                    let last_interaction: Option<String> = row.get(5)?;
                    let created_at: String = row.get(6)?;
                    let updated_at: String = row.get(7)?;
                    Ok(AiProfile {
                        ai_name: row.get(0)?,
                        personality: row.get(1)?,
                        core_values: from_json_list(row.get(2)?),
                        interests: from_json_list(row.get(3)?),
                        relationship_notes: row.get(4)?,
                        last_interaction: last_interaction.as_deref().map(parse_timestamp),
                        created_at: parse_timestamp(&created_at),
                        updated_at: parse_timestamp(&updated_at),
                    })
                },
            )
            .optional()
        })
    }
}
