use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::agent::AgentProfile;
use crate::error::{Error, Result};

/// Speaker name used for transcript entries that are not agent turns.
pub const SYSTEM_SPEAKER: &str = "System";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Role token identifying one side of the two-party relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentSlot {
    #[serde(rename = "agent-1")]
    Agent1,
    #[serde(rename = "agent-2")]
    Agent2,
}

impl AgentSlot {
    pub const BOTH: [AgentSlot; 2] = [AgentSlot::Agent1, AgentSlot::Agent2];

    /// The slot that replies first, answering the kickoff message.
    pub const FIRST_MOVER: AgentSlot = AgentSlot::Agent2;

    pub fn other(self) -> Self {
        match self {
            AgentSlot::Agent1 => AgentSlot::Agent2,
            AgentSlot::Agent2 => AgentSlot::Agent1,
        }
    }

    pub fn index(self) -> usize {
        match self {
            AgentSlot::Agent1 => 0,
            AgentSlot::Agent2 => 1,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            AgentSlot::Agent1 => "agent-1",
            AgentSlot::Agent2 => "agent-2",
        }
    }
}

impl fmt::Display for AgentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Perspective of a history entry relative to the agent that owns the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    /// Authored by the owning agent.
    Speaker,
    /// Received from the other side (partner turn or kickoff).
    Partner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: HistoryRole,
    pub content: String,
}

impl HistoryMessage {
    pub fn speaker(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Speaker,
            content: content.into(),
        }
    }

    pub fn partner(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Partner,
            content: content.into(),
        }
    }
}

/// One line of the canonical conversation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub speaker: String,
    pub content: String,
    /// Agent that produced this entry; `None` for System entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<AgentSlot>,
}

impl TranscriptEntry {
    pub fn is_system(&self) -> bool {
        self.slot.is_none()
    }

    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// `"[timestamp] speaker:\ncontent\n"`
    pub fn render(&self) -> String {
        format!(
            "[{}] {}:\n{}\n",
            self.formatted_timestamp(),
            self.speaker,
            self.content
        )
    }
}

/// Render entries in the downloadable transcript format, separated by blank lines.
pub fn render_transcript(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(TranscriptEntry::render)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn new_conversation_id() -> String {
    format!("relay_{}", uuid::Uuid::new_v4().simple())
}

/// Append-only ledger of a relay conversation.
///
/// Agent-local histories are always derived from the transcript, so the two
/// views cannot drift apart: every agent turn shows up once in each history,
/// as `Speaker` for its author and `Partner` for the other side. The kickoff
/// seed is an inbound message for the first mover only and is not a turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    seed: Option<String>,
    transcript: Vec<TranscriptEntry>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(kickoff: impl Into<String>) -> Self {
        Self {
            seed: Some(kickoff.into()),
            transcript: Vec::new(),
        }
    }

    /// Rebuild a ledger from persisted parts, rejecting transcripts whose agent
    /// turns do not strictly alternate starting with the first mover.
    pub fn from_parts(seed: Option<String>, transcript: Vec<TranscriptEntry>) -> Result<Self> {
        let mut expected = AgentSlot::FIRST_MOVER;
        for (index, entry) in transcript.iter().enumerate() {
            if let Some(slot) = entry.slot {
                if slot != expected {
                    return Err(Error::InvalidState(format!(
                        "transcript entry {index} was spoken by {slot}, expected {expected}"
                    )));
                }
                expected = expected.other();
            }
        }
        Ok(Self { seed, transcript })
    }

    pub fn seed(&self) -> Option<&str> {
        self.seed.as_deref()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn is_empty(&self) -> bool {
        self.transcript.is_empty()
    }

    /// Record an agent reply. Fails if it is not `slot`'s turn.
    pub fn record_turn(
        &mut self,
        slot: AgentSlot,
        speaker: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<&TranscriptEntry> {
        let expected = self.next_speaker();
        if slot != expected {
            return Err(Error::InvalidState(format!(
                "{slot} cannot speak out of turn; {expected} is next"
            )));
        }
        self.transcript.push(TranscriptEntry {
            timestamp: Utc::now(),
            speaker: speaker.into(),
            content: content.into(),
            slot: Some(slot),
        });
        Ok(self.last_entry())
    }

    pub fn record_system(&mut self, content: impl Into<String>) -> &TranscriptEntry {
        self.transcript.push(TranscriptEntry {
            timestamp: Utc::now(),
            speaker: SYSTEM_SPEAKER.to_string(),
            content: content.into(),
            slot: None,
        });
        self.last_entry()
    }

    fn last_entry(&self) -> &TranscriptEntry {
        // Only called right after a push.
        &self.transcript[self.transcript.len() - 1]
    }

    /// Number of non-System entries.
    pub fn agent_turns(&self) -> usize {
        self.transcript.iter().filter(|e| !e.is_system()).count()
    }

    /// Whose turn is next, from the parity of recorded agent turns.
    pub fn next_speaker(&self) -> AgentSlot {
        if self.agent_turns() % 2 == 0 {
            AgentSlot::FIRST_MOVER
        } else {
            AgentSlot::FIRST_MOVER.other()
        }
    }

    /// Agent turns seen from `slot`'s perspective, excluding the kickoff seed.
    pub fn turn_history(&self, slot: AgentSlot) -> Vec<HistoryMessage> {
        self.transcript
            .iter()
            .filter_map(|entry| {
                let author = entry.slot?;
                Some(if author == slot {
                    HistoryMessage::speaker(entry.content.clone())
                } else {
                    HistoryMessage::partner(entry.content.clone())
                })
            })
            .collect()
    }

    /// The rolling message history sent to `slot`'s provider.
    pub fn history(&self, slot: AgentSlot) -> Vec<HistoryMessage> {
        let mut history = Vec::new();
        if slot == AgentSlot::FIRST_MOVER
            && let Some(seed) = &self.seed
        {
            history.push(HistoryMessage::partner(seed.clone()));
        }
        history.extend(self.turn_history(slot));
        history
    }

    pub fn render_text(&self) -> String {
        render_transcript(&self.transcript)
    }
}

/// Resumable snapshot of a relay run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayState {
    pub conversation_id: String,
    pub agents: [AgentProfile; 2],
    pub system_prompts: [String; 2],
    #[serde(default)]
    pub kickoff: Option<String>,
    pub histories: [Vec<HistoryMessage>; 2],
    pub transcript: Vec<TranscriptEntry>,
    pub next_speaker: AgentSlot,
    #[serde(default)]
    pub naturally_ended: bool,
    /// Transcript entries already handed to memory extraction.
    #[serde(default)]
    pub extracted_entries: usize,
}

impl RelayState {
    /// Rebuild the ledger and check that the stored histories and next
    /// speaker agree with it.
    pub fn conversation(&self) -> Result<Conversation> {
        let conversation = Conversation::from_parts(self.kickoff.clone(), self.transcript.clone())?;

        for slot in AgentSlot::BOTH {
            if conversation.history(slot) != self.histories[slot.index()] {
                return Err(Error::InvalidState(format!(
                    "stored history for {slot} does not match the transcript"
                )));
            }
        }

        if conversation.next_speaker() != self.next_speaker {
            return Err(Error::InvalidState(format!(
                "stored next speaker {} does not match transcript parity ({})",
                self.next_speaker,
                conversation.next_speaker()
            )));
        }

        if self.extracted_entries > self.transcript.len() {
            return Err(Error::InvalidState(
                "extraction cursor is past the end of the transcript".to_string(),
            ));
        }

        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentKind, AgentProfile};

    fn sample() -> Conversation {
        let mut conversation = Conversation::seeded("Let's talk about stars.");
        conversation.record_system("Conversation started with: Let's talk about stars.");
        conversation
            .record_turn(AgentSlot::Agent2, "Grok", "Stars are neat.")
            .unwrap();
        conversation
            .record_turn(AgentSlot::Agent1, "Claude", "Agreed, tell me more.")
            .unwrap();
        conversation
            .record_turn(AgentSlot::Agent2, "Grok", "Fusion!")
            .unwrap();
        conversation
    }

    #[test]
    fn turn_histories_are_role_swapped_mirrors() {
        let conversation = sample();
        let first = conversation.turn_history(AgentSlot::Agent1);
        let second = conversation.turn_history(AgentSlot::Agent2);

        assert_eq!(first.len(), 3);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.content, b.content);
            assert_ne!(a.role, b.role);
        }
        assert_eq!(second[0].role, HistoryRole::Speaker);
        assert_eq!(first[0].role, HistoryRole::Partner);
    }

    #[test]
    fn kickoff_seed_only_reaches_first_mover() {
        let conversation = sample();
        let grok = conversation.history(AgentSlot::Agent2);
        let claude = conversation.history(AgentSlot::Agent1);

        assert_eq!(grok[0], HistoryMessage::partner("Let's talk about stars."));
        assert_eq!(grok.len(), 4);
        assert_eq!(claude.len(), 3);
        assert_eq!(claude[0], HistoryMessage::partner("Stars are neat."));
    }

    #[test]
    fn out_of_turn_reply_is_rejected() {
        let mut conversation = Conversation::seeded("hi");
        let err = conversation
            .record_turn(AgentSlot::Agent1, "Claude", "me first")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(conversation.is_empty());
    }

    #[test]
    fn next_speaker_ignores_system_entries() {
        let mut conversation = sample();
        assert_eq!(conversation.next_speaker(), AgentSlot::Agent1);
        conversation.record_system("Error during conversation: boom");
        assert_eq!(conversation.next_speaker(), AgentSlot::Agent1);
    }

    #[test]
    fn render_separates_entries_with_blank_lines() {
        let conversation = sample();
        let text = conversation.render_text();
        let blocks: Vec<&str> = text.split("\n\n").collect();
        assert_eq!(blocks.len(), 4);
        assert!(blocks[1].starts_with('['));
        assert!(blocks[1].contains("] Grok:\nStars are neat."));
        assert!(text.ends_with("Fusion!\n"));
    }

    #[test]
    fn from_parts_rejects_broken_alternation() {
        let mut transcript = sample().transcript().to_vec();
        transcript.swap(1, 2);
        assert!(Conversation::from_parts(None, transcript).is_err());
    }

    #[test]
    fn state_consistency_check_detects_tampered_history() {
        let conversation = sample();
        let mut state = RelayState {
            conversation_id: new_conversation_id(),
            agents: [
                AgentProfile::new(AgentKind::Claude, "Claude", "claude-opus-4-1"),
                AgentProfile::new(AgentKind::Grok, "Grok", "x-ai/grok-4.1-fast"),
            ],
            system_prompts: ["a".into(), "b".into()],
            kickoff: conversation.seed().map(str::to_string),
            histories: [
                conversation.history(AgentSlot::Agent1),
                conversation.history(AgentSlot::Agent2),
            ],
            transcript: conversation.transcript().to_vec(),
            next_speaker: conversation.next_speaker(),
            naturally_ended: false,
            extracted_entries: 0,
        };
        assert_eq!(state.conversation().unwrap(), conversation);

        state.histories[0].push(HistoryMessage::speaker("injected"));
        assert!(state.conversation().is_err());
    }
}
