pub mod agent;
pub mod conversation;
pub mod error;

pub use agent::{AgentKind, AgentProfile};
pub use conversation::{
    AgentSlot, Conversation, HistoryMessage, HistoryRole, RelayState, SYSTEM_SPEAKER,
    TranscriptEntry, new_conversation_id, render_transcript,
};
pub use error::{Error, Result};
