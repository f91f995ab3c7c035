pub mod archive;
pub mod conversation_store;
pub mod diary;
pub mod extraction;
pub mod hydrator;
pub mod memory_store;
pub mod migrations;
pub mod profiles;
pub mod provider;
pub mod summaries;

pub use archive::{ArchiveHit, ReferenceConversation, ReferenceMessage};
pub use conversation_store::{ConversationRecord, ConversationStore, SavedConversation};
pub use diary::{
    ContextDocument, DEFAULT_DIGEST_CHUNK_CHARS, SHARED_OWNER, chunk_paragraphs,
    continuity_document_id,
};
pub use extraction::{score_importance, score_valence};
pub use hydrator::{ContextHydrator, DIGESTED_SUFFIX, HydrateOptions};
pub use memory_store::{Memory, MemoryStats, MemoryStore, MemoryType, NewMemory};
pub use profiles::{AiProfile, ProfileUpdate};
pub use provider::{MemoryProvider, NullMemory, PersistentMemory};
pub use summaries::ConversationSummary;
