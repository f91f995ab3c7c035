use std::sync::Arc;

use async_trait::async_trait;
use constellation_common::{Error, Result, TranscriptEntry};
use tracing::warn;

use crate::hydrator::{ContextHydrator, HydrateOptions};
use crate::memory_store::MemoryStore;
use crate::summaries::ConversationSummary;

/// The memory capability the relay engine depends on.
///
/// Every call is advisory: callers log failures and carry on.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// False for the null implementation.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Prompt preamble for `agent`, or an empty string.
    async fn hydrate(&self, agent: &str, topic: Option<&str>) -> Result<String>;

    /// Continuity block for a persistent persona, or an empty string.
    async fn continuity(&self, agent: &str) -> Result<String>;

    async fn extract_and_store(
        &self,
        conversation_id: &str,
        entries: &[TranscriptEntry],
        participants: &[String],
    ) -> Result<usize>;

    async fn archive_conversation(
        &self,
        conversation_id: &str,
        transcript: &[TranscriptEntry],
        participants: &[String],
    ) -> Result<()>;
}

/// Stand-in used when persistent memory is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMemory;

#[async_trait]
impl MemoryProvider for NullMemory {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn hydrate(&self, _agent: &str, _topic: Option<&str>) -> Result<String> {
        Ok(String::new())
    }

    async fn continuity(&self, _agent: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn extract_and_store(
        &self,
        _conversation_id: &str,
        _entries: &[TranscriptEntry],
        _participants: &[String],
    ) -> Result<usize> {
        Ok(0)
    }

    async fn archive_conversation(
        &self,
        _conversation_id: &str,
        _transcript: &[TranscriptEntry],
        _participants: &[String],
    ) -> Result<()> {
        Ok(())
    }
}

/// SQLite-backed memory.
pub struct PersistentMemory {
    store: Arc<MemoryStore>,
    options: HydrateOptions,
}

impl PersistentMemory {
    pub fn new(store: Arc<MemoryStore>, options: HydrateOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Run blocking SQLite work on tokio's blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&MemoryStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| Error::StoreUnavailable(format!("memory task failed: {e}")))?
    }
}

#[async_trait]
impl MemoryProvider for PersistentMemory {
    async fn hydrate(&self, agent: &str, topic: Option<&str>) -> Result<String> {
        let options = self.options.clone();
        let agent = agent.to_string();
        let topic = topic.map(str::to_string);
        self.blocking(move |store| {
            // Fail once up front instead of once per section.
            store.connect()?;
            Ok(ContextHydrator::new(store, options).hydrate(&agent, topic.as_deref()))
        })
        .await
    }

    async fn continuity(&self, agent: &str) -> Result<String> {
        let options = self.options.clone();
        let agent = agent.to_string();
        self.blocking(move |store| {
            store.connect()?;
            Ok(ContextHydrator::new(store, options).continuity(&agent))
        })
        .await
    }

    async fn extract_and_store(
        &self,
        conversation_id: &str,
        entries: &[TranscriptEntry],
        participants: &[String],
    ) -> Result<usize> {
        let conversation_id = conversation_id.to_string();
        let entries = entries.to_vec();
        let participants = participants.to_vec();
        self.blocking(move |store| {
            store.extract_and_store(&conversation_id, &entries, &participants)
        })
        .await
    }

    async fn archive_conversation(
        &self,
        conversation_id: &str,
        transcript: &[TranscriptEntry],
        participants: &[String],
    ) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        let transcript = transcript.to_vec();
        let participants = participants.to_vec();
        self.blocking(move |store| {
            store.archive_conversation(&conversation_id, &transcript, &participants, None)?;

            let summary = ConversationSummary::from_transcript(
                &conversation_id,
                &transcript,
                &participants,
                None,
            );
            if let Err(e) = store.save_conversation_summary(&summary) {
                warn!("failed to save summary for {conversation_id}: {e}");
            }
            Ok(())
        })
        .await
    }
}
