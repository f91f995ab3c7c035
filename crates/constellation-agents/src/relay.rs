use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use constellation_common::{
    AgentKind, AgentSlot, Conversation, Error, HistoryMessage, RelayState, Result, SYSTEM_SPEAKER,
    TranscriptEntry, new_conversation_id,
};
use constellation_config::RelayConfig;
use constellation_db::{MemoryProvider, NullMemory};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::gateway::ProviderGateway;
use crate::prompt::{build_system_prompt, combine_context, with_continuity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RelayStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RelayStatus::Completed | RelayStatus::Stopped | RelayStatus::Failed
        )
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RelayStatus::Idle => "idle",
            RelayStatus::Running => "running",
            RelayStatus::Completed => "completed",
            RelayStatus::Stopped => "stopped",
            RelayStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Drives the alternating two-agent conversation.
///
/// The engine owns the transcript and mutates it from a single task; every
/// turn is serial because each reply answers the previous one. Memory is
/// advisory throughout: hydration and the post-run hook log failures and
/// carry on.
pub struct RelayEngine {
    config: RelayConfig,
    gateway: Arc<ProviderGateway>,
    memory: Arc<dyn MemoryProvider>,
    system_prompts: [String; 2],
    conversation: Conversation,
    conversation_id: String,
    status: RelayStatus,
    naturally_ended: bool,
    extracted_entries: usize,
}

impl RelayEngine {
    /// Validate credentials for both agents and build their system prompts.
    ///
    /// Memory is only consulted when `use_persistent_memory` is set; otherwise
    /// a [`NullMemory`] takes its place.
    pub async fn new(
        config: RelayConfig,
        gateway: Arc<ProviderGateway>,
        memory: Option<Arc<dyn MemoryProvider>>,
    ) -> Result<Self> {
        for slot in AgentSlot::BOTH {
            let agent = config.agent(slot);
            gateway.validate(agent.kind(), agent.credential())?;
        }

        let memory: Arc<dyn MemoryProvider> = match memory {
            Some(memory) if config.use_persistent_memory => memory,
            _ => Arc::new(NullMemory),
        };

        let mut engine = Self {
            config,
            gateway,
            memory,
            system_prompts: [String::new(), String::new()],
            conversation: Conversation::new(),
            conversation_id: new_conversation_id(),
            status: RelayStatus::Idle,
            naturally_ended: false,
            extracted_entries: 0,
        };
        let topic = engine.config.topic.clone();
        engine.prepare_prompts(topic.as_deref()).await;
        Ok(engine)
    }

    async fn prepare_prompts(&mut self, topic: Option<&str>) {
        for slot in AgentSlot::BOTH {
            let agent = self.config.agent(slot);
            let partner = self.config.agent(slot.other());

            let hydrated = if self.memory.is_enabled() {
                match self.memory.hydrate(agent.name(), topic).await {
                    Ok(context) => context,
                    Err(e) => {
                        warn!("memory hydration for {} failed: {}", agent.name(), e);
                        String::new()
                    }
                }
            } else {
                String::new()
            };

            let context = combine_context(&hydrated, &agent.profile.static_context);
            let mut prompt = build_system_prompt(
                agent.name(),
                partner.name(),
                agent.kind().label(),
                &agent.profile.personality_prompt,
                &context,
                &self.config.end_marker,
            );

            if agent.kind() == AgentKind::Pascal && self.memory.is_enabled() {
                match self.memory.continuity(agent.name()).await {
                    Ok(continuity) => {
                        prompt = with_continuity(&prompt, agent.name(), &continuity);
                    }
                    Err(e) => warn!("continuity load for {} failed: {}", agent.name(), e),
                }
            }

            self.system_prompts[slot.index()] = prompt;
        }
    }

    /// Run a fresh conversation of up to `max_exchanges` exchanges.
    ///
    /// Provider failures end the run as [`RelayStatus::Failed`] with a System
    /// entry; the partial transcript is still returned.
    pub async fn start<M, S>(
        &mut self,
        kickoff: &str,
        max_exchanges: usize,
        mut on_message: M,
        check_stop: S,
    ) -> Result<Vec<TranscriptEntry>>
    where
        M: FnMut(&str, &str) + Send,
        S: Fn() -> bool + Send + Sync,
    {
        if max_exchanges == 0 {
            return Err(Error::InvalidState(
                "max_exchanges must be at least 1".to_string(),
            ));
        }

        self.conversation = Conversation::seeded(kickoff);
        self.conversation_id = new_conversation_id();
        self.naturally_ended = false;
        self.extracted_entries = 0;
        self.status = RelayStatus::Running;

        if self.config.topic.is_none() && self.memory.is_enabled() {
            self.prepare_prompts(Some(kickoff)).await;
        }

        info!(
            conversation_id = %self.conversation_id,
            "starting relay for {} exchange(s)", max_exchanges
        );
        self.conversation
            .record_system(format!("Conversation started with: {kickoff}"));
        on_message(SYSTEM_SPEAKER, &format!("Starting conversation: {kickoff}"));

        self.run_turns(max_exchanges * 2, &mut on_message, &check_stop)
            .await?;
        Ok(self.conversation.transcript().to_vec())
    }

    /// Continue the current (or loaded) conversation for more exchanges.
    /// The next speaker follows from the transcript's turn parity.
    pub async fn resume<M, S>(
        &mut self,
        additional_exchanges: usize,
        mut on_message: M,
        check_stop: S,
    ) -> Result<Vec<TranscriptEntry>>
    where
        M: FnMut(&str, &str) + Send,
        S: Fn() -> bool + Send + Sync,
    {
        if additional_exchanges == 0 {
            return Err(Error::InvalidState(
                "additional_exchanges must be at least 1".to_string(),
            ));
        }
        if self.conversation.is_empty() && self.conversation.seed().is_none() {
            return Err(Error::InvalidState(
                "no conversation to resume; start one or load a saved state".to_string(),
            ));
        }

        self.naturally_ended = false;
        self.status = RelayStatus::Running;
        info!(
            conversation_id = %self.conversation_id,
            next = %self.conversation.next_speaker(),
            "resuming relay for {} exchange(s)", additional_exchanges
        );

        self.run_turns(additional_exchanges * 2, &mut on_message, &check_stop)
            .await?;
        Ok(self.conversation.transcript().to_vec())
    }

    #[instrument(skip_all, fields(conversation_id = %self.conversation_id, turns = total_turns))]
    async fn run_turns<M, S>(
        &mut self,
        total_turns: usize,
        on_message: &mut M,
        check_stop: &S,
    ) -> Result<()>
    where
        M: FnMut(&str, &str) + Send,
        S: Fn() -> bool + Send + Sync,
    {
        let delay = Duration::from_secs(self.config.delay_seconds);

        for turn in 0..total_turns {
            if check_stop() {
                self.status = RelayStatus::Stopped;
                info!("relay stopped before turn {}", turn + 1);
                on_message(SYSTEM_SPEAKER, "Conversation stopped by user.");
                break;
            }

            let slot = self.conversation.next_speaker();
            let agent = self.config.agent(slot);
            let history = self.conversation.history(slot);

            let reply = self
                .gateway
                .invoke(
                    agent.kind(),
                    agent.model(),
                    &history,
                    &self.system_prompts[slot.index()],
                    agent.credential(),
                )
                .await;

            match reply {
                Ok(reply) => {
                    let (content, ended) = strip_end_marker(&reply, &self.config.end_marker);
                    let speaker = agent.name().to_string();
                    self.conversation.record_turn(slot, speaker.as_str(), content.as_str())?;
                    on_message(&speaker, &content);

                    if ended {
                        info!("{} ended the conversation", speaker);
                        self.naturally_ended = true;
                        self.status = RelayStatus::Completed;
                        break;
                    }
                }
                Err(e) => {
                    warn!("turn {} for {} failed: {}", turn + 1, slot, e);
                    let message = format!("Error during conversation: {e}");
                    self.conversation.record_system(message.as_str());
                    on_message(SYSTEM_SPEAKER, &message);
                    self.status = RelayStatus::Failed;
                    break;
                }
            }

            if turn + 1 < total_turns && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        if self.status == RelayStatus::Running {
            self.status = RelayStatus::Completed;
        }
        self.after_run().await;
        Ok(())
    }

    /// Hand new transcript entries to extraction and re-archive the whole
    /// conversation. Runs once per terminal transition.
    async fn after_run(&mut self) {
        let participants = self.participants();
        let transcript = self.conversation.transcript();
        let total = transcript.len();
        let pending = &transcript[self.extracted_entries.min(total)..];

        match self
            .memory
            .extract_and_store(&self.conversation_id, pending, &participants)
            .await
        {
            Ok(stored) => {
                if stored > 0 {
                    info!("stored {} memories from {}", stored, self.conversation_id);
                }
                self.extracted_entries = total;
            }
            Err(e) => warn!("memory extraction failed: {}", e),
        }

        if let Err(e) = self
            .memory
            .archive_conversation(&self.conversation_id, transcript, &participants)
            .await
        {
            warn!("conversation archive failed: {}", e);
        }
    }

    fn participants(&self) -> Vec<String> {
        AgentSlot::BOTH
            .iter()
            .map(|slot| self.config.agent(*slot).name().to_string())
            .collect()
    }

    /// Checkpoint everything needed to resume later.
    pub fn get_state(&self) -> RelayState {
        RelayState {
            conversation_id: self.conversation_id.clone(),
            agents: [
                self.config.agent1.profile.clone(),
                self.config.agent2.profile.clone(),
            ],
            system_prompts: self.system_prompts.clone(),
            kickoff: self.conversation.seed().map(str::to_string),
            histories: [
                self.conversation.history(AgentSlot::Agent1),
                self.conversation.history(AgentSlot::Agent2),
            ],
            transcript: self.conversation.transcript().to_vec(),
            next_speaker: self.conversation.next_speaker(),
            naturally_ended: self.naturally_ended,
            extracted_entries: self.extracted_entries,
        }
    }

    /// Restore a checkpoint. The stored agent profiles replace the configured
    /// ones; configured credentials are kept.
    pub fn load_state(&mut self, state: RelayState) -> Result<()> {
        let conversation = state.conversation()?;

        for slot in AgentSlot::BOTH {
            let profile = &state.agents[slot.index()];
            let credential = self.config.agent(slot).credential();
            self.gateway.validate(profile.kind, credential)?;
        }

        let [agent1, agent2] = state.agents;
        self.config.agent1.profile = agent1;
        self.config.agent2.profile = agent2;
        self.system_prompts = state.system_prompts;
        self.conversation = conversation;
        self.conversation_id = state.conversation_id;
        self.naturally_ended = state.naturally_ended;
        self.extracted_entries = state.extracted_entries;
        self.status = RelayStatus::Idle;
        Ok(())
    }

    pub fn status(&self) -> RelayStatus {
        self.status
    }

    pub fn naturally_ended(&self) -> bool {
        self.naturally_ended
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.conversation.transcript()
    }

    pub fn transcript_text(&self) -> String {
        self.conversation.render_text()
    }

    pub fn history(&self, slot: AgentSlot) -> Vec<HistoryMessage> {
        self.conversation.history(slot)
    }

    pub fn system_prompt(&self, slot: AgentSlot) -> &str {
        &self.system_prompts[slot.index()]
    }
}

/// Remove every occurrence of `marker`; reports whether one was present.
fn strip_end_marker(reply: &str, marker: &str) -> (String, bool) {
    if marker.is_empty() || !reply.contains(marker) {
        return (reply.to_string(), false);
    }
    (reply.replace(marker, "").trim().to_string(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_marker_is_stripped_and_trimmed() {
        let (content, ended) =
            strip_end_marker("Goodbye, friend! [END_CONVERSATION]", "[END_CONVERSATION]");
        assert!(ended);
        assert_eq!(content, "Goodbye, friend!");

        let (content, ended) = strip_end_marker("  keep going  ", "[END_CONVERSATION]");
        assert!(!ended);
        assert_eq!(content, "  keep going  ");
    }

    #[test]
    fn empty_marker_never_ends() {
        assert_eq!(strip_end_marker("anything", ""), ("anything".to_string(), false));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RelayStatus::Idle.is_terminal());
        assert!(!RelayStatus::Running.is_terminal());
        assert!(RelayStatus::Completed.is_terminal());
        assert!(RelayStatus::Stopped.is_terminal());
        assert!(RelayStatus::Failed.is_terminal());
        assert_eq!(RelayStatus::Failed.to_string(), "failed");
    }
}
