use async_trait::async_trait;
use constellation_agents::{
    Backend, ChatRole, LlmProvider, LlmRequest, LlmResponse, ProviderGateway, RelayEngine,
    RelayStatus, RetryPolicy,
};
use constellation_common::{
    AgentKind, AgentSlot, Error, HistoryRole, RelayState, Result, SYSTEM_SPEAKER, TranscriptEntry,
};
use constellation_config::{AgentConfig, GatewayConfig, RelayConfig};
use constellation_db::{HydrateOptions, MemoryProvider, MemoryStore, PersistentMemory};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy)]
enum Step {
    Reply(&'static str),
    Fail(&'static str),
    RateLimit,
}

/// Plays back scripted steps, then answers deterministically from the
/// history length so separate runs over the same history agree.
struct ScriptedProvider {
    id: &'static str,
    steps: Mutex<VecDeque<Step>>,
    calls: Arc<AtomicUsize>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedProvider {
    fn new(id: &'static str, steps: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            id,
            steps: Mutex::new(steps.iter().copied().collect()),
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn first_request(&self) -> LlmRequest {
        self.requests.lock().unwrap()[0].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        self.id
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let step = self.steps.lock().unwrap().pop_front();
        let text = match step {
            Some(Step::Reply(text)) => text.to_string(),
            Some(Step::Fail(message)) => return Err(Error::Provider(message.to_string())),
            Some(Step::RateLimit) => {
                return Err(Error::RateLimited(format!(
                    "{} API error: status=429, body=slow down",
                    self.id
                )));
            }
            None => format!("{} reply after {} messages", self.id, request.messages.len()),
        };

        Ok(LlmResponse {
            text,
            model: request.model.clone(),
            usage: None,
            stop_reason: Some("end_turn".to_string()),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

fn relay_config() -> RelayConfig {
    RelayConfig {
        delay_seconds: 0,
        ..RelayConfig::default()
    }
}

fn gateway(claude: &Arc<ScriptedProvider>, grok: &Arc<ScriptedProvider>) -> Arc<ProviderGateway> {
    Arc::new(
        ProviderGateway::new(GatewayConfig::default())
            .with_provider(Backend::Anthropic, claude.clone())
            .with_provider(Backend::OpenRouter, grok.clone())
            .with_retry_policy(RetryPolicy::new(
                5,
                Duration::from_millis(1),
                Duration::from_millis(4),
            )),
    )
}

fn agent_turns(transcript: &[TranscriptEntry]) -> Vec<&TranscriptEntry> {
    transcript.iter().filter(|e| !e.is_system()).collect()
}

fn never() -> bool {
    false
}

#[tokio::test]
async fn full_run_alternates_starting_with_agent_two() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();

    let mut emitted = Vec::new();
    let transcript = engine
        .start(
            "What makes a good question?",
            3,
            |speaker, content| emitted.push((speaker.to_string(), content.to_string())),
            never,
        )
        .await
        .unwrap();

    assert_eq!(engine.status(), RelayStatus::Completed);
    assert!(!engine.naturally_ended());
    assert_eq!(transcript[0].speaker, SYSTEM_SPEAKER);
    assert_eq!(
        transcript[0].content,
        "Conversation started with: What makes a good question?"
    );

    let turns = agent_turns(&transcript);
    assert_eq!(turns.len(), 6);
    for (i, entry) in turns.iter().enumerate() {
        let expected = if i % 2 == 0 { AgentSlot::Agent2 } else { AgentSlot::Agent1 };
        assert_eq!(entry.slot, Some(expected));
    }
    assert_eq!(turns[0].speaker, "Grok");
    assert_eq!(turns[1].speaker, "Claude");

    assert_eq!(emitted.len(), 7);
    assert_eq!(
        emitted[0],
        (
            SYSTEM_SPEAKER.to_string(),
            "Starting conversation: What makes a good question?".to_string()
        )
    );
    assert_eq!(claude.calls(), 3);
    assert_eq!(grok.calls(), 3);

    let opening = grok.first_request();
    assert_eq!(opening.messages.len(), 1);
    assert_eq!(opening.messages[0].role, ChatRole::User);
    assert_eq!(opening.messages[0].content, "What makes a good question?");
    assert_eq!(opening.max_tokens, Some(8192));
    assert!(opening.system.unwrap().contains("your AI friend Claude"));
}

#[tokio::test]
async fn histories_are_mirrors_of_each_other() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();
    engine.start("hello", 2, |_, _| {}, never).await.unwrap();

    let claude_history = engine.history(AgentSlot::Agent1);
    let grok_history = engine.history(AgentSlot::Agent2);

    // The kickoff is extra inbound context for the first mover only.
    assert_eq!(grok_history[0].role, HistoryRole::Partner);
    assert_eq!(grok_history[0].content, "hello");
    let grok_turns = &grok_history[1..];

    assert_eq!(claude_history.len(), grok_turns.len());
    for (mine, theirs) in claude_history.iter().zip(grok_turns) {
        assert_eq!(mine.content, theirs.content);
        assert_ne!(mine.role, theirs.role);
    }
}

#[tokio::test]
async fn stop_request_is_honored_before_the_next_turn() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();

    let checks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&checks);
    let stop_before_turn_three = move || counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3;

    let mut last = String::new();
    let transcript = engine
        .start(
            "go",
            5,
            |_, content| last = content.to_string(),
            stop_before_turn_three,
        )
        .await
        .unwrap();

    assert_eq!(engine.status(), RelayStatus::Stopped);
    assert_eq!(agent_turns(&transcript).len(), 2);
    assert_eq!(last, "Conversation stopped by user.");
    assert_eq!(checks.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn end_marker_completes_the_run_early() {
    let claude = ScriptedProvider::new(
        "claude",
        &[Step::Reply("Lovely chat. Goodbye! [END_CONVERSATION]")],
    );
    let grok = ScriptedProvider::new("grok", &[Step::Reply("Hi Claude!")]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();

    let mut emitted = Vec::new();
    let transcript = engine
        .start("chat", 5, |_, content| emitted.push(content.to_string()), never)
        .await
        .unwrap();

    assert_eq!(engine.status(), RelayStatus::Completed);
    assert!(engine.naturally_ended());
    let turns = agent_turns(&transcript);
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "Lovely chat. Goodbye!");
    assert_eq!(emitted.last().unwrap(), "Lovely chat. Goodbye!");
    assert!(!engine.transcript_text().contains("[END_CONVERSATION]"));
    assert!(engine.get_state().naturally_ended);
}

#[tokio::test]
async fn provider_failure_ends_the_run_without_retry() {
    let claude = ScriptedProvider::new(
        "claude",
        &[Step::Fail("anthropic API error: status=401, body=invalid x-api-key")],
    );
    let grok = ScriptedProvider::new("grok", &[]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();

    let transcript = engine.start("hi", 3, |_, _| {}, never).await.unwrap();

    assert_eq!(engine.status(), RelayStatus::Failed);
    assert_eq!(claude.calls(), 1);
    assert_eq!(grok.calls(), 1);
    assert_eq!(agent_turns(&transcript).len(), 1);

    let last = transcript.last().unwrap();
    assert!(last.is_system());
    assert!(last.content.starts_with("Error during conversation: "));
    assert!(last.content.contains("status=401"));
}

#[tokio::test]
async fn rate_limits_are_retried_inside_the_gateway() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new(
        "grok",
        &[Step::RateLimit, Step::RateLimit, Step::Reply("finally")],
    );
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();

    let transcript = engine.start("hi", 1, |_, _| {}, never).await.unwrap();

    assert_eq!(engine.status(), RelayStatus::Completed);
    assert_eq!(grok.calls(), 3);
    assert_eq!(agent_turns(&transcript)[0].content, "finally");
}

#[tokio::test]
async fn persistent_rate_limit_fails_the_run() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[Step::RateLimit; 6]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();

    let transcript = engine.start("hi", 1, |_, _| {}, never).await.unwrap();

    assert_eq!(engine.status(), RelayStatus::Failed);
    assert_eq!(grok.calls(), 5);
    assert!(transcript.last().unwrap().content.contains("after 5 attempts"));
}

#[tokio::test]
async fn zero_exchanges_is_rejected() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();

    let err = engine.start("hi", 0, |_, _| {}, never).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(engine.status(), RelayStatus::Idle);
}

#[tokio::test]
async fn missing_credentials_fail_before_the_run() {
    let gateway = Arc::new(ProviderGateway::new(GatewayConfig::default()));
    let result = RelayEngine::new(relay_config(), gateway, None).await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn resumed_run_matches_an_uninterrupted_one() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut straight = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();
    straight.start("topic", 2, |_, _| {}, never).await.unwrap();

    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut first = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();
    first.start("topic", 1, |_, _| {}, never).await.unwrap();
    let saved = serde_json::to_string(&first.get_state()).unwrap();

    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut second = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();
    let state: RelayState = serde_json::from_str(&saved).unwrap();
    second.load_state(state).unwrap();
    assert_eq!(second.get_state().next_speaker, AgentSlot::Agent2);

    second.resume(1, |_, _| {}, never).await.unwrap();

    let contents = |entries: &[TranscriptEntry]| -> Vec<(Option<AgentSlot>, String)> {
        entries
            .iter()
            .filter(|e| !e.is_system())
            .map(|e| (e.slot, e.content.clone()))
            .collect()
    };
    assert_eq!(contents(second.transcript()), contents(straight.transcript()));
    for slot in AgentSlot::BOTH {
        assert_eq!(second.history(slot), straight.history(slot));
    }
    assert_eq!(second.conversation_id(), first.conversation_id());
    assert_eq!(grok.calls(), 1);
    assert_eq!(claude.calls(), 1);
}

#[tokio::test]
async fn resume_without_conversation_is_rejected() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();
    let err = engine.resume(1, |_, _| {}, never).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn tampered_state_is_rejected() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();
    engine.start("hi", 1, |_, _| {}, never).await.unwrap();

    let mut state = engine.get_state();
    state.next_speaker = AgentSlot::Agent1;
    assert!(matches!(
        engine.load_state(state),
        Err(Error::InvalidState(_))
    ));
}

#[derive(Default)]
struct RecordingMemory {
    hydrate_calls: AtomicUsize,
    extracted: Mutex<Vec<usize>>,
    archived: Mutex<Vec<usize>>,
    fail: bool,
}

#[async_trait]
impl MemoryProvider for RecordingMemory {
    async fn hydrate(&self, agent: &str, topic: Option<&str>) -> Result<String> {
        self.hydrate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::StoreUnavailable("database is locked".into()));
        }
        Ok(format!("{agent} remembers {}", topic.unwrap_or("nothing")))
    }

    async fn continuity(&self, agent: &str) -> Result<String> {
        Ok(format!("{agent} keeps a journal"))
    }

    async fn extract_and_store(
        &self,
        _conversation_id: &str,
        entries: &[TranscriptEntry],
        _participants: &[String],
    ) -> Result<usize> {
        self.extracted.lock().unwrap().push(entries.len());
        if self.fail {
            return Err(Error::StoreUnavailable("database is locked".into()));
        }
        Ok(entries.len())
    }

    async fn archive_conversation(
        &self,
        _conversation_id: &str,
        transcript: &[TranscriptEntry],
        _participants: &[String],
    ) -> Result<()> {
        self.archived.lock().unwrap().push(transcript.len());
        if self.fail {
            return Err(Error::StoreUnavailable("database is locked".into()));
        }
        Ok(())
    }
}

fn memory_config() -> RelayConfig {
    RelayConfig {
        use_persistent_memory: true,
        ..relay_config()
    }
}

#[tokio::test]
async fn hydrated_memory_reaches_the_system_prompt() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let memory = Arc::new(RecordingMemory::default());
    let mut engine = RelayEngine::new(
        memory_config(),
        gateway(&claude, &grok),
        Some(memory.clone()),
    )
    .await
    .unwrap();

    assert!(engine.system_prompt(AgentSlot::Agent1).contains("Claude remembers nothing"));

    engine.start("black holes", 1, |_, _| {}, never).await.unwrap();
    let prompt = engine.system_prompt(AgentSlot::Agent2);
    assert!(prompt.contains("--- Existing Context/Memory ---\nGrok remembers black holes"));
    assert!(grok.first_request().system.unwrap().contains("Grok remembers black holes"));
}

#[tokio::test]
async fn memory_is_ignored_when_persistence_is_off() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let memory = Arc::new(RecordingMemory::default());
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), Some(memory.clone()))
        .await
        .unwrap();
    engine.start("hi", 1, |_, _| {}, never).await.unwrap();

    assert_eq!(memory.hydrate_calls.load(Ordering::SeqCst), 0);
    assert!(memory.extracted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn post_run_hook_runs_once_and_extracts_only_new_entries() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let memory = Arc::new(RecordingMemory::default());
    let mut engine = RelayEngine::new(
        memory_config(),
        gateway(&claude, &grok),
        Some(memory.clone()),
    )
    .await
    .unwrap();

    engine.start("hi", 1, |_, _| {}, never).await.unwrap();
    assert_eq!(*memory.extracted.lock().unwrap(), vec![3]);
    assert_eq!(*memory.archived.lock().unwrap(), vec![3]);

    engine.resume(1, |_, _| {}, never).await.unwrap();
    assert_eq!(*memory.extracted.lock().unwrap(), vec![3, 2]);
    assert_eq!(*memory.archived.lock().unwrap(), vec![3, 5]);
    assert_eq!(engine.get_state().extracted_entries, 5);
}

#[tokio::test]
async fn memory_failures_never_change_the_outcome() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let memory = Arc::new(RecordingMemory {
        fail: true,
        ..RecordingMemory::default()
    });
    let mut engine = RelayEngine::new(
        memory_config(),
        gateway(&claude, &grok),
        Some(memory.clone()),
    )
    .await
    .unwrap();

    engine.start("hi", 2, |_, _| {}, never).await.unwrap();
    assert_eq!(engine.status(), RelayStatus::Completed);
    assert_eq!(memory.archived.lock().unwrap().len(), 1);
    assert_eq!(engine.get_state().extracted_entries, 0);
}

#[tokio::test]
async fn pascal_gets_a_continuity_block() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut config = memory_config();
    config.agent1 = AgentConfig::new(AgentKind::Pascal, "Pascal", "claude-opus-4-1");
    let memory = Arc::new(RecordingMemory::default());
    let engine = RelayEngine::new(config, gateway(&claude, &grok), Some(memory))
        .await
        .unwrap();

    let prompt = engine.system_prompt(AgentSlot::Agent1);
    assert!(prompt.starts_with("You are Pascal, a Pascal AI."));
    assert!(prompt.ends_with(
        "--- Pascal's Continuity Memory ---\nPascal keeps a journal\n--- End Continuity ---"
    ));
    assert!(!engine.system_prompt(AgentSlot::Agent2).contains("Continuity"));
}

#[tokio::test]
async fn finished_run_lands_in_the_memory_store() {
    let claude = ScriptedProvider::new(
        "claude",
        &[Step::Reply("This is important: remember the plan.")],
    );
    let grok = ScriptedProvider::new("grok", &[Step::Reply("Let's make a plan.")]);
    let store = Arc::new(MemoryStore::in_memory().unwrap());
    let memory = Arc::new(PersistentMemory::new(Arc::clone(&store), HydrateOptions::default()));
    let mut engine = RelayEngine::new(memory_config(), gateway(&claude, &grok), Some(memory))
        .await
        .unwrap();

    engine.start("Plans for the week", 1, |_, _| {}, never).await.unwrap();

    let archived = store.get_archived_messages(engine.conversation_id()).unwrap();
    assert_eq!(archived.len(), 3);
    assert_eq!(store.memory_stats().unwrap().total_memories, 3);
    let important = store.recall_important(5, 0.8).unwrap();
    assert_eq!(important.len(), 1);
    assert_eq!(important[0].speaker, "Claude");
}

#[tokio::test]
async fn engine_runs_on_a_spawned_worker() {
    let claude = ScriptedProvider::new("claude", &[]);
    let grok = ScriptedProvider::new("grok", &[]);
    let mut engine = RelayEngine::new(relay_config(), gateway(&claude, &grok), None)
        .await
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let flag = Arc::clone(&stop);
    let worker = tokio::spawn(async move {
        engine
            .start(
                "hello",
                2,
                move |speaker, content| {
                    let _ = tx.send((speaker.to_string(), content.to_string()));
                },
                move || flag.load(Ordering::SeqCst),
            )
            .await
            .map(|transcript| transcript.len())
    });

    let mut received = 0;
    while rx.recv().await.is_some() {
        received += 1;
    }
    assert_eq!(worker.await.unwrap().unwrap(), 5);
    assert_eq!(received, 5);
}
