use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Args;
use constellation_agents::{ProviderGateway, RelayEngine, RelayStatus, resolve_model};
use constellation_common::{AgentKind, SYSTEM_SPEAKER, TranscriptEntry};
use constellation_config::{AppConfig, MemoryConfig, RelayConfig};
use constellation_db::{
    ConversationRecord, ConversationStore, HydrateOptions, MemoryProvider, MemoryStore,
    PersistentMemory,
};
use constellation_security::mask_secret;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{AgentKeys, conversations_db_path, ensure_parent_dir};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Opening message handed to agent 2.
    #[arg(short, long)]
    kickoff: String,
    /// Number of exchanges (one reply from each agent).
    #[arg(short = 'n', long, default_value_t = 5)]
    exchanges: usize,
    /// Agent 1 type: claude, grok or pascal.
    #[arg(long)]
    agent1: Option<String>,
    #[arg(long)]
    agent1_name: Option<String>,
    /// Model id or catalog label for agent 1.
    #[arg(long)]
    agent1_model: Option<String>,
    /// Agent 2 type: claude, grok or pascal.
    #[arg(long)]
    agent2: Option<String>,
    #[arg(long)]
    agent2_name: Option<String>,
    /// Model id or catalog label for agent 2.
    #[arg(long)]
    agent2_model: Option<String>,
    /// Seconds to pause between turns.
    #[arg(long)]
    delay: Option<u64>,
    /// Hydrate prompts from and write the run to persistent memory.
    #[arg(long)]
    memory: bool,
    /// Hydration topic; defaults to the kickoff message.
    #[arg(long)]
    topic: Option<String>,
    /// Send Grok agents with their own key through the shared router.
    #[arg(long)]
    no_direct_routing: bool,
    #[command(flatten)]
    keys: AgentKeys,
    /// Save the finished run under this name so it can be resumed.
    #[arg(long)]
    save: Option<String>,
    /// Write the rendered transcript to this file.
    #[arg(long)]
    transcript: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Name the conversation was saved under.
    name: String,
    /// Additional exchanges to run.
    #[arg(short = 'n', long, default_value_t = 3)]
    exchanges: usize,
    #[command(flatten)]
    keys: AgentKeys,
    /// Save under a different name instead of updating the original.
    #[arg(long)]
    save_as: Option<String>,
    #[arg(long)]
    transcript: Option<PathBuf>,
}

enum Mode {
    Start { kickoff: String, exchanges: usize },
    Resume { exchanges: usize },
}

pub async fn run(app: AppConfig, args: RunArgs) -> Result<()> {
    let mut relay = app.relay.clone();
    apply_overrides(&mut relay, &args)?;

    let engine = build_engine(&app, relay).await?;
    let engine = drive(
        engine,
        Mode::Start {
            kickoff: args.kickoff.clone(),
            exchanges: args.exchanges,
        },
    )
    .await?;

    finish(&engine, args.save.as_deref(), args.transcript.as_ref())
}

pub async fn resume(app: AppConfig, args: ResumeArgs) -> Result<()> {
    let store = open_conversations()?;
    let Some(record) = store.load(&args.name)? else {
        bail!("no saved conversation named '{}'", args.name);
    };

    let mut relay: RelayConfig = serde_json::from_value(record.config.clone())
        .context("saved relay configuration is unreadable")?;
    apply_keys(&mut relay, &args.keys);

    let mut engine = build_engine(&app, relay).await?;
    engine
        .load_state(record.state)
        .context("saved relay state is inconsistent")?;

    let engine = drive(
        engine,
        Mode::Resume {
            exchanges: args.exchanges,
        },
    )
    .await?;

    let name = args.save_as.as_deref().unwrap_or(&args.name);
    finish(&engine, Some(name), args.transcript.as_ref())
}

fn apply_overrides(relay: &mut RelayConfig, args: &RunArgs) -> Result<()> {
    let agents = [
        (&args.agent1, &args.agent1_name, &args.agent1_model),
        (&args.agent2, &args.agent2_name, &args.agent2_model),
    ];
    for (index, (kind, name, model)) in agents.into_iter().enumerate() {
        let agent = if index == 0 {
            &mut relay.agent1
        } else {
            &mut relay.agent2
        };
        if let Some(kind) = kind {
            let Some(kind) = AgentKind::parse(kind) else {
                bail!("unknown agent type '{kind}' (expected claude, grok or pascal)");
            };
            if kind != agent.kind() {
                agent.profile.kind = kind;
                agent.profile.name = kind.label().to_string();
                agent.profile.model = constellation_agents::default_model(kind).to_string();
            }
        }
        if let Some(name) = name {
            agent.profile.name = name.clone();
        }
        if let Some(model) = model {
            agent.profile.model = resolve_model(agent.kind(), model);
        }
    }

    if let Some(delay) = args.delay {
        relay.delay_seconds = delay;
    }
    if args.memory {
        relay.use_persistent_memory = true;
    }
    if args.no_direct_routing {
        relay.use_alternate_credential_routing = false;
    }
    if args.topic.is_some() {
        relay.topic = args.topic.clone();
    }
    apply_keys(relay, &args.keys);
    Ok(())
}

fn apply_keys(relay: &mut RelayConfig, keys: &AgentKeys) {
    if let Some(key) = &keys.agent1_key {
        relay.agent1.credential = Some(key.clone());
    }
    if let Some(key) = &keys.agent2_key {
        relay.agent2.credential = Some(key.clone());
    }
}

async fn build_engine(app: &AppConfig, relay: RelayConfig) -> Result<RelayEngine> {
    for agent in [&relay.agent1, &relay.agent2] {
        if let Some(key) = agent.credential() {
            info!("{} uses its own key {}", agent.name(), mask_secret(key));
        }
    }
    let gateway = Arc::new(
        ProviderGateway::new(app.gateway.clone())
            .with_alternate_routing(relay.use_alternate_credential_routing),
    );
    let memory = if relay.use_persistent_memory {
        open_memory(&app.memory)?
    } else {
        None
    };

    RelayEngine::new(relay, gateway, memory)
        .await
        .context("relay could not be configured")
}

fn open_memory(config: &MemoryConfig) -> Result<Option<Arc<dyn MemoryProvider>>> {
    if !config.enabled {
        warn!("persistent memory requested but disabled in configuration");
        return Ok(None);
    }
    let path = config.resolved_database_path();
    ensure_parent_dir(&path)?;

    let options = HydrateOptions {
        memory_limit: config.memory_limit,
        include_archive: config.include_archive,
        compact: config.compact,
        diary_budget: config.diary_budget_chars,
    };
    let store = Arc::new(MemoryStore::lazy(&path));
    Ok(Some(Arc::new(PersistentMemory::new(store, options))))
}

pub fn open_conversations() -> Result<ConversationStore> {
    let path = conversations_db_path();
    ensure_parent_dir(&path)?;
    ConversationStore::open(&path).context("failed to open saved conversations")
}

/// Run the engine on a worker task and print its messages as they arrive.
/// Ctrl-C asks the worker to stop at the next turn boundary.
async fn drive(mut engine: RelayEngine, mode: Mode) -> Result<RelayEngine> {
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();

    let interrupt = Arc::clone(&stop);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nstopping after the current turn...");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let flag = Arc::clone(&stop);
    let worker = tokio::spawn(async move {
        let on_message = move |speaker: &str, content: &str| {
            let _ = tx.send((speaker.to_string(), content.to_string()));
        };
        let check_stop = move || flag.load(Ordering::SeqCst);
        let result = match mode {
            Mode::Start { kickoff, exchanges } => {
                engine.start(&kickoff, exchanges, on_message, check_stop).await
            }
            Mode::Resume { exchanges } => engine.resume(exchanges, on_message, check_stop).await,
        };
        (engine, result)
    });

    while let Some((speaker, content)) = rx.recv().await {
        print_message(&speaker, &content);
    }

    let (engine, result) = worker.await.context("relay worker panicked")?;
    ctrl_c.abort();
    result?;

    info!(
        conversation_id = %engine.conversation_id(),
        status = %engine.status(),
        "relay finished"
    );
    Ok(engine)
}

fn print_message(speaker: &str, content: &str) {
    if speaker == SYSTEM_SPEAKER {
        println!("--- {content} ---\n");
    } else {
        println!("{speaker}:\n{content}\n");
    }
}

fn finish(engine: &RelayEngine, save: Option<&str>, transcript: Option<&PathBuf>) -> Result<()> {
    let turns = engine
        .transcript()
        .iter()
        .filter(|entry: &&TranscriptEntry| !entry.is_system())
        .count();
    let outcome = match engine.status() {
        RelayStatus::Completed if engine.naturally_ended() => "ended naturally",
        RelayStatus::Completed => "completed",
        RelayStatus::Stopped => "stopped",
        RelayStatus::Failed => "failed",
        RelayStatus::Idle | RelayStatus::Running => "incomplete",
    };
    println!("Conversation {outcome} after {turns} turn(s).");

    if let Some(path) = transcript {
        ensure_parent_dir(path)?;
        std::fs::write(path, engine.transcript_text())
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Transcript written to {}", path.display());
    }

    if let Some(name) = save {
        let store = open_conversations()?;
        let record = ConversationRecord {
            name: name.to_string(),
            created_at: Utc::now(),
            state: engine.get_state(),
            config: engine.config().persisted_json(),
        };
        store.save(&record)?;
        println!("Saved as '{name}'. Continue with: constellation resume {name}");
    }

    if engine.status() == RelayStatus::Failed {
        bail!("relay failed; see the last System entry for details");
    }
    Ok(())
}
